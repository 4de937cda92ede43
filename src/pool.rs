//! The connection pool: a bounded, keep-alive-aware multiplexer
//! coordinating concurrent requests over a limited set of connections.
//!
//! All bookkeeping happens under one mutex that is never held across
//! I/O; dialing and request exchange happen after the lock is released.
//! Pending requests wait on one-shot signals and are woken in FIFO order
//! as capacity frees up.

use std::{
    any::Any,
    fmt,
    net::IpAddr,
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

use bytes::Bytes;
use log::trace;
use rustls::ClientConfig;
use tokio::sync::oneshot;

use crate::{
    backend::{NetworkBackend, SocketOption, TokioBackend},
    connection::{ConnectConfig, Connection, HttpConnection},
    error::{Error, Result},
    model::{Body, Extensions, IntoUrl, Origin, Request, Response, Timeouts, Trace, Url},
    proxy::{ForwardConnection, Proxy, ProxyMode, TunnelConnection},
    Scheme,
};

const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Tracks one in-flight request: its queue position, its connection
/// binding, and the signal used to wake it when it must wait.
pub(crate) struct RequestStatus {
    pub(crate) origin: Origin,
    state: StdMutex<StatusState>,
}

struct StatusState {
    connection: Option<Arc<dyn Connection>>,
    waiter: Option<oneshot::Sender<()>>,
}

impl RequestStatus {
    fn new(origin: Origin) -> RequestStatus {
        RequestStatus {
            origin,
            state: StdMutex::new(StatusState {
                connection: None,
                waiter: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StatusState> {
        self.state.lock().expect("request status lock poisoned")
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.state().connection.clone()
    }

    fn set_connection(&self, conn: Arc<dyn Connection>) {
        self.state().connection = Some(conn);
    }

    fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        self.state().connection.take()
    }

    fn reset_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state().waiter = Some(tx);
        rx
    }

    fn wake(&self) {
        if let Some(waiter) = self.state().waiter.take() {
            let _ = waiter.send(());
        }
    }
}

struct PoolState {
    /// Ordered front-to-back from least- to most-recently used.
    connections: Vec<Arc<dyn Connection>>,
    /// Pending and in-flight requests, in arrival order.
    requests: Vec<Arc<RequestStatus>>,
    closed: bool,
}

struct PoolInner {
    connect: Arc<ConnectConfig>,
    proxy: Option<Proxy>,
    max_connections: usize,
    max_keepalive_connections: usize,
    state: StdMutex<PoolState>,
}

/// A bounded pool of keep-alive HTTP connections.
///
/// Cloning is cheap and shares the pool. Requests to arbitrary origins
/// compete fairly for at most `max_connections` live connections;
/// responses release their connection back to the pool when closed or
/// dropped.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// A pool with default configuration.
    pub fn new() -> ConnectionPool {
        ConnectionPool::builder().build()
    }

    /// Start configuring a pool.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Start building a request.
    ///
    /// `send()` performs the one-shot read-and-close operation;
    /// `stream()` returns a response whose body is consumed by the
    /// caller and whose drop releases the connection.
    pub fn request(&self, method: impl Into<Bytes>, url: impl IntoUrl) -> RequestBuilder {
        RequestBuilder {
            pool: self.clone(),
            method: method.into(),
            url: url.into_url(),
            headers: Vec::new(),
            body: Body::Empty,
            extensions: Extensions::new(),
        }
    }

    /// Send a fully formed request through the pool.
    ///
    /// The caller is responsible for the request being complete (`Host`
    /// header, body framing); see [`Request::normalize`].
    pub async fn handle_request(&self, mut request: Request) -> Result<Response> {
        let origin = request.url.origin();
        let pool_timeout = request
            .extensions
            .get::<Timeouts>()
            .map(|t| t.pool)
            .unwrap_or(None);

        let status = Arc::new(RequestStatus::new(origin));
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(Error::closed());
            }
            state.requests.push(status.clone());
        }

        // From here on the status must leave the queue on every exit
        // path; the guard runs the cleanup in drop, where cancellation
        // cannot reach it.
        let mut cleanup = CleanupGuard {
            inner: self.inner.clone(),
            status: status.clone(),
            armed: true,
        };

        let result = self.drive(&status, &mut request, pool_timeout).await;
        match result {
            Ok(mut response) => {
                cleanup.armed = false;
                let guard: Box<dyn Any + Send> = Box::new(PoolGuard {
                    inner: Arc::downgrade(&self.inner),
                    status,
                });
                response.body_mut().attach_guard(guard);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(
        &self,
        status: &Arc<RequestStatus>,
        request: &mut Request,
        pool_timeout: Option<Duration>,
    ) -> Result<Response> {
        loop {
            let (conn, to_close) = {
                let mut state = self.inner.lock_state();
                if state.closed {
                    return Err(Error::closed());
                }
                let mut to_close = self.inner.sweep(&mut state);
                let conn = match status.connection() {
                    Some(conn) => Some(conn),
                    None => self.inner.assign(&mut state, status, &mut to_close),
                };
                (conn, to_close)
            };
            for conn in to_close {
                conn.close();
            }

            let conn = match conn {
                Some(conn) => conn,
                None => {
                    let waiter = status.reset_waiter();
                    trace!("request for {} waiting for pool capacity", status.origin);
                    match pool_timeout {
                        Some(duration) => match tokio::time::timeout(duration, waiter).await {
                            Ok(_) => {}
                            Err(_) => return Err(Error::pool_timeout()),
                        },
                        // A dropped waiter just re-enters selection.
                        None => {
                            let _ = waiter.await;
                        }
                    }
                    continue;
                }
            };

            match conn.handle_request(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_new_connection_required() => {
                    trace!(
                        "connection could not take request for {}, requeueing",
                        status.origin
                    );
                    if let Some(stale) = status.take_connection() {
                        let mut state = self.inner.lock_state();
                        if stale.is_closed() {
                            state.connections.retain(|c| !Arc::ptr_eq(c, &stale));
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Diagnostic lines for every connection currently in the pool.
    pub fn connection_info(&self) -> Vec<String> {
        self.inner
            .lock_state()
            .connections
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Close every connection and refuse further requests.
    pub fn close(&self) {
        let connections = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            for status in &state.requests {
                status.wake();
            }
            std::mem::take(&mut state.connections)
        };
        for conn in connections {
            conn.close();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("ConnectionPool")
            .field("connections", &state.connections.len())
            .field("requests", &state.requests.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl PoolInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool lock poisoned")
    }

    /// Purge closed and expired connections, then enforce the idle
    /// keep-alive cap. Runs under the pool lock; returns connections to
    /// close outside it.
    fn sweep(&self, state: &mut PoolState) -> Vec<Arc<dyn Connection>> {
        let mut to_close = Vec::new();
        state.connections.retain(|conn| {
            if conn.is_closed() {
                trace!("removing closed connection {}", conn.info());
                false
            } else if conn.has_expired() {
                trace!("removing expired connection {}", conn.info());
                to_close.push(conn.clone());
                false
            } else {
                true
            }
        });

        let idle = state.connections.iter().filter(|c| c.is_idle()).count();
        let mut excess = idle.saturating_sub(self.max_keepalive_connections);
        let mut i = 0;
        while excess > 0 && i < state.connections.len() {
            if state.connections[i].is_idle() {
                let conn = state.connections.remove(i);
                trace!("evicting idle connection over keep-alive cap {}", conn.info());
                to_close.push(conn);
                excess -= 1;
            } else {
                i += 1;
            }
        }
        to_close
    }

    /// Selection rules, first match wins: reuse a matching available
    /// connection; create one under capacity; evict an idle
    /// foreign-origin connection at capacity. Returns `None` when the
    /// status must wait.
    fn assign(
        &self,
        state: &mut PoolState,
        status: &Arc<RequestStatus>,
        to_close: &mut Vec<Arc<dyn Connection>>,
    ) -> Option<Arc<dyn Connection>> {
        let origin = &status.origin;

        if let Some(idx) = state
            .connections
            .iter()
            .position(|c| c.can_handle_request(origin) && c.is_available())
        {
            // Rotate a single-exchange connection to the back so reuse
            // spreads across the pool.
            let conn = if state.connections[idx].is_idle() {
                let conn = state.connections.remove(idx);
                state.connections.push(conn.clone());
                conn
            } else {
                state.connections[idx].clone()
            };
            trace!("reusing connection {}", conn.info());
            status.set_connection(conn.clone());
            return Some(conn);
        }

        if state.connections.len() >= self.max_connections {
            // At capacity: evict the least-recently-used idle connection
            // serving some other origin.
            let idx = state
                .connections
                .iter()
                .position(|c| c.is_idle() && !c.can_handle_request(origin))?;
            let evicted = state.connections.remove(idx);
            trace!("evicting {} to make room for {origin}", evicted.info());
            to_close.push(evicted);
        }

        let conn = self.create_connection(origin.clone());
        trace!("created connection for {origin}");
        state.connections.push(conn.clone());
        status.set_connection(conn.clone());
        Some(conn)
    }

    fn create_connection(&self, origin: Origin) -> Arc<dyn Connection> {
        match &self.proxy {
            Some(proxy)
                if proxy.routing_mode() == ProxyMode::Forward
                    || (proxy.routing_mode() == ProxyMode::Default
                        && origin.scheme == Scheme::Http) =>
            {
                Arc::new(ForwardConnection::new(proxy, origin, &self.connect))
            }
            Some(proxy) => Arc::new(TunnelConnection::new(proxy, origin, &self.connect)),
            None => Arc::new(HttpConnection::new(origin, self.connect.clone())),
        }
    }

    /// After a response closes (or a request is torn down), hand freed
    /// capacity to pending requests in FIFO order. Stops at the first
    /// pending request that still cannot proceed.
    fn wake_pending(&self, state: &mut PoolState) -> Vec<Arc<dyn Connection>> {
        let mut to_close = Vec::new();
        if state.closed {
            return to_close;
        }
        let pending: Vec<Arc<RequestStatus>> = state
            .requests
            .iter()
            .filter(|s| s.connection().is_none())
            .cloned()
            .collect();
        for status in pending {
            if self.assign(state, &status, &mut to_close).is_some() {
                status.wake();
            } else {
                break;
            }
        }
        to_close
    }

    /// Remove a finished or abandoned request from the queue, drop its
    /// connection binding (discarding the connection if it closed), and
    /// wake whoever can now proceed.
    fn release(&self, status: &Arc<RequestStatus>) {
        let to_close = {
            let mut state = self.lock_state();
            if let Some(conn) = status.take_connection() {
                if conn.is_closed() {
                    state.connections.retain(|c| !Arc::ptr_eq(c, &conn));
                }
            }
            state.requests.retain(|s| !Arc::ptr_eq(s, status));
            self.wake_pending(&mut state)
        };
        for conn in to_close {
            conn.close();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("pool lock poisoned");
        for conn in state.connections.drain(..) {
            conn.close();
        }
    }
}

/// Runs the queue-removal cleanup when a request errors or is cancelled
/// between enqueue and completion. Drop code cannot be interrupted, which
/// is what shields the cleanup from cancellation.
struct CleanupGuard {
    inner: Arc<PoolInner>,
    status: Arc<RequestStatus>,
    armed: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.status);
        }
    }
}

/// Attached to a response body; notifies the pool when the response is
/// closed or dropped.
struct PoolGuard {
    inner: Weak<PoolInner>,
    status: Arc<RequestStatus>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.status);
        }
    }
}

// ===== builders =====

/// Configures a [`ConnectionPool`].
pub struct PoolBuilder {
    max_connections: usize,
    max_keepalive_connections: Option<usize>,
    keepalive_expiry: Option<Duration>,
    http1: bool,
    http2: bool,
    retries: u32,
    local_address: Option<IpAddr>,
    #[cfg(unix)]
    uds: Option<PathBuf>,
    socket_options: Vec<SocketOption>,
    tls_config: Option<Arc<ClientConfig>>,
    backend: Option<Arc<dyn NetworkBackend>>,
    proxy: Option<Proxy>,
}

impl PoolBuilder {
    fn new() -> PoolBuilder {
        PoolBuilder {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_keepalive_connections: None,
            keepalive_expiry: None,
            http1: true,
            http2: false,
            retries: 0,
            local_address: None,
            #[cfg(unix)]
            uds: None,
            socket_options: Vec::new(),
            tls_config: None,
            backend: None,
            proxy: None,
        }
    }

    /// Maximum number of live connections. Defaults to 10.
    pub fn max_connections(mut self, max: usize) -> PoolBuilder {
        self.max_connections = max.max(1);
        self
    }

    /// Maximum number of idle keep-alive connections retained. Defaults
    /// to `max_connections`.
    pub fn max_keepalive_connections(mut self, max: usize) -> PoolBuilder {
        self.max_keepalive_connections = Some(max);
        self
    }

    /// How long an idle connection may be kept before expiring. Unset
    /// means idle connections never expire.
    pub fn keepalive_expiry(mut self, expiry: Duration) -> PoolBuilder {
        self.keepalive_expiry = Some(expiry);
        self
    }

    /// Allow HTTP/1.1. Defaults to true.
    pub fn http1(mut self, enabled: bool) -> PoolBuilder {
        self.http1 = enabled;
        self
    }

    /// Allow HTTP/2 (offered via ALPN, or used directly over plaintext
    /// when HTTP/1.1 is disabled). Defaults to false.
    pub fn http2(mut self, enabled: bool) -> PoolBuilder {
        self.http2 = enabled;
        self
    }

    /// Connection-establishment retries, with exponential backoff.
    /// Defaults to 0.
    pub fn retries(mut self, retries: u32) -> PoolBuilder {
        self.retries = retries;
        self
    }

    /// Local address to bind before connecting.
    pub fn local_address(mut self, addr: IpAddr) -> PoolBuilder {
        self.local_address = Some(addr);
        self
    }

    /// Connect through a Unix-domain socket instead of TCP.
    #[cfg(unix)]
    pub fn uds(mut self, path: impl Into<PathBuf>) -> PoolBuilder {
        self.uds = Some(path.into());
        self
    }

    /// Socket options applied before connecting.
    pub fn socket_options(mut self, options: Vec<SocketOption>) -> PoolBuilder {
        self.socket_options = options;
        self
    }

    /// TLS configuration for https origins. ALPN protocols are set from
    /// the pool's HTTP version flags.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> PoolBuilder {
        self.tls_config = Some(config);
        self
    }

    /// Network backend used to dial transports.
    pub fn network_backend(mut self, backend: Arc<dyn NetworkBackend>) -> PoolBuilder {
        self.backend = Some(backend);
        self
    }

    /// Route requests through an HTTP proxy.
    pub fn proxy(mut self, proxy: Proxy) -> PoolBuilder {
        self.proxy = Some(proxy);
        self
    }

    /// Build the pool.
    pub fn build(self) -> ConnectionPool {
        let max_keepalive = self
            .max_keepalive_connections
            .unwrap_or(self.max_connections)
            .min(self.max_connections);
        let connect = Arc::new(ConnectConfig {
            keepalive_expiry: self.keepalive_expiry,
            http1: self.http1,
            http2: self.http2,
            retries: self.retries,
            local_address: self.local_address,
            #[cfg(unix)]
            uds: self.uds,
            socket_options: self.socket_options,
            tls_config: self.tls_config,
            backend: self.backend.unwrap_or_else(|| Arc::new(TokioBackend)),
        });
        ConnectionPool {
            inner: Arc::new(PoolInner {
                connect,
                proxy: self.proxy,
                max_connections: self.max_connections,
                max_keepalive_connections: max_keepalive,
                state: StdMutex::new(PoolState {
                    connections: Vec::new(),
                    requests: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("max_connections", &self.max_connections)
            .field("http1", &self.http1)
            .field("http2", &self.http2)
            .finish()
    }
}

/// Builds and sends one request through a [`ConnectionPool`].
#[derive(Debug)]
pub struct RequestBuilder {
    pool: ConnectionPool,
    method: Bytes,
    url: Result<Url>,
    headers: Vec<(Bytes, Bytes)>,
    body: Body,
    extensions: Extensions,
}

impl RequestBuilder {
    /// Append a header.
    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> RequestBuilder {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Body>) -> RequestBuilder {
        self.body = body.into();
        self
    }

    /// Set per-operation timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> RequestBuilder {
        self.extensions.insert(timeouts);
        self
    }

    /// Attach a trace sink receiving protocol milestones.
    pub fn trace(mut self, trace: Trace) -> RequestBuilder {
        self.extensions.insert(trace);
        self
    }

    /// Attach an arbitrary request extension.
    pub fn extension<T: Send + Sync + 'static>(mut self, value: T) -> RequestBuilder {
        self.extensions.insert(value);
        self
    }

    fn into_request(self) -> Result<(ConnectionPool, Request)> {
        let url = self.url?;
        let mut request = Request::new(self.method, url);
        request.headers = self.headers;
        request.body = self.body;
        request.extensions = self.extensions;
        request.normalize();
        Ok((self.pool, request))
    }

    /// Send the request, drain the body, and return the closed response
    /// with its content cached.
    pub async fn send(self) -> Result<Response> {
        let (pool, request) = self.into_request()?;
        let mut response = pool.handle_request(request).await?;
        response.read().await?;
        Ok(response)
    }

    /// Send the request and return the open response; the body is
    /// consumed by the caller, and dropping the response releases the
    /// connection.
    pub async fn stream(self) -> Result<Response> {
        let (pool, request) = self.into_request()?;
        pool.handle_request(request).await
    }
}
