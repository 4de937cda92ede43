//! The connection capability set shared by every connection variant, and
//! the generic connection that dials lazily and selects a protocol.

use std::{
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, trace};
use rustls::ClientConfig;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    backend::{alpn_protocols, NetworkBackend, NetworkStream, SocketOption, TlsParams},
    error::{Error, Result},
    model::{Origin, Request, Response, Scheme, SniHostname, Timeouts, Trace},
    proto::{h1::Http1Connection, h2::Http2Connection},
};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// The capability set of a pooled connection.
///
/// The pool coordinates connections purely through this interface and
/// never inspects the concrete variant behind it.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Drive one request/response exchange.
    ///
    /// The request is borrowed mutably so its one-shot parts (the body)
    /// can be consumed in place; on the internal requeue signal nothing
    /// has been consumed and the request can be retried elsewhere.
    async fn handle_request(&self, request: &mut Request) -> Result<Response>;

    /// Close the connection, releasing its transport.
    fn close(&self);

    /// A human-readable diagnostic line for this connection.
    fn info(&self) -> String;

    /// Whether this connection could serve a request to `origin` right now.
    fn can_handle_request(&self, origin: &Origin) -> bool;

    /// Whether the connection can accept an outgoing request.
    ///
    /// An HTTP/1.1 connection is available only between exchanges; an
    /// HTTP/2 connection is available while it is not closing. A
    /// connection that has not dialed yet is treated as available, and may
    /// later report that a new connection is required instead.
    fn is_available(&self) -> bool;

    /// Whether the keep-alive expiry on an idle connection has passed.
    fn has_expired(&self) -> bool;

    /// Whether the connection is idle (no exchange or stream in flight).
    fn is_idle(&self) -> bool;

    /// Whether the connection has been closed and must leave the pool.
    fn is_closed(&self) -> bool;
}

/// Everything needed to dial and upgrade a transport, shared by the pool
/// and its connections.
pub(crate) struct ConnectConfig {
    pub(crate) keepalive_expiry: Option<Duration>,
    pub(crate) http1: bool,
    pub(crate) http2: bool,
    pub(crate) retries: u32,
    pub(crate) local_address: Option<IpAddr>,
    #[cfg(unix)]
    pub(crate) uds: Option<PathBuf>,
    pub(crate) socket_options: Vec<SocketOption>,
    pub(crate) tls_config: Option<Arc<ClientConfig>>,
    pub(crate) backend: Arc<dyn NetworkBackend>,
}

impl ConnectConfig {
    /// TLS configuration with the ALPN list this config's protocol flags
    /// call for.
    pub(crate) fn tls_config_with_alpn(&self) -> Arc<ClientConfig> {
        let alpn = alpn_protocols(self.http2);
        match &self.tls_config {
            Some(config) => {
                let mut config = (**config).clone();
                config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
                Arc::new(config)
            }
            None => crate::backend::default_tls_config(alpn),
        }
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("http1", &self.http1)
            .field("http2", &self.http2)
            .field("retries", &self.retries)
            .finish()
    }
}

/// A connection that dials on first use and morphs into the negotiated
/// protocol.
///
/// Until the first request dials, the pool sees it as maximally
/// available; afterwards every predicate delegates to the inner HTTP/1.1
/// or HTTP/2 connection.
pub(crate) struct HttpConnection {
    origin: Origin,
    config: Arc<ConnectConfig>,
    inner: StdMutex<Option<Arc<dyn Connection>>>,
    connect_lock: AsyncMutex<()>,
    connect_failed: AtomicBool,
}

impl HttpConnection {
    pub(crate) fn new(origin: Origin, config: Arc<ConnectConfig>) -> HttpConnection {
        HttpConnection {
            origin,
            config,
            inner: StdMutex::new(None),
            connect_lock: AsyncMutex::new(()),
            connect_failed: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> Option<Arc<dyn Connection>> {
        self.inner.lock().expect("connection lock poisoned").clone()
    }

    async fn connect(&self, request: &Request) -> Result<Arc<dyn Connection>> {
        let timeouts = request
            .extensions
            .get::<Timeouts>()
            .copied()
            .unwrap_or_default();
        let trace_sink = request.extensions.get::<Trace>().cloned();

        let mut retries_left = self.config.retries;
        let mut delay = RETRY_BACKOFF_BASE;
        let stream = loop {
            match self.dial(request, &timeouts, trace_sink.as_ref()).await {
                Ok(stream) => break stream,
                Err(e) if retries_left > 0 && (e.is_connect() || e.is_connect_timeout()) => {
                    retries_left -= 1;
                    debug!(
                        "retrying connection to {} in {:?}: {e}",
                        self.origin, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        };

        let http2_negotiated = stream
            .tls_info()
            .and_then(|info| info.alpn_protocol)
            .map_or(false, |alpn| alpn == "h2");
        trace!(
            "connection to {} established, http2_negotiated={http2_negotiated}",
            self.origin
        );

        let conn: Arc<dyn Connection> = if http2_negotiated
            || (self.config.http2 && !self.config.http1)
        {
            Arc::new(
                Http2Connection::new(self.origin.clone(), stream, self.config.keepalive_expiry)
                    .await?,
            )
        } else {
            Arc::new(Http1Connection::new(
                self.origin.clone(),
                stream,
                self.config.keepalive_expiry,
            ))
        };
        Ok(conn)
    }

    async fn dial(
        &self,
        request: &Request,
        timeouts: &Timeouts,
        trace_sink: Option<&Trace>,
    ) -> Result<Box<dyn NetworkStream>> {
        #[cfg(unix)]
        let stream = match &self.config.uds {
            Some(path) => {
                if let Some(t) = trace_sink {
                    t.emit("connect_unix", &path.display().to_string());
                }
                self.config
                    .backend
                    .connect_unix(path, timeouts.connect, &self.config.socket_options)
                    .await?
            }
            None => self.dial_tcp(timeouts, trace_sink).await?,
        };
        #[cfg(not(unix))]
        let stream = self.dial_tcp(timeouts, trace_sink).await?;

        if self.origin.scheme != Scheme::Https {
            return Ok(stream);
        }

        let server_name = match request.extensions.get::<SniHostname>() {
            Some(sni) => std::str::from_utf8(&sni.0)
                .map_err(|_| Error::local_protocol("SNI hostname is not valid UTF-8"))?
                .to_owned(),
            None => self.origin.host_str().to_owned(),
        };
        if let Some(t) = trace_sink {
            t.emit("start_tls", &server_name);
        }
        let params = TlsParams {
            config: self.config.tls_config_with_alpn(),
            server_name,
        };
        let handshake = stream.start_tls(params);
        match timeouts.connect {
            Some(duration) => tokio::time::timeout(duration, handshake)
                .await
                .map_err(|_| Error::connect_timeout())?,
            None => handshake.await,
        }
    }

    async fn dial_tcp(
        &self,
        timeouts: &Timeouts,
        trace_sink: Option<&Trace>,
    ) -> Result<Box<dyn NetworkStream>> {
        let host = self.origin.host_str().to_owned();
        if let Some(t) = trace_sink {
            t.emit("connect_tcp", &format!("{host}:{}", self.origin.port));
        }
        self.config
            .backend
            .connect_tcp(
                &host,
                self.origin.port,
                timeouts.connect,
                self.config.local_address,
                &self.config.socket_options,
            )
            .await
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn handle_request(&self, request: &mut Request) -> Result<Response> {
        let conn = match self.inner() {
            Some(conn) => conn,
            None => {
                let _connecting = self.connect_lock.lock().await;
                match self.inner() {
                    // Another request raced us through the dial.
                    Some(conn) => conn,
                    None => match self.connect(request).await {
                        Ok(conn) => {
                            *self.inner.lock().expect("connection lock poisoned") =
                                Some(conn.clone());
                            conn
                        }
                        Err(e) => {
                            self.connect_failed.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    },
                }
            }
        };
        conn.handle_request(request).await
    }

    fn close(&self) {
        match self.inner() {
            Some(conn) => conn.close(),
            None => self.connect_failed.store(true, Ordering::SeqCst),
        }
    }

    fn info(&self) -> String {
        match self.inner() {
            Some(conn) => conn.info(),
            None => format!("{}, CONNECTING", self.origin),
        }
    }

    fn can_handle_request(&self, origin: &Origin) -> bool {
        *origin == self.origin
    }

    fn is_available(&self) -> bool {
        match self.inner() {
            Some(conn) => conn.is_available(),
            // Before dialing we only advertise availability when the
            // connection could come up as HTTP/2 and so serve several
            // requests. If it then resolves to HTTP/1.1, surplus
            // requests are requeued by the pool.
            None => {
                self.config.http2
                    && (self.origin.scheme == Scheme::Https || !self.config.http1)
                    && !self.connect_failed.load(Ordering::SeqCst)
            }
        }
    }

    fn has_expired(&self) -> bool {
        match self.inner() {
            Some(conn) => conn.has_expired(),
            None => self.connect_failed.load(Ordering::SeqCst),
        }
    }

    fn is_idle(&self) -> bool {
        match self.inner() {
            Some(conn) => conn.is_idle(),
            None => self.connect_failed.load(Ordering::SeqCst),
        }
    }

    fn is_closed(&self) -> bool {
        match self.inner() {
            Some(conn) => conn.is_closed(),
            None => self.connect_failed.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("origin", &self.origin.to_string())
            .field("dialed", &self.inner().is_some())
            .finish()
    }
}
