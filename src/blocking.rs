//! A thread-blocking surface over the async pool.
//!
//! The design is identical to the async surface; every suspension point
//! becomes a blocking call driven by a runtime the pool owns.
//!
//! ```rust,no_run
//! # fn run() -> Result<(), tether::Error> {
//! let pool = tether::blocking::ConnectionPool::builder().build();
//! let response = pool.request("GET", "http://example.com/").send()?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    error::Result,
    model::{Body, Extensions, IntoUrl, Timeouts, Trace},
    pool::PoolBuilder,
};

/// A blocking handle on a [`crate::ConnectionPool`].
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: crate::ConnectionPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl ConnectionPool {
    /// A pool with default configuration.
    pub fn new() -> ConnectionPool {
        ConnectionPool::builder().build()
    }

    /// Start configuring a pool.
    pub fn builder() -> Builder {
        Builder {
            inner: crate::ConnectionPool::builder(),
        }
    }

    /// Start building a request; see [`RequestBuilder`].
    pub fn request(&self, method: impl Into<Bytes>, url: impl IntoUrl) -> RequestBuilder {
        RequestBuilder {
            pool: self.clone(),
            inner: self.inner.request(method, url),
        }
    }

    /// Diagnostic lines for every pooled connection.
    pub fn connection_info(&self) -> Vec<String> {
        self.inner.connection_info()
    }

    /// Close every connection and refuse further requests.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new()
    }
}

/// Configures a blocking [`ConnectionPool`]. Mirrors
/// [`crate::PoolBuilder`].
#[derive(Debug)]
pub struct Builder {
    inner: PoolBuilder,
}

impl Builder {
    /// Maximum number of live connections. Defaults to 10.
    pub fn max_connections(mut self, max: usize) -> Builder {
        self.inner = self.inner.max_connections(max);
        self
    }

    /// Maximum number of idle keep-alive connections retained.
    pub fn max_keepalive_connections(mut self, max: usize) -> Builder {
        self.inner = self.inner.max_keepalive_connections(max);
        self
    }

    /// How long an idle connection may be kept before expiring.
    pub fn keepalive_expiry(mut self, expiry: std::time::Duration) -> Builder {
        self.inner = self.inner.keepalive_expiry(expiry);
        self
    }

    /// Allow HTTP/1.1. Defaults to true.
    pub fn http1(mut self, enabled: bool) -> Builder {
        self.inner = self.inner.http1(enabled);
        self
    }

    /// Allow HTTP/2. Defaults to false.
    pub fn http2(mut self, enabled: bool) -> Builder {
        self.inner = self.inner.http2(enabled);
        self
    }

    /// Connection-establishment retries with exponential backoff.
    pub fn retries(mut self, retries: u32) -> Builder {
        self.inner = self.inner.retries(retries);
        self
    }

    /// Route requests through an HTTP proxy.
    pub fn proxy(mut self, proxy: crate::Proxy) -> Builder {
        self.inner = self.inner.proxy(proxy);
        self
    }

    /// Build the pool, spinning up its private runtime.
    pub fn build(self) -> ConnectionPool {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build blocking pool runtime");
        ConnectionPool {
            inner: self.inner.build(),
            runtime: Arc::new(runtime),
        }
    }
}

/// Builds and sends one request, blocking.
#[derive(Debug)]
pub struct RequestBuilder {
    pool: ConnectionPool,
    inner: crate::RequestBuilder,
}

impl RequestBuilder {
    /// Append a header.
    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> RequestBuilder {
        self.inner = self.inner.header(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Body>) -> RequestBuilder {
        self.inner = self.inner.body(body);
        self
    }

    /// Set per-operation timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> RequestBuilder {
        self.inner = self.inner.timeouts(timeouts);
        self
    }

    /// Attach a trace sink.
    pub fn trace(mut self, trace: Trace) -> RequestBuilder {
        self.inner = self.inner.trace(trace);
        self
    }

    /// Send the request, drain the body, and return the closed response.
    pub fn send(self) -> Result<Response> {
        let runtime = self.pool.runtime.clone();
        let inner = runtime.block_on(self.inner.send())?;
        Ok(Response { inner, runtime })
    }

    /// Send the request and return the open response for streaming.
    pub fn stream(self) -> Result<Response> {
        let runtime = self.pool.runtime.clone();
        let inner = runtime.block_on(self.inner.stream())?;
        Ok(Response { inner, runtime })
    }
}

/// A blocking response.
pub struct Response {
    inner: crate::Response,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Response {
    /// Status code.
    pub fn status(&self) -> u16 {
        self.inner.status
    }

    /// Response headers in wire order.
    pub fn headers(&self) -> &[(Bytes, Bytes)] {
        &self.inner.headers
    }

    /// Out-of-band response data.
    pub fn extensions(&self) -> &Extensions {
        &self.inner.extensions
    }

    /// The next body chunk, or `None` once the body is complete.
    pub fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.runtime.block_on(self.inner.chunk())
    }

    /// Drain the body and return it as a single buffer.
    pub fn read(&mut self) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read())
    }

    /// Close the response, releasing the underlying connection.
    pub fn close(self) {}
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}
