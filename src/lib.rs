#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

//! # tether
//!
//! The transport core of a minimal HTTP client: given a fully formed
//! request, obtain a live connection (direct, tunneled through HTTP
//! CONNECT, or forwarded through a proxy), speak HTTP/1.1 or HTTP/2 over
//! it, and return a response whose body can be streamed.
//!
//! - Bounded, keep-alive-aware [`ConnectionPool`] with fair FIFO
//!   admission across arbitrary origins
//! - HTTP/1.1 and HTTP/2 connection state machines with uniform
//!   lifecycle signals
//! - Forwarding and CONNECT-tunneling [`Proxy`] support, including TLS
//!   upgrade and ALPN protocol selection on the tunneled stream
//! - Pluggable network backends and per-request timeouts, SNI override,
//!   and trace hooks through the [`Extensions`] bag
//!
//! ## Making a request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), tether::Error> {
//! let pool = tether::ConnectionPool::builder()
//!     .max_connections(10)
//!     .http2(true)
//!     .build();
//!
//! let response = pool
//!     .request("GET", "https://www.rust-lang.org/")
//!     .send()
//!     .await?;
//!
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Streaming a response body
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), tether::Error> {
//! # let pool = tether::ConnectionPool::new();
//! let mut response = pool
//!     .request("GET", "http://example.com/large")
//!     .stream()
//!     .await?;
//! while let Some(chunk) = response.chunk().await? {
//!     println!("read {} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Dropping (or explicitly closing) a response returns its connection to
//! the pool, waking queued requests in arrival order.

pub mod backend;
mod connection;
mod error;
mod model;
mod pool;
mod proto;
mod proxy;

#[cfg(feature = "blocking")]
#[cfg_attr(docsrs, doc(cfg(feature = "blocking")))]
pub mod blocking;

pub use crate::{
    connection::Connection,
    error::{Error, Result},
    model::{
        merge_headers, Body, BodyStream, Extensions, HttpVersion, IntoUrl, NetworkStreamHandle,
        Origin, ReasonPhrase, Request, Response, ResponseBody, Scheme, SniHostname, StreamId,
        Timeouts, Trace, Url,
    },
    pool::{ConnectionPool, PoolBuilder, RequestBuilder},
    proxy::{Proxy, ProxyMode},
};
