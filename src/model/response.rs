use std::{any::Any, fmt};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::extensions::Extensions;
use crate::error::Result;

/// A pull source of response body chunks, implemented per protocol.
#[async_trait]
pub(crate) trait BodyRead: Send {
    /// The next body chunk, or `None` once the body is complete.
    async fn chunk(&mut self) -> Result<Option<Bytes>>;
}

/// A not-yet-consumed response body.
///
/// Dropping the body before it has been drained tells the owning connection
/// that the exchange was abandoned; for HTTP/1.1 that closes the
/// connection, since the framing boundary is lost.
pub struct ResponseBody {
    // Dropped before `guard`, so the connection settles its state before
    // the pool is notified.
    reader: Option<Box<dyn BodyRead>>,
    guard: Option<Box<dyn Any + Send>>,
}

impl ResponseBody {
    pub(crate) fn new(reader: Box<dyn BodyRead>) -> ResponseBody {
        ResponseBody {
            reader: Some(reader),
            guard: None,
        }
    }

    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            reader: None,
            guard: None,
        }
    }

    pub(crate) fn attach_guard(&mut self, guard: Box<dyn Any + Send>) {
        self.guard = Some(guard);
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self.reader.as_mut() {
            Some(reader) => reader.chunk().await,
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("consumed", &self.reader.is_none())
            .finish()
    }
}

/// An HTTP response whose body may still be on the wire.
///
/// The body is streamed with [`Response::chunk`] or drained with
/// [`Response::read`]. Dropping (or [`Response::close`]-ing) the response
/// releases the underlying connection back to its pool.
#[derive(Debug)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Response headers in wire order.
    pub headers: Vec<(Bytes, Bytes)>,
    /// Out-of-band response data populated by the protocol layer.
    pub extensions: Extensions,
    body: ResponseBody,
    content: Option<Bytes>,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
        body: ResponseBody,
        extensions: Extensions,
    ) -> Response {
        Response {
            status,
            headers,
            extensions,
            body,
            content: None,
        }
    }

    /// The next body chunk, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Drain the body and return it as a single buffer.
    ///
    /// The content is cached: repeated calls return the same bytes.
    pub async fn read(&mut self) -> Result<Bytes> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        let content = buf.freeze();
        self.content = Some(content.clone());
        Ok(content)
    }

    /// Close the response, releasing the underlying connection.
    ///
    /// Dropping the response has the same effect; this just makes the
    /// point explicit at call sites.
    pub fn close(self) {}

    pub(crate) fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }
}
