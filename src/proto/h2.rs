//! The HTTP/2 connection: many concurrent logical streams multiplexed over
//! one byte stream, with framing, flow control and settings handled by the
//! `h2` codec.

use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future::poll_fn, StreamExt};
use h2::client::SendRequest;
use h2::RecvStream;
use log::{debug, trace};

use crate::{
    backend::NetworkStream,
    connection::Connection,
    error::{Error, Result},
    model::{
        header_value, Body, BodyRead, Extensions, HttpVersion, Origin, ReasonPhrase, Request,
        Response, ResponseBody, StreamId, Timeouts, Trace,
    },
};

// Connection-specific headers have no place in HTTP/2 messages.
const HOP_BY_HOP: &[&[u8]] = &[
    b"host",
    b"connection",
    b"keep-alive",
    b"proxy-connection",
    b"transfer-encoding",
    b"upgrade",
];

struct Shared {
    closed: bool,
    streams: usize,
    idle_at: Instant,
    request_count: u64,
}

/// An HTTP/2 connection bound to one origin over one stream.
pub(crate) struct Http2Connection {
    origin: Origin,
    keepalive_expiry: Option<Duration>,
    send: StdMutex<SendRequest<Bytes>>,
    shared: Arc<StdMutex<Shared>>,
    driver: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Http2Connection {
    /// Perform the client connection preface and settings exchange over
    /// the stream, spawning the codec's connection driver.
    pub(crate) async fn new(
        origin: Origin,
        stream: Box<dyn NetworkStream>,
        keepalive_expiry: Option<Duration>,
    ) -> Result<Http2Connection> {
        let (send, connection) = h2::client::handshake(stream)
            .await
            .map_err(map_h2_error)?;

        let shared = Arc::new(StdMutex::new(Shared {
            closed: false,
            streams: 0,
            idle_at: Instant::now(),
            request_count: 0,
        }));

        let driver_shared = shared.clone();
        let driver_origin = origin.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http/2 connection to {driver_origin} terminated: {e}");
            }
            driver_shared.lock().expect("h2 state lock poisoned").closed = true;
        });

        Ok(Http2Connection {
            origin,
            keepalive_expiry,
            send: StdMutex::new(send),
            shared,
            driver: StdMutex::new(Some(driver)),
        })
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("h2 state lock poisoned")
    }

    fn build_codec_request(&self, request: &Request) -> Result<http::Request<()>> {
        let authority = match header_value(&request.headers, b"host") {
            Some(host) => String::from_utf8_lossy(host).into_owned(),
            None => String::from_utf8_lossy(&request.url.host_header_value()).into_owned(),
        };
        let target = std::str::from_utf8(&request.url.target)
            .map_err(|_| Error::local_protocol("request target is not valid UTF-8"))?;
        let uri = http::Uri::builder()
            .scheme(self.origin.scheme.as_str())
            .authority(authority)
            .path_and_query(target)
            .build()
            .map_err(Error::local_protocol)?;

        let mut builder = http::Request::builder()
            .method(
                http::Method::from_bytes(&request.method).map_err(Error::local_protocol)?,
            )
            .uri(uri)
            .version(http::Version::HTTP_2);
        for (name, value) in &request.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(&name[..], &value[..]);
        }
        builder.body(()).map_err(Error::local_protocol)
    }
}

#[async_trait]
impl Connection for Http2Connection {
    async fn handle_request(&self, request: &mut Request) -> Result<Response> {
        if self.shared().closed {
            return Err(Error::new_connection_required());
        }
        let timeouts = request
            .extensions
            .get::<Timeouts>()
            .copied()
            .unwrap_or_default();
        let trace_sink = request.extensions.get::<Trace>().cloned();

        let codec_request = self.build_codec_request(request)?;
        let end_stream = request.body.is_empty();

        let send = self.send.lock().expect("h2 send lock poisoned").clone();
        let mut send = send.ready().await.map_err(|e| self.fail_send(e))?;
        let (response_fut, mut send_stream) = send
            .send_request(codec_request, end_stream)
            .map_err(|e| self.fail_send(e))?;
        trace!(
            "{} {} multiplexed on {}",
            String::from_utf8_lossy(&request.method),
            request.url,
            self.origin
        );
        if let Some(t) = &trace_sink {
            t.emit("send_request_headers", &format!("{}", request.url));
        }

        let open = OpenStream::begin(&self.shared);

        if !end_stream {
            send_body(&mut send_stream, std::mem::take(&mut request.body)).await?;
        }
        if let Some(t) = &trace_sink {
            t.emit("send_request_body", "complete");
        }

        let response = match timeouts.read {
            Some(duration) => tokio::time::timeout(duration, response_fut)
                .await
                .map_err(|_| Error::read_timeout())?
                .map_err(map_h2_error)?,
            None => response_fut.await.map_err(map_h2_error)?,
        };
        if let Some(t) = &trace_sink {
            t.emit(
                "receive_response_headers",
                &format!("{}", response.status().as_u16()),
            );
        }

        let status = response.status().as_u16();
        let headers: Vec<(Bytes, Bytes)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    Bytes::copy_from_slice(name.as_str().as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();
        let recv = response.into_body();

        let mut extensions = Extensions::new();
        extensions.insert(HttpVersion(Bytes::from_static(b"HTTP/2")));
        extensions.insert(ReasonPhrase(Bytes::new()));
        extensions.insert(StreamId(u32::from(recv.stream_id())));

        {
            let mut shared = self.shared();
            shared.request_count += 1;
        }

        let body = H2Body {
            recv,
            open: Some(open),
            status,
            read_timeout: timeouts.read,
            trace_sink,
            done: false,
        };
        Ok(Response::new(
            status,
            headers,
            ResponseBody::new(Box::new(body)),
            extensions,
        ))
    }

    fn close(&self) {
        self.shared().closed = true;
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }

    fn info(&self) -> String {
        let shared = self.shared();
        let state = if shared.closed {
            "CLOSED"
        } else if shared.streams > 0 {
            "ACTIVE"
        } else {
            "IDLE"
        };
        format!(
            "{}, HTTP/2, {}, Request Count: {}",
            self.origin, state, shared.request_count
        )
    }

    fn can_handle_request(&self, origin: &Origin) -> bool {
        *origin == self.origin && self.is_available()
    }

    fn is_available(&self) -> bool {
        !self.shared().closed
    }

    fn has_expired(&self) -> bool {
        let shared = self.shared();
        match self.keepalive_expiry {
            Some(expiry) if !shared.closed && shared.streams == 0 => {
                shared.idle_at.elapsed() >= expiry
            }
            _ => false,
        }
    }

    fn is_idle(&self) -> bool {
        let shared = self.shared();
        !shared.closed && shared.streams == 0
    }

    fn is_closed(&self) -> bool {
        self.shared().closed
    }
}

impl Http2Connection {
    /// A send-side failure means the connection is going (or gone) away:
    /// GOAWAY received, stream IDs exhausted, or the driver died. The pool
    /// requeues the request on another connection.
    fn fail_send(&self, e: h2::Error) -> Error {
        debug!("http/2 send on {} failed: {e}", self.origin);
        self.shared().closed = true;
        Error::new_connection_required()
    }
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("origin", &self.origin.to_string())
            .finish()
    }
}

/// Accounting for one open logical stream.
struct OpenStream {
    shared: Arc<StdMutex<Shared>>,
}

impl OpenStream {
    fn begin(shared: &Arc<StdMutex<Shared>>) -> OpenStream {
        shared.lock().expect("h2 state lock poisoned").streams += 1;
        OpenStream {
            shared: shared.clone(),
        }
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().expect("h2 state lock poisoned");
        shared.streams -= 1;
        if shared.streams == 0 {
            shared.idle_at = Instant::now();
        }
    }
}

async fn send_body(send_stream: &mut h2::SendStream<Bytes>, body: Body) -> Result<()> {
    match body {
        Body::Empty => {}
        Body::Full(bytes) => {
            send_all(send_stream, bytes).await?;
        }
        Body::Streaming(mut stream) => {
            while let Some(chunk) = stream.next().await {
                send_all(send_stream, chunk?).await?;
            }
        }
    }
    send_stream
        .send_data(Bytes::new(), true)
        .map_err(map_h2_error)
}

async fn send_all(send_stream: &mut h2::SendStream<Bytes>, mut bytes: Bytes) -> Result<()> {
    while !bytes.is_empty() {
        send_stream.reserve_capacity(bytes.len());
        let capacity = poll_fn(|cx| send_stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::write("http/2 stream closed while sending body"))?
            .map_err(map_h2_error)?;
        let n = capacity.min(bytes.len());
        send_stream
            .send_data(bytes.split_to(n), false)
            .map_err(map_h2_error)?;
    }
    Ok(())
}

struct H2Body {
    recv: RecvStream,
    open: Option<OpenStream>,
    status: u16,
    read_timeout: Option<Duration>,
    trace_sink: Option<Trace>,
    done: bool,
}

impl H2Body {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let data = {
            let recv = &mut self.recv;
            let next = poll_fn(|cx| recv.poll_data(cx));
            match self.read_timeout {
                Some(duration) => tokio::time::timeout(duration, next)
                    .await
                    .map_err(|_| Error::read_timeout())?,
                None => next.await,
            }
        };
        match data {
            Some(Ok(bytes)) => {
                // Returning capacity keeps the peer's window open.
                let _ = self.recv.flow_control().release_capacity(bytes.len());
                Ok(Some(bytes))
            }
            Some(Err(e)) => Err(map_h2_error(e)),
            None => {
                // Trailers are read to completion and discarded.
                let _ = poll_fn(|cx| self.recv.poll_trailers(cx))
                    .await
                    .map_err(map_h2_error)?;
                self.done = true;
                self.open = None;
                if let Some(t) = &self.trace_sink {
                    t.emit("receive_response_body", "complete");
                    t.emit("response_closed", &self.status.to_string());
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl BodyRead for H2Body {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.next_chunk().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.done = true;
                self.open = None;
                if let Some(t) = &self.trace_sink {
                    t.emit("response_closed", &self.status.to_string());
                }
                Err(e)
            }
        }
    }
}

// Dropping `recv` resets the stream at the codec; `open` settles the
// stream count.
impl Drop for H2Body {
    fn drop(&mut self) {
        if !self.done {
            if let Some(t) = &self.trace_sink {
                t.emit("response_closed", &self.status.to_string());
            }
        }
    }
}

fn map_h2_error(e: h2::Error) -> Error {
    if e.is_io() {
        Error::read(e)
    } else {
        Error::remote_protocol(e)
    }
}
