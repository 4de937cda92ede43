//! The HTTP/1.1 connection: one request/response exchange at a time over a
//! single byte stream, with a keep-alive lifecycle.

use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use log::trace;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};

use crate::{
    backend::NetworkStream,
    connection::Connection,
    error::{map_io_read, map_io_write, Error, Result},
    model::{
        header_value, Body, BodyRead, Extensions, HttpVersion, NetworkStreamHandle, Origin,
        ReasonPhrase, Request, Response, ResponseBody, Timeouts, Trace,
    },
};

const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Active,
    Idle,
    Closed,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Active => "ACTIVE",
            State::Idle => "IDLE",
            State::Closed => "CLOSED",
        }
    }
}

struct Shared {
    state: State,
    idle_at: Instant,
    request_count: u64,
}

struct Conn {
    stream: Option<Box<dyn NetworkStream>>,
    buf: BytesMut,
}

/// An HTTP/1.1 connection bound to one origin over one stream.
pub(crate) struct Http1Connection {
    origin: Origin,
    keepalive_expiry: Option<Duration>,
    conn: Arc<AsyncMutex<Conn>>,
    shared: Arc<StdMutex<Shared>>,
}

impl Http1Connection {
    pub(crate) fn new(
        origin: Origin,
        stream: Box<dyn NetworkStream>,
        keepalive_expiry: Option<Duration>,
    ) -> Http1Connection {
        Http1Connection {
            origin,
            keepalive_expiry,
            conn: Arc::new(AsyncMutex::new(Conn {
                stream: Some(stream),
                buf: BytesMut::with_capacity(8 * 1024),
            })),
            shared: Arc::new(StdMutex::new(Shared {
                state: State::New,
                idle_at: Instant::now(),
                request_count: 0,
            })),
        }
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("h1 state lock poisoned")
    }
}

#[async_trait]
impl Connection for Http1Connection {
    async fn handle_request(&self, request: &mut Request) -> Result<Response> {
        let timeouts = request
            .extensions
            .get::<Timeouts>()
            .copied()
            .unwrap_or_default();
        let trace_sink = request.extensions.get::<Trace>().cloned();

        let mut guard = self
            .conn
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::new_connection_required())?;

        let reused = {
            let mut shared = self.shared();
            let reused = match shared.state {
                State::New => false,
                State::Idle => true,
                // Active is unreachable while we hold the exchange lock.
                State::Active | State::Closed => {
                    return Err(Error::new_connection_required());
                }
            };
            shared.state = State::Active;
            reused
        };

        trace!("{} {} on {}", lossy(&request.method), request.url, self.origin);

        // If this future is dropped mid-exchange the framing state is
        // lost; the guard closes the connection so the pool sweeps it.
        let mut abort = ExchangeAbort {
            shared: self.shared.clone(),
            armed: true,
        };
        let result = match self
            .exchange(&mut guard, request, &timeouts, trace_sink.as_ref(), reused)
            .await
        {
            Ok(head) => self.build_response(guard, request, head, timeouts, trace_sink),
            Err(e) => {
                let mut shared = self.shared();
                shared.state = State::Closed;
                guard.stream = None;
                Err(e)
            }
        };
        if result.is_ok() {
            abort.armed = false;
        }
        result
    }

    fn close(&self) {
        let mut shared = self.shared();
        shared.state = State::Closed;
        drop(shared);
        if let Ok(mut conn) = self.conn.try_lock() {
            conn.stream = None;
        }
    }

    fn info(&self) -> String {
        let shared = self.shared();
        format!(
            "{}, HTTP/1.1, {}, Request Count: {}",
            self.origin,
            shared.state.as_str(),
            shared.request_count
        )
    }

    fn can_handle_request(&self, origin: &Origin) -> bool {
        *origin == self.origin && self.is_available()
    }

    fn is_available(&self) -> bool {
        matches!(self.shared().state, State::New | State::Idle)
    }

    fn has_expired(&self) -> bool {
        let shared = self.shared();
        match (shared.state, self.keepalive_expiry) {
            (State::Idle, Some(expiry)) => shared.idle_at.elapsed() >= expiry,
            _ => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.shared().state == State::Idle
    }

    fn is_closed(&self) -> bool {
        self.shared().state == State::Closed
    }
}

struct ExchangeAbort {
    shared: Arc<StdMutex<Shared>>,
    armed: bool,
}

impl Drop for ExchangeAbort {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().expect("h1 state lock poisoned").state = State::Closed;
        }
    }
}

struct ResponseHead {
    status: u16,
    reason: Bytes,
    version_minor: u8,
    headers: Vec<(Bytes, Bytes)>,
}

impl Http1Connection {
    async fn exchange(
        &self,
        conn: &mut Conn,
        request: &mut Request,
        timeouts: &Timeouts,
        trace_sink: Option<&Trace>,
        reused: bool,
    ) -> Result<ResponseHead> {
        let head = encode_head(&request.method, &request.url.target, &request.headers);
        if let Some(t) = trace_sink {
            t.emit("send_request_headers", &format!("{} bytes", head.len()));
        }
        if let Err(e) = write_all(conn, &head, timeouts.write).await {
            // A reused keep-alive connection may have been closed by the
            // peer while idle; nothing of this request reached it, so the
            // pool can requeue. On a fresh connection the failure counts
            // as establishment failing.
            return Err(match () {
                _ if !e.is_write() => e,
                _ if reused => Error::new_connection_required(),
                _ => Error::connect(e),
            });
        }

        self.send_body(conn, request, timeouts).await?;
        if let Some(t) = trace_sink {
            t.emit("send_request_body", "complete");
        }

        let head = self.read_head(conn, timeouts, reused).await?;
        if let Some(t) = trace_sink {
            t.emit("receive_response_headers", &format!("{}", head.status));
        }
        Ok(head)
    }

    async fn send_body(
        &self,
        conn: &mut Conn,
        request: &mut Request,
        timeouts: &Timeouts,
    ) -> Result<()> {
        let chunked = header_value(&request.headers, b"transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case(b"chunked"))
            .unwrap_or(false);

        match std::mem::take(&mut request.body) {
            Body::Empty => {}
            Body::Full(bytes) => {
                write_all(conn, &bytes, timeouts.write).await?;
            }
            Body::Streaming(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    if chunked {
                        let framing = format!("{:X}\r\n", chunk.len());
                        write_all(conn, framing.as_bytes(), timeouts.write).await?;
                        write_all(conn, &chunk, timeouts.write).await?;
                        write_all(conn, b"\r\n", timeouts.write).await?;
                    } else {
                        write_all(conn, &chunk, timeouts.write).await?;
                    }
                }
                if chunked {
                    write_all(conn, b"0\r\n\r\n", timeouts.write).await?;
                }
            }
        }
        flush(conn, timeouts.write).await
    }

    async fn read_head(
        &self,
        conn: &mut Conn,
        timeouts: &Timeouts,
        reused: bool,
    ) -> Result<ResponseHead> {
        loop {
            if let Some(head) = parse_head(&mut conn.buf)? {
                // Skip informational responses; the final head follows.
                if (100..200).contains(&head.status) && head.status != 101 {
                    continue;
                }
                return Ok(head);
            }
            let nothing_yet = conn.buf.is_empty();
            let n = read_more(conn, timeouts.read).await?;
            if n == 0 {
                return Err(if nothing_yet && reused {
                    // Peer closed the keep-alive connection while idle.
                    Error::new_connection_required()
                } else {
                    Error::remote_protocol("server disconnected without a complete response")
                });
            }
        }
    }

    fn build_response(
        &self,
        mut guard: OwnedMutexGuard<Conn>,
        request: &Request,
        head: ResponseHead,
        timeouts: Timeouts,
        trace_sink: Option<Trace>,
    ) -> Result<Response> {
        let mut extensions = Extensions::new();
        extensions.insert(HttpVersion(Bytes::from(
            format!("HTTP/1.{}", head.version_minor).into_bytes(),
        )));
        extensions.insert(ReasonPhrase(head.reason.clone()));

        {
            let mut shared = self.shared();
            shared.request_count += 1;
        }

        let is_connect = request.method.eq_ignore_ascii_case(b"CONNECT");
        let keepalive = response_keepalive(&head, &request.headers);

        // A successful CONNECT switches the stream to a raw byte pipe; the
        // connection gives it up entirely.
        if is_connect && (200..300).contains(&head.status) {
            let stream = guard
                .stream
                .take()
                .ok_or_else(|| Error::local_protocol("network stream already taken"))?;
            // Bytes the proxy pipelined after its head belong to the
            // tunneled peer.
            let stream: Box<dyn NetworkStream> = if guard.buf.is_empty() {
                stream
            } else {
                Box::new(crate::backend::Rewind::new(guard.buf.split().freeze(), stream))
            };
            self.shared().state = State::Closed;
            extensions.insert(NetworkStreamHandle::new(stream));
            if let Some(t) = &trace_sink {
                t.emit("response_closed", &head.status.to_string());
            }
            return Ok(Response::new(
                head.status,
                head.headers,
                ResponseBody::empty(),
                extensions,
            ));
        }

        let framing = response_framing(&head, &request.method)?;
        // A close-delimited body leaves no framing boundary to reuse.
        let keepalive = keepalive && !matches!(framing, Framing::Eof);

        if matches!(framing, Framing::None) {
            let mut shared = self.shared();
            if keepalive {
                shared.state = State::Idle;
                shared.idle_at = Instant::now();
            } else {
                shared.state = State::Closed;
                guard.stream = None;
            }
            drop(shared);
            if let Some(t) = &trace_sink {
                t.emit("response_closed", &head.status.to_string());
            }
            return Ok(Response::new(
                head.status,
                head.headers,
                ResponseBody::empty(),
                extensions,
            ));
        }

        let body = Http1Body {
            guard: Some(guard),
            shared: self.shared.clone(),
            framing,
            keepalive,
            status: head.status,
            read_timeout: timeouts.read,
            trace_sink,
            done: false,
        };
        Ok(Response::new(
            head.status,
            head.headers,
            ResponseBody::new(Box::new(body)),
            extensions,
        ))
    }
}

impl fmt::Debug for Http1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Connection")
            .field("origin", &self.origin.to_string())
            .field("state", &self.shared().state)
            .finish()
    }
}

// ===== response body =====

enum Framing {
    /// No body at all (HEAD, 204, 304).
    None,
    /// `Content-Length` bytes remain.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkState),
    /// Read until the peer closes; forfeits keep-alive.
    Eof,
}

enum ChunkState {
    Size,
    Data(u64),
    DataDone,
    Trailers,
}

struct Http1Body {
    guard: Option<OwnedMutexGuard<Conn>>,
    shared: Arc<StdMutex<Shared>>,
    framing: Framing,
    keepalive: bool,
    status: u16,
    read_timeout: Option<Duration>,
    trace_sink: Option<Trace>,
    done: bool,
}

impl Http1Body {
    fn finish(&mut self) {
        self.done = true;
        let mut shared = self.shared.lock().expect("h1 state lock poisoned");
        if self.keepalive {
            shared.state = State::Idle;
            shared.idle_at = Instant::now();
        } else {
            shared.state = State::Closed;
            if let Some(conn) = self.guard.as_mut() {
                conn.stream = None;
            }
        }
        drop(shared);
        self.guard = None;
        if let Some(t) = &self.trace_sink {
            t.emit("receive_response_body", "complete");
            t.emit("response_closed", &self.status.to_string());
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.done = true;
        self.shared.lock().expect("h1 state lock poisoned").state = State::Closed;
        if let Some(conn) = self.guard.as_mut() {
            conn.stream = None;
        }
        self.guard = None;
        if let Some(t) = &self.trace_sink {
            t.emit("response_closed", &self.status.to_string());
        }
        e
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let conn = match self.guard.as_mut() {
            Some(conn) => &mut **conn,
            None => return Ok(None),
        };
        match &mut self.framing {
            Framing::None => {
                self.finish();
                Ok(None)
            }
            Framing::Length(remaining) => {
                if *remaining == 0 {
                    self.finish();
                    return Ok(None);
                }
                if conn.buf.is_empty() && read_more(conn, self.read_timeout).await? == 0 {
                    return Err(Error::remote_protocol(
                        "server disconnected inside response body",
                    ));
                }
                let take = (conn.buf.len() as u64).min(*remaining) as usize;
                *remaining -= take as u64;
                Ok(Some(conn.buf.split_to(take).freeze()))
            }
            Framing::Chunked(state) => loop {
                match state {
                    ChunkState::Size => match split_line(&mut conn.buf) {
                        Some(line) => {
                            let size = parse_chunk_size(&line)?;
                            if size == 0 {
                                *state = ChunkState::Trailers;
                            } else {
                                *state = ChunkState::Data(size);
                            }
                        }
                        None => {
                            if read_more(conn, self.read_timeout).await? == 0 {
                                return Err(Error::remote_protocol(
                                    "server disconnected inside chunked body",
                                ));
                            }
                        }
                    },
                    ChunkState::Data(remaining) => {
                        if conn.buf.is_empty() && read_more(conn, self.read_timeout).await? == 0 {
                            return Err(Error::remote_protocol(
                                "server disconnected inside chunked body",
                            ));
                        }
                        let take = (conn.buf.len() as u64).min(*remaining) as usize;
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *state = ChunkState::DataDone;
                        }
                        if take > 0 {
                            return Ok(Some(conn.buf.split_to(take).freeze()));
                        }
                    }
                    ChunkState::DataDone => match split_line(&mut conn.buf) {
                        Some(line) if line.is_empty() => *state = ChunkState::Size,
                        Some(_) => {
                            return Err(Error::remote_protocol("malformed chunk terminator"))
                        }
                        None => {
                            if read_more(conn, self.read_timeout).await? == 0 {
                                return Err(Error::remote_protocol(
                                    "server disconnected inside chunked body",
                                ));
                            }
                        }
                    },
                    ChunkState::Trailers => match split_line(&mut conn.buf) {
                        Some(line) if line.is_empty() => {
                            self.finish();
                            return Ok(None);
                        }
                        Some(_trailer) => {}
                        None => {
                            if read_more(conn, self.read_timeout).await? == 0 {
                                return Err(Error::remote_protocol(
                                    "server disconnected inside chunked trailers",
                                ));
                            }
                        }
                    },
                }
            },
            Framing::Eof => {
                if !conn.buf.is_empty() {
                    return Ok(Some(conn.buf.split().freeze()));
                }
                if read_more(conn, self.read_timeout).await? == 0 {
                    self.finish();
                    return Ok(None);
                }
                Ok(Some(conn.buf.split().freeze()))
            }
        }
    }
}

#[async_trait]
impl BodyRead for Http1Body {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.next_chunk().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => Err(self.fail(e)),
        }
    }
}

impl Drop for Http1Body {
    fn drop(&mut self) {
        // Abandoning an unread body loses the framing boundary.
        if !self.done {
            self.shared.lock().expect("h1 state lock poisoned").state = State::Closed;
            if let Some(conn) = self.guard.as_mut() {
                conn.stream = None;
            }
            if let Some(t) = &self.trace_sink {
                t.emit("response_closed", &self.status.to_string());
            }
        }
    }
}

// ===== wire helpers =====

fn lossy(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn encode_head(method: &Bytes, target: &Bytes, headers: &[(Bytes, Bytes)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method);
    out.push(b' ');
    out.extend_from_slice(target);
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let consumed = match response.parse(&buf[..]) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::remote_protocol(e)),
    };

    let status = response
        .code
        .ok_or_else(|| Error::remote_protocol("missing status code"))?;
    let reason = Bytes::from(response.reason.unwrap_or("").as_bytes().to_vec());
    let version_minor = response.version.unwrap_or(1);
    let parsed: Vec<(Bytes, Bytes)> = response
        .headers
        .iter()
        .map(|h| {
            (
                Bytes::from(h.name.as_bytes().to_vec()),
                Bytes::from(h.value.to_vec()),
            )
        })
        .collect();

    let _ = buf.split_to(consumed);
    Ok(Some(ResponseHead {
        status,
        reason,
        version_minor,
        headers: parsed,
    }))
}

fn response_framing(head: &ResponseHead, method: &Bytes) -> Result<Framing> {
    if method.eq_ignore_ascii_case(b"HEAD") || head.status == 204 || head.status == 304 {
        return Ok(Framing::None);
    }
    if let Some(te) = header_value(&head.headers, b"transfer-encoding") {
        if te.to_ascii_lowercase().windows(7).any(|w| w == b"chunked") {
            return Ok(Framing::Chunked(ChunkState::Size));
        }
    }
    if let Some(cl) = header_value(&head.headers, b"content-length") {
        let length: u64 = std::str::from_utf8(cl)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::remote_protocol("invalid Content-Length"))?;
        return Ok(if length == 0 {
            Framing::None
        } else {
            Framing::Length(length)
        });
    }
    Ok(Framing::Eof)
}

fn response_keepalive(head: &ResponseHead, request_headers: &[(Bytes, Bytes)]) -> bool {
    let requested_close = header_value(request_headers, b"connection")
        .map(|v| v.eq_ignore_ascii_case(b"close"))
        .unwrap_or(false);
    if requested_close {
        return false;
    }
    match header_value(&head.headers, b"connection") {
        Some(v) if v.eq_ignore_ascii_case(b"close") => false,
        Some(v) if v.eq_ignore_ascii_case(b"keep-alive") => true,
        _ => head.version_minor == 1,
    }
}

fn split_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = buf.split_to(pos).freeze();
    let _ = buf.split_to(2);
    Some(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(line);
    let text = std::str::from_utf8(digits)
        .map_err(|_| Error::remote_protocol("malformed chunk size"))?;
    u64::from_str_radix(text.trim(), 16).map_err(|_| Error::remote_protocol("malformed chunk size"))
}

async fn read_more(conn: &mut Conn, timeout: Option<Duration>) -> Result<usize> {
    let stream = conn
        .stream
        .as_mut()
        .ok_or_else(|| Error::local_protocol("network stream already taken"))?;
    let read = stream.read_buf(&mut conn.buf);
    match timeout {
        Some(duration) => tokio::time::timeout(duration, read)
            .await
            .map_err(|_| Error::read_timeout())?
            .map_err(map_io_read),
        None => read.await.map_err(map_io_read),
    }
}

async fn write_all(conn: &mut Conn, data: &[u8], timeout: Option<Duration>) -> Result<()> {
    let stream = conn
        .stream
        .as_mut()
        .ok_or_else(|| Error::local_protocol("network stream already taken"))?;
    let write = stream.write_all(data);
    match timeout {
        Some(duration) => tokio::time::timeout(duration, write)
            .await
            .map_err(|_| Error::write_timeout())?
            .map_err(map_io_write),
        None => write.await.map_err(map_io_write),
    }
}

async fn flush(conn: &mut Conn, timeout: Option<Duration>) -> Result<()> {
    let stream = conn
        .stream
        .as_mut()
        .ok_or_else(|| Error::local_protocol("network stream already taken"))?;
    let fut = stream.flush();
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| Error::write_timeout())?
            .map_err(map_io_write),
        None => fut.await.map_err(map_io_write),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    use super::*;
    use crate::backend::TlsParams;
    use crate::model::Url;

    struct Mem(DuplexStream);

    impl AsyncRead for Mem {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Mem {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl NetworkStream for Mem {
        async fn start_tls(self: Box<Self>, _tls: TlsParams) -> Result<Box<dyn NetworkStream>> {
            Err(Error::local_protocol("test stream cannot start TLS"))
        }
    }

    fn connection() -> (Http1Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let url = Url::parse("http://example.com/").unwrap();
        let conn = Http1Connection::new(url.origin(), Box::new(Mem(client)), None);
        (conn, server)
    }

    fn get_request(target: &'static str) -> Request {
        let mut request = Request::new(
            "GET",
            Url::new(crate::Scheme::Http, &b"example.com"[..], 80, target.as_bytes().to_vec()),
        );
        request.normalize();
        request
    }

    async fn serve_script(mut server: DuplexStream, response: &'static [u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending a full request");
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        server.write_all(response).await.unwrap();
        seen
    }

    #[tokio::test]
    async fn keepalive_exchange_returns_to_idle() {
        let (conn, server) = connection();
        let server_task = tokio::spawn(serve_script(
            server,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        ));

        let mut request = get_request("/");
        let mut response = conn.handle_request(&mut request).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(!conn.is_idle(), "connection busy until body drained");

        assert_eq!(&response.read().await.unwrap()[..], b"hello");
        assert!(conn.is_idle());
        assert!(conn.is_available());
        assert_eq!(
            &response.extensions.get::<ReasonPhrase>().unwrap().0[..],
            b"OK"
        );
        assert_eq!(
            &response.extensions.get::<HttpVersion>().unwrap().0[..],
            b"HTTP/1.1"
        );

        let seen = server_task.await.unwrap();
        let text = String::from_utf8(seen).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"), "{text:?}");
        assert!(text.contains("Host: example.com\r\n"), "{text:?}");
    }

    #[tokio::test]
    async fn chunked_response_body() {
        let (conn, server) = connection();
        let _server = tokio::spawn(serve_script(
            server,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        ));

        let mut request = get_request("/chunked");
        let mut response = conn.handle_request(&mut request).await.unwrap();
        assert_eq!(&response.read().await.unwrap()[..], b"hello world");
        assert!(conn.is_idle());
    }

    #[tokio::test]
    async fn connection_close_header_closes() {
        let (conn, server) = connection();
        let _server = tokio::spawn(serve_script(
            server,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        ));

        let mut request = get_request("/");
        let mut response = conn.handle_request(&mut request).await.unwrap();
        response.read().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn eof_framed_body_forfeits_keepalive() {
        let (conn, server) = connection();
        let _server = tokio::spawn(async move {
            let mut server = server;
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nuntil eof")
                .await
                .unwrap();
            // Dropping the server half sends EOF.
        });

        let mut request = get_request("/");
        let mut response = conn.handle_request(&mut request).await.unwrap();
        assert_eq!(&response.read().await.unwrap()[..], b"until eof");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn premature_drop_closes_connection() {
        let (conn, server) = connection();
        let _server = tokio::spawn(serve_script(
            server,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        ));

        let mut request = get_request("/");
        let response = conn.handle_request(&mut request).await.unwrap();
        drop(response);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn second_request_while_busy_is_requeued() {
        let (conn, server) = connection();
        let _server = tokio::spawn(serve_script(
            server,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        ));

        let mut request = get_request("/");
        let _open = conn.handle_request(&mut request).await.unwrap();

        let mut second = get_request("/");
        let err = conn.handle_request(&mut second).await.unwrap_err();
        assert!(err.is_new_connection_required());
    }

    #[tokio::test]
    async fn connect_yields_network_stream() {
        let (conn, server) = connection();
        let _server = tokio::spawn(serve_script(server, b"HTTP/1.1 200 Connection established\r\n\r\n"));

        let mut request = Request::new(
            "CONNECT",
            Url::new(crate::Scheme::Http, &b"example.com"[..], 80, &b"remote:443"[..]),
        );
        request
            .headers
            .push((Bytes::from_static(b"Host"), Bytes::from_static(b"remote:443")));

        let response = conn.handle_request(&mut request).await.unwrap();
        assert_eq!(response.status, 200);
        let handle = response
            .extensions
            .get::<NetworkStreamHandle>()
            .expect("CONNECT responses carry the raw stream");
        assert!(handle.take().is_some());
        assert!(handle.take().is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn read_timeout_is_reported() {
        let (conn, server) = connection();
        // Keep the server half open but silent.
        let _server = server;

        let mut request = get_request("/");
        request.extensions.insert(Timeouts {
            read: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let err = conn.handle_request(&mut request).await.unwrap_err();
        assert!(err.is_read_timeout());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn streaming_request_body_is_chunked() {
        let (conn, server) = connection();
        let server_task = tokio::spawn(async move {
            let mut server = server;
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(5).any(|w| w == b"0\r\n\r\n") {
                    break;
                }
            }
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            seen
        });

        let mut request = Request::new("POST", Url::parse("http://example.com/upload").unwrap());
        request.body = Body::Streaming(Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cde")),
        ])));
        request.normalize();

        let response = conn.handle_request(&mut request).await.unwrap();
        assert_eq!(response.status, 200);

        let seen = server_task.await.unwrap();
        let text = String::from_utf8(seen).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"), "{text:?}");
        assert!(text.ends_with("2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"), "{text:?}");
    }
}
