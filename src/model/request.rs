use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures_core::Stream;

use super::{extensions::Extensions, url::Url};
use crate::error::Result;

/// A lazily produced sequence of request body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

/// The source of a request body.
pub enum Body {
    /// No body.
    Empty,
    /// A finite, in-memory body. Framed with `Content-Length`.
    Full(Bytes),
    /// A lazy chunk sequence. Framed with `Transfer-Encoding: chunked` on
    /// HTTP/1.1.
    Streaming(BodyStream),
}

impl Body {
    /// The body length, when known up front.
    pub fn known_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Streaming(_) => None,
        }
    }

    /// Whether this body produces no bytes.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty) || matches!(self, Body::Full(b) if b.is_empty())
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(b) => write!(f, "Body::Full({} bytes)", b.len()),
            Body::Streaming(_) => f.write_str("Body::Streaming"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Body {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Body {
        Bytes::from_static(bytes).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Bytes::from_static(s.as_bytes()).into()
    }
}

/// An HTTP request descriptor.
///
/// Everything except the body is plain data; the body may be a lazy chunk
/// stream, consumed once when the request is sent.
#[derive(Debug)]
pub struct Request {
    /// Request method bytes, e.g. `GET`.
    pub method: Bytes,
    /// Request URL.
    pub url: Url,
    /// Ordered header sequence. Names compare case-insensitively.
    pub headers: Vec<(Bytes, Bytes)>,
    /// Body source.
    pub body: Body,
    /// Out-of-band request options.
    pub extensions: Extensions,
}

impl Request {
    /// Build a request. The header sequence is taken as given; see
    /// [`Request::normalize`] for `Host` and framing-header injection.
    pub fn new(method: impl Into<Bytes>, url: Url) -> Request {
        Request {
            method: method.into(),
            url,
            headers: Vec::new(),
            body: Body::Empty,
            extensions: Extensions::new(),
        }
    }

    /// Inject the `Host` header and derive body framing headers.
    ///
    /// `Host` is added (at the front) unless already present. When neither
    /// `Content-Length` nor `Transfer-Encoding` is present, a buffered body
    /// gets `Content-Length` and a streaming body gets `Transfer-Encoding:
    /// chunked`; an empty body gets neither.
    pub fn normalize(&mut self) {
        if !contains_header(&self.headers, b"host") {
            self.headers
                .insert(0, (Bytes::from_static(b"Host"), self.url.host_header_value()));
        }

        if contains_header(&self.headers, b"content-length")
            || contains_header(&self.headers, b"transfer-encoding")
        {
            return;
        }
        match &self.body {
            Body::Empty => {}
            Body::Full(bytes) => {
                self.headers.push((
                    Bytes::from_static(b"Content-Length"),
                    Bytes::from(bytes.len().to_string()),
                ));
            }
            Body::Streaming(_) => {
                self.headers.push((
                    Bytes::from_static(b"Transfer-Encoding"),
                    Bytes::from_static(b"chunked"),
                ));
            }
        }
    }
}

/// Case-insensitive header presence check over an ordered header sequence.
pub(crate) fn contains_header(headers: &[(Bytes, Bytes)], lower_name: &[u8]) -> bool {
    headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case(lower_name))
}

/// First value for a header name, compared case-insensitively.
pub(crate) fn header_value<'a>(
    headers: &'a [(Bytes, Bytes)],
    lower_name: &[u8],
) -> Option<&'a Bytes> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(lower_name))
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_host_once() {
        let mut request = Request::new("GET", Url::parse("http://example.com:8080/").unwrap());
        request.normalize();
        assert_eq!(&request.headers[0].0[..], b"Host");
        assert_eq!(&request.headers[0].1[..], b"example.com:8080");

        let before = request.headers.len();
        request.normalize();
        assert_eq!(request.headers.len(), before);
    }

    #[test]
    fn normalize_respects_existing_host() {
        let mut request = Request::new("GET", Url::parse("http://example.com/").unwrap());
        request
            .headers
            .push((Bytes::from_static(b"hOsT"), Bytes::from_static(b"other")));
        request.normalize();
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn normalize_derives_framing() {
        let mut request = Request::new("POST", Url::parse("http://example.com/").unwrap());
        request.body = Body::from(&b"hello"[..]);
        request.normalize();
        assert_eq!(
            header_value(&request.headers, b"content-length").map(|v| &v[..]),
            Some(&b"5"[..])
        );

        let mut request = Request::new("POST", Url::parse("http://example.com/").unwrap());
        request.body = Body::Streaming(Box::pin(futures_util::stream::empty()));
        request.normalize();
        assert_eq!(
            header_value(&request.headers, b"transfer-encoding").map(|v| &v[..]),
            Some(&b"chunked"[..])
        );
    }

    #[test]
    fn empty_body_gets_no_framing_headers() {
        let mut request = Request::new("GET", Url::parse("http://example.com/").unwrap());
        request.normalize();
        assert!(!contains_header(&request.headers, b"content-length"));
        assert!(!contains_header(&request.headers, b"transfer-encoding"));
    }
}
