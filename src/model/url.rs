use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

/// URL scheme of an origin, limited to the two this crate can transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The scheme as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Default port for the scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(scheme, host, port)` tuple identifying a remote endpoint.
///
/// Connections are keyed by origin: a pooled connection may only be reused
/// for requests to an equal origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// URL scheme.
    pub scheme: Scheme,
    /// Host, as it appeared in the URL.
    pub host: Bytes,
    /// Port, with the scheme default filled in when the URL omitted it.
    pub port: u16,
}

impl Origin {
    /// `host:port` in authority form, as used by CONNECT request targets.
    pub fn authority(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.host.len() + 6);
        out.extend_from_slice(&self.host);
        out.extend_from_slice(format!(":{}", self.port).as_bytes());
        out.into()
    }

    pub(crate) fn host_str(&self) -> &str {
        std::str::from_utf8(&self.host).unwrap_or("")
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            self.scheme,
            String::from_utf8_lossy(&self.host),
            self.port
        )
    }
}

/// A request URL, held as its origin plus the request-target bytes.
///
/// The target is path-and-query for ordinary requests, authority form for
/// CONNECT, or an absolute URL when forwarding through a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// URL scheme.
    pub scheme: Scheme,
    /// Host component.
    pub host: Bytes,
    /// Port, scheme default filled in when omitted.
    pub port: u16,
    /// Request-target bytes.
    pub target: Bytes,
}

impl Url {
    /// Build a URL from parts. The target is taken verbatim.
    pub fn new(
        scheme: Scheme,
        host: impl Into<Bytes>,
        port: u16,
        target: impl Into<Bytes>,
    ) -> Url {
        Url {
            scheme,
            host: host.into(),
            port,
            target: target.into(),
        }
    }

    /// Parse an absolute URL.
    ///
    /// Schemes other than `http` and `https` are rejected with an
    /// unsupported-protocol error.
    pub fn parse(input: &str) -> Result<Url> {
        let parsed = url::Url::parse(input).map_err(Error::local_protocol)?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::unsupported_protocol(format!(
                    "scheme {other:?} is not supported"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::local_protocol("URL has no host"))?
            .to_owned();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let mut target = parsed.path().to_owned();
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }

        Ok(Url {
            scheme,
            host: host.into_bytes().into(),
            port,
            target: target.into_bytes().into(),
        })
    }

    /// The origin this URL addresses.
    pub fn origin(&self) -> Origin {
        Origin {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// `host` or `host:port` suitable for a `Host` header; the port is
    /// elided when it is the scheme default.
    pub fn host_header_value(&self) -> Bytes {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            self.origin().authority()
        }
    }

    /// The absolute form of this URL, as sent to a forwarding proxy.
    pub fn absolute(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.host.len() + self.target.len() + 16);
        out.extend_from_slice(self.scheme.as_str().as_bytes());
        out.extend_from_slice(b"://");
        out.extend_from_slice(&self.host);
        if self.port != self.scheme.default_port() {
            out.extend_from_slice(format!(":{}", self.port).as_bytes());
        }
        out.extend_from_slice(&self.target);
        out.into()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.origin(),
            String::from_utf8_lossy(&self.target)
        )
    }
}

/// A trait for things that can be converted into a [`Url`].
///
/// Implemented for `Url` itself and for string types holding an absolute
/// URL.
pub trait IntoUrl {
    /// Perform the conversion.
    fn into_url(self) -> Result<Url>;
}

impl IntoUrl for Url {
    fn into_url(self) -> Result<Url> {
        Ok(self)
    }
}

impl IntoUrl for &str {
    fn into_url(self) -> Result<Url> {
        Url::parse(self)
    }
}

impl IntoUrl for &String {
    fn into_url(self) -> Result<Url> {
        Url::parse(self)
    }
}

impl IntoUrl for String {
    fn into_url(self) -> Result<Url> {
        Url::parse(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fills_default_port() {
        let url = Url::parse("http://example.com/path?x=1").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(&url.host[..], b"example.com");
        assert_eq!(url.port, 80);
        assert_eq!(&url.target[..], b"/path?x=1");

        let url = Url::parse("https://example.com").unwrap();
        assert_eq!(url.port, 443);
        assert_eq!(&url.target[..], b"/");
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        let err = Url::parse("ftp://example.com/").unwrap_err();
        assert!(err.is_unsupported_protocol());
    }

    #[test]
    fn origin_equality_is_structural() {
        let a = Url::parse("http://example.com:8080/a").unwrap().origin();
        let b = Url::parse("http://example.com:8080/b").unwrap().origin();
        let c = Url::parse("https://example.com:8080/a").unwrap().origin();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "http://example.com:8080");
    }

    #[test]
    fn absolute_form_elides_default_port() {
        let url = Url::parse("http://example.com/x").unwrap();
        assert_eq!(&url.absolute()[..], b"http://example.com/x");

        let url = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(&url.absolute()[..], b"http://example.com:8080/x");
    }

    #[test]
    fn host_header_value_keeps_explicit_port() {
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(&url.host_header_value()[..], b"example.com:8080");

        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(&url.host_header_value()[..], b"example.com");
    }
}
