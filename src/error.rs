use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is `tether::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while obtaining a connection and driving a
/// request/response exchange over it.
///
/// Use the `is_*` predicates to classify an error rather than matching on
/// its display output.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Failed to establish a connection.
    Connect,
    /// Establishing a connection exceeded the connect timeout.
    ConnectTimeout,
    /// Transport failure while reading, after bytes were exchanged.
    Read,
    /// Transport failure while writing, after bytes were exchanged.
    Write,
    ReadTimeout,
    WriteTimeout,
    /// Waiting for a pool slot exceeded the pool timeout.
    PoolTimeout,
    /// The peer violated the HTTP/1.1 or HTTP/2 protocol.
    RemoteProtocol,
    /// Our own request was malformed.
    LocalProtocol,
    /// The proxy refused the CONNECT request. Carries `"<status> <reason>"`.
    Proxy(String),
    /// Internal requeue signal: the chosen connection cannot take this
    /// request and the pool must select or create another. Never surfaces.
    NewConnectionRequired,
    /// The request URL scheme is not `http` or `https`.
    UnsupportedProtocol,
    /// The pool has been closed and refuses further requests.
    Closed,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout, None::<Error>)
    }

    pub(crate) fn read<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Read, Some(e))
    }

    pub(crate) fn write<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Write, Some(e))
    }

    pub(crate) fn read_timeout() -> Error {
        Error::new(Kind::ReadTimeout, None::<Error>)
    }

    pub(crate) fn write_timeout() -> Error {
        Error::new(Kind::WriteTimeout, None::<Error>)
    }

    pub(crate) fn pool_timeout() -> Error {
        Error::new(Kind::PoolTimeout, None::<Error>)
    }

    pub(crate) fn remote_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::RemoteProtocol, Some(e))
    }

    pub(crate) fn local_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::LocalProtocol, Some(e))
    }

    pub(crate) fn proxy(message: String) -> Error {
        Error::new(Kind::Proxy(message), None::<Error>)
    }

    pub(crate) fn new_connection_required() -> Error {
        Error::new(Kind::NewConnectionRequired, None::<Error>)
    }

    pub(crate) fn unsupported_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::UnsupportedProtocol, Some(e))
    }

    pub(crate) fn closed() -> Error {
        Error::new(Kind::Closed, None::<Error>)
    }
}

impl Error {
    /// Returns true if the error occurred while establishing a connection.
    ///
    /// Connection establishment failures are the only failures the pool
    /// retries, up to the configured retry count.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error is any of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::ConnectTimeout | Kind::ReadTimeout | Kind::WriteTimeout | Kind::PoolTimeout
        )
    }

    /// Returns true if establishing a connection timed out.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout)
    }

    /// Returns true if reading from the transport timed out.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true if writing to the transport timed out.
    pub fn is_write_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteTimeout)
    }

    /// Returns true if waiting for a pool slot timed out.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolTimeout)
    }

    /// Returns true if the transport failed while reading.
    pub fn is_read(&self) -> bool {
        matches!(self.inner.kind, Kind::Read)
    }

    /// Returns true if the transport failed while writing.
    pub fn is_write(&self) -> bool {
        matches!(self.inner.kind, Kind::Write)
    }

    /// Returns true if the peer violated the protocol.
    pub fn is_remote_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::RemoteProtocol)
    }

    /// Returns true if our request was malformed.
    pub fn is_local_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::LocalProtocol)
    }

    /// Returns true if the proxy refused the CONNECT request.
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy(_))
    }

    /// The `"<status> <reason>"` line from a refused CONNECT, if this is a
    /// proxy error.
    pub fn proxy_message(&self) -> Option<&str> {
        match self.inner.kind {
            Kind::Proxy(ref msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns true if the request URL scheme is not supported.
    pub fn is_unsupported_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::UnsupportedProtocol)
    }

    /// Returns true if the pool was closed before or during this request.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    pub(crate) fn is_new_connection_required(&self) -> bool {
        matches!(self.inner.kind, Kind::NewConnectionRequired)
    }
}

pub(crate) fn map_io_read(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut {
        Error::read_timeout()
    } else {
        Error::read(e)
    }
}

pub(crate) fn map_io_write(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut {
        Error::write_timeout()
    } else {
        Error::write(e)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("tether::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Connect => f.write_str("failed to establish connection")?,
            Kind::ConnectTimeout => f.write_str("timed out establishing connection")?,
            Kind::Read => f.write_str("error reading from connection")?,
            Kind::Write => f.write_str("error writing to connection")?,
            Kind::ReadTimeout => f.write_str("timed out reading from connection")?,
            Kind::WriteTimeout => f.write_str("timed out writing to connection")?,
            Kind::PoolTimeout => f.write_str("timed out waiting for connection from pool")?,
            Kind::RemoteProtocol => f.write_str("remote protocol violation")?,
            Kind::LocalProtocol => f.write_str("local protocol violation")?,
            Kind::Proxy(ref msg) => write!(f, "proxy refused tunnel: {msg}")?,
            Kind::NewConnectionRequired => f.write_str("new connection required")?,
            Kind::UnsupportedProtocol => f.write_str("unsupported URL scheme")?,
            Kind::Closed => f.write_str("connection pool is closed")?,
        };

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::connect_timeout();
        assert!(root.source().is_none());

        let link = Error::connect(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn timeout_predicates() {
        assert!(Error::connect_timeout().is_timeout());
        assert!(Error::read_timeout().is_timeout());
        assert!(Error::write_timeout().is_timeout());
        assert!(Error::pool_timeout().is_timeout());
        assert!(Error::pool_timeout().is_pool_timeout());
        assert!(!Error::connect("refused").is_timeout());
    }

    #[test]
    fn proxy_message_roundtrip() {
        let err = Error::proxy("407 Proxy Authentication Required".into());
        assert!(err.is_proxy());
        assert_eq!(
            err.proxy_message(),
            Some("407 Proxy Authentication Required")
        );
        assert_eq!(
            err.to_string(),
            "proxy refused tunnel: 407 Proxy Authentication Required"
        );
    }

    #[test]
    fn retry_signal_is_internal() {
        let err = Error::new_connection_required();
        assert!(err.is_new_connection_required());
        assert!(!err.is_connect());
        assert!(!err.is_timeout());
    }
}
