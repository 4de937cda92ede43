//! Out-of-band request and response data.
//!
//! Extensions carry concerns that are not part of the HTTP message itself:
//! timeouts, an SNI override, a trace sink on the request side; protocol
//! details and the raw network stream on the response side.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;

use crate::backend::NetworkStream;

type AnyMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// A type-keyed bag of out-of-band values attached to a request or
/// response.
#[derive(Default)]
pub struct Extensions {
    map: Option<Box<AnyMap>>,
}

impl Extensions {
    /// An empty extensions bag.
    pub fn new() -> Extensions {
        Extensions::default()
    }

    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .get_or_insert_with(Box::default)
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|boxed| boxed.downcast().ok().map(|boxed| *boxed))
    }

    /// Get a reference to a value of the given type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .as_ref()
            .and_then(|map| map.get(&TypeId::of::<T>()))
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Remove and return a value of the given type.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .as_mut()
            .and_then(|map| map.remove(&TypeId::of::<T>()))
            .and_then(|boxed| boxed.downcast().ok().map(|boxed| *boxed))
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").finish()
    }
}

/// Per-operation deadlines, attached to a request as an extension.
///
/// Each field bounds one class of suspension point; `None` disables that
/// bound.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timeouts {
    /// Dialing and TLS handshakes.
    pub connect: Option<Duration>,
    /// Socket reads.
    pub read: Option<Duration>,
    /// Socket writes.
    pub write: Option<Duration>,
    /// Waiting for a connection from the pool.
    pub pool: Option<Duration>,
}

/// Overrides the server name sent in the TLS SNI extension.
#[derive(Debug, Clone)]
pub struct SniHostname(pub Bytes);

/// A callable sink receiving `(event, info)` pairs at protocol milestones.
#[derive(Clone)]
pub struct Trace(Arc<dyn Fn(&str, &str) + Send + Sync>);

impl Trace {
    /// Wrap a callable as a trace sink.
    pub fn new(f: impl Fn(&str, &str) + Send + Sync + 'static) -> Trace {
        Trace(Arc::new(f))
    }

    pub(crate) fn emit(&self, event: &str, info: &str) {
        (self.0)(event, info)
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace").finish()
    }
}

/// The HTTP version the response was received over, e.g. `HTTP/1.1`.
#[derive(Debug, Clone)]
pub struct HttpVersion(pub Bytes);

/// The reason phrase from an HTTP/1.x status line, e.g. `OK`. Empty for
/// HTTP/2 responses.
#[derive(Debug, Clone)]
pub struct ReasonPhrase(pub Bytes);

/// The HTTP/2 stream the response arrived on.
#[derive(Debug, Clone, Copy)]
pub struct StreamId(pub u32);

/// A takeable handle to the raw network stream underlying a response.
///
/// Populated on CONNECT responses so a tunnel can take ownership of the
/// byte pipe once the proxy has switched it.
#[derive(Clone)]
pub struct NetworkStreamHandle {
    inner: Arc<Mutex<Option<Box<dyn NetworkStream>>>>,
}

impl NetworkStreamHandle {
    pub(crate) fn new(stream: Box<dyn NetworkStream>) -> NetworkStreamHandle {
        NetworkStreamHandle {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Take the stream out of the handle. Returns `None` if it was already
    /// taken.
    pub fn take(&self) -> Option<Box<dyn NetworkStream>> {
        self.inner.lock().expect("stream handle lock poisoned").take()
    }
}

impl fmt::Debug for NetworkStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStreamHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut ext = Extensions::new();
        assert!(ext.get::<Timeouts>().is_none());

        ext.insert(Timeouts {
            connect: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        assert_eq!(
            ext.get::<Timeouts>().unwrap().connect,
            Some(Duration::from_secs(1))
        );

        ext.insert(StreamId(3));
        assert_eq!(ext.remove::<StreamId>().unwrap().0, 3);
        assert!(ext.get::<StreamId>().is_none());
    }

    #[test]
    fn trace_sink_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let trace = Trace::new(move |event, info| {
            sink.lock().unwrap().push((event.to_owned(), info.to_owned()));
        });
        trace.emit("connect_tcp", "host=example.com");
        assert_eq!(
            seen.lock().unwrap()[0],
            ("connect_tcp".to_owned(), "host=example.com".to_owned())
        );
    }
}
