use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use once_cell::sync::Lazy;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;

use super::NetworkStream;
use crate::error::{Error, Result};

/// Parameters for upgrading a stream to TLS.
#[derive(Clone)]
pub struct TlsParams {
    /// The client configuration, carrying trust roots and ALPN protocols.
    pub config: Arc<ClientConfig>,
    /// The server name sent in SNI and used for certificate verification.
    pub server_name: String,
}

impl std::fmt::Debug for TlsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsParams")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Details of a negotiated TLS session.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// The ALPN protocol the peer selected, if any.
    pub alpn_protocol: Option<Bytes>,
}

static ROOT_STORE: Lazy<RootCertStore> = Lazy::new(|| {
    let mut store = RootCertStore::empty();
    store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    store
});

/// Build the default TLS client configuration: webpki trust roots and the
/// given ALPN protocol list.
pub fn default_tls_config(alpn_protocols: &[&[u8]]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(ROOT_STORE.clone())
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// The ALPN protocol list offered for a given HTTP/2 preference.
pub(crate) fn alpn_protocols(http2: bool) -> &'static [&'static [u8]] {
    if http2 {
        &[b"h2", b"http/1.1"]
    } else {
        &[b"http/1.1"]
    }
}

pub(crate) async fn handshake(
    io: Box<dyn NetworkStream>,
    tls: TlsParams,
) -> Result<Box<dyn NetworkStream>> {
    let server_name = ServerName::try_from(tls.server_name.as_str()).map_err(|_| {
        Error::local_protocol(format!("invalid TLS server name {:?}", tls.server_name))
    })?;
    trace!("starting TLS handshake, sni={:?}", tls.server_name);
    let connector = TlsConnector::from(tls.config);
    let stream = connector
        .connect(server_name, io)
        .await
        .map_err(Error::connect)?;
    Ok(Box::new(Tls(stream)))
}

struct Tls(tokio_rustls::client::TlsStream<Box<dyn NetworkStream>>);

impl AsyncRead for Tls {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tls {
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
impl NetworkStream for Tls {
    // TLS over TLS, for tunneled https destinations behind an https proxy.
    async fn start_tls(self: Box<Self>, tls: TlsParams) -> Result<Box<dyn NetworkStream>> {
        let io: Box<dyn NetworkStream> = self;
        handshake(io, tls).await
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        let (_, session) = self.0.get_ref();
        Some(TlsInfo {
            alpn_protocol: session.alpn_protocol().map(Bytes::copy_from_slice),
        })
    }

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.0.get_ref().0.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_follows_http2_preference() {
        assert_eq!(alpn_protocols(true), &[&b"h2"[..], &b"http/1.1"[..]]);
        assert_eq!(alpn_protocols(false), &[&b"http/1.1"[..]]);
    }

    #[test]
    fn default_config_carries_alpn() {
        let config = default_tls_config(alpn_protocols(true));
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        let config = default_tls_config(alpn_protocols(false));
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
