use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::sync::{Mutex, mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::net;
use crate::tunnel::transport::{
    BoxedStream, TlsOptions, Transport, TransportListener,
    tcp::{self, TcpTransportListener},
};

pub const SCHEME: &str = "drbssl";

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The TCP delegate wrapped in rustls.
pub struct TlsTransport {
    opts: TlsOptions,
    connector: Option<TlsConnector>,
}

impl TlsTransport {
    pub fn new(opts: &TlsOptions) -> anyhow::Result<Self> {
        let connector = tls_config::client_crypto_config(opts)?
            .map(|cfg| TlsConnector::from(Arc::new(cfg)));
        Ok(Self {
            opts: opts.clone(),
            connector,
        })
    }

    fn server_name_for(&self, addr: &str) -> anyhow::Result<ServerName<'static>> {
        let name = if self.opts.server_name.trim().is_empty() {
            let (host, _) = net::split_host_port(addr)
                .with_context(|| format!("tls: bad address {addr:?}"))?;
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        } else {
            self.opts.server_name.trim().to_string()
        };
        ServerName::try_from(name.clone()).with_context(|| format!("tls: invalid server name {name:?}"))
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn open(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let Some(connector) = &self.connector else {
            anyhow::bail!("tls: dialing requires ca_file or insecure_skip_verify");
        };
        let name = self.server_name_for(addr)?;
        let c = tcp::dial(addr).await?;
        let st = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, c))
            .await
            .context("tls: handshake timed out")?
            .with_context(|| format!("tls: handshake with {addr}"))?;
        Ok(Box::new(st))
    }

    async fn open_server(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let (certs, key) = tls_config::load_or_generate_cert(&self.opts.cert_file, &self.opts.key_file)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config::server_crypto_config(certs, key)?));
        let inner = TcpTransportListener::bind(addr, SCHEME).await?;
        Ok(Box::new(TlsTransportListener::new(inner, acceptor)))
    }
}

/// Accepts TCP in a background task and completes handshakes off the caller's
/// path, so one stalled client cannot hold up `accept()`.
pub struct TlsTransportListener {
    inner: Arc<TcpTransportListener>,
    incoming: Mutex<mpsc::Receiver<BoxedStream>>,
    task: tokio::task::JoinHandle<()>,
}

impl TlsTransportListener {
    fn new(inner: TcpTransportListener, acceptor: TlsAcceptor) -> Self {
        let inner = Arc::new(inner);
        let (tx, rx) = mpsc::channel::<BoxedStream>(64);

        let ln = inner.clone();
        let task = tokio::spawn(async move {
            while let Ok(c) = ln.accept_tcp().await {
                let peer = c.peer_addr().ok();
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(c)).await {
                        Ok(Ok(st)) => {
                            let _ = tx.send(Box::new(st)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(peer=?peer, err=%err, "tls: handshake failed");
                        }
                        Err(_) => {
                            tracing::debug!(peer=?peer, "tls: handshake timed out");
                        }
                    }
                });
            }
        });

        Self {
            inner,
            incoming: Mutex::new(rx),
            task,
        }
    }
}

impl Drop for TlsTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tls: listener closed"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn uri(&self) -> String {
        self.inner.uri()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close_now();
        self.task.abort();
        Ok(())
    }
}

mod tls_config {
    use std::{fs, path::Path, sync::Arc};

    use anyhow::Context;
    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    use crate::tunnel::transport::TlsOptions;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn load_or_generate_cert(
        cert_file: &str,
        key_file: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!("tls: requires both cert_file and key_file (or neither to auto-generate)");
            }
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            return Ok((certs, key));
        }

        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string(), "127.0.0.1".to_string()])?;
        tracing::warn!("tls: no certificate configured; serving a generated self-signed one");
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("tls: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("tls: no private key found in {}", path.display());
        };
        Ok(k)
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(cfg)
    }

    /// `None` when nothing is configured to verify servers against.
    pub fn client_crypto_config(opts: &TlsOptions) -> anyhow::Result<Option<rustls::ClientConfig>> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;

        if opts.insecure_skip_verify {
            let cfg = builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth();
            return Ok(Some(cfg));
        }

        let ca_file = opts.ca_file.trim();
        if ca_file.is_empty() {
            return Ok(None);
        }

        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(Path::new(ca_file))? {
            roots.add(cert)?;
        }
        Ok(Some(builder.with_root_certificates(roots).with_no_client_auth()))
    }

    /// Certificate verifier that accepts anything.
    ///
    /// NOTE: vulnerable to MITM. Intended for local dev / testing only.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn insecure() -> TlsOptions {
        TlsOptions {
            insecure_skip_verify: true,
            ..TlsOptions::default()
        }
    }

    #[tokio::test]
    async fn self_signed_roundtrip_with_skip_verify() {
        let tr = TlsTransport::new(&insecure()).unwrap();
        let ln = tr.open_server("127.0.0.1:0").await.unwrap();
        assert!(ln.uri().starts_with("drbssl://127.0.0.1:"));
        let addr = ln.local_addr().unwrap().to_string();

        let dial = tokio::spawn(async move {
            let tr = TlsTransport::new(&insecure()).unwrap();
            let mut c = tr.open(&addr).await.unwrap();
            c.write_all(b"sealed").await.unwrap();
            c.flush().await.unwrap();
            let mut back = [0u8; 2];
            c.read_exact(&mut back).await.unwrap();
            back
        });

        let mut s = ln.accept().await.unwrap();
        let mut buf = [0u8; 6];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"sealed");
        s.write_all(b"ok").await.unwrap();
        s.flush().await.unwrap();

        assert_eq!(&dial.await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn dial_without_trust_config_fails() {
        let tr = TlsTransport::new(&TlsOptions::default()).unwrap();
        let err = match tr.open("127.0.0.1:1").await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("ca_file"));
    }

    #[test]
    fn cert_and_key_must_be_paired() {
        assert!(tls_config::load_or_generate_cert("cert.pem", "").is_err());
    }
}
