use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM certificate chain served by listeners. Empty (with `key_file`)
    /// means a self-signed `localhost` certificate is generated.
    pub cert_file: String,
    pub key_file: String,
    /// PEM roots trusted when dialing.
    pub ca_file: String,
    /// SNI / verification name; defaults to the dialed host.
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub tls: TlsOptions,
}

/// The byte-stream delegate underneath the tunnel.
///
/// Addresses are plain `host:port`; the tunnel strips its own scheme and token
/// before calling in.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scheme the delegate reports in listener uris (`druby`, `drbssl`).
    fn scheme(&self) -> &'static str;
    async fn open(&self, addr: &str) -> anyhow::Result<BoxedStream>;
    async fn open_server(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Fails once the listener is closed.
    async fn accept(&self) -> anyhow::Result<BoxedStream>;
    fn local_addr(&self) -> Option<SocketAddr>;
    /// `scheme://host:port` with the port actually bound.
    fn uri(&self) -> String;
    async fn close(&self) -> anyhow::Result<()>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "tls" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|tls)"),
    }
}

pub mod tcp;
pub mod tls;

pub fn transport_by_name(name: &str, opts: &TransportOptions) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "tls" => Ok(Arc::new(tls::TlsTransport::new(&opts.tls)?)),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transport_defaults_to_tcp() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" TLS ").unwrap(), "tls");
        assert!(parse_transport("quic").is_err());
    }

    #[test]
    fn transport_by_name_reports_scheme() {
        let opts = TransportOptions::default();
        assert_eq!(transport_by_name("tcp", &opts).unwrap().scheme(), "druby");
        assert_eq!(transport_by_name("tls", &opts).unwrap().scheme(), "drbssl");
    }
}
