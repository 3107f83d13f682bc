use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::net;
use crate::tunnel::transport::{BoxedStream, Transport, TransportListener};

pub const SCHEME: &str = "druby";

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn open(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(dial(addr).await?))
    }

    async fn open_server(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        Ok(Box::new(TcpTransportListener::bind(addr, SCHEME).await?))
    }
}

pub(crate) async fn dial(addr: &str) -> anyhow::Result<TcpStream> {
    let c = TcpStream::connect(addr)
        .await
        .with_context(|| format!("tcp: connect {addr}"))?;
    c.set_nodelay(true)?;
    Ok(c)
}

pub struct TcpTransportListener {
    ln: TcpListener,
    host: String,
    scheme: &'static str,
    closed: watch::Sender<bool>,
}

impl TcpTransportListener {
    pub(crate) async fn bind(addr: &str, scheme: &'static str) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("tcp: bind {addr}"))?;

        // Report the host the caller asked for, not the wildcard we bound.
        let host = match net::split_host_port(&bind_addr) {
            Some((h, _)) if !h.is_empty() => h.to_string(),
            _ => "0.0.0.0".to_string(),
        };

        Ok(Self {
            ln,
            host,
            scheme,
            closed: watch::channel(false).0,
        })
    }

    pub(crate) async fn accept_tcp(&self) -> anyhow::Result<TcpStream> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            anyhow::bail!("tcp: listener closed");
        }
        tokio::select! {
            _ = closed.wait_for(|c| *c) => anyhow::bail!("tcp: listener closed"),
            res = self.ln.accept() => {
                let (c, _) = res?;
                c.set_nodelay(true)?;
                Ok(c)
            }
        }
    }

    pub(crate) fn close_now(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(self.accept_tcp().await?))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    fn uri(&self) -> String {
        let port = self.local_addr().map(|a| a.port()).unwrap_or_default();
        format!("{}://{}", self.scheme, net::join_host_port(&self.host, port))
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The socket itself is released on drop; this only wakes accept().
        self.close_now();
        Ok(())
    }
}
