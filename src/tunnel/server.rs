use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::tunnel::{
    dispatcher::{Dispatcher, DispatcherOptions},
    error::TunnelError,
    protocol::SignalId,
    registry::SignalRegistry,
    transport::{BoxedStream, Transport},
    uri::{self, Address},
};

/// The outside peer's one real listening endpoint.
///
/// `accept()` yields incoming sessions; connections to registered inside
/// peers are obtained through [`TunnelServer::open_signal`].
pub struct TunnelServer {
    uri: String,
    registry: Arc<SignalRegistry>,
    incoming: Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl TunnelServer {
    /// Binds `uri` through `transport` and starts the dispatcher.
    pub async fn bind(
        transport: &dyn Transport,
        uri: &str,
        registry: Arc<SignalRegistry>,
        opts: DispatcherOptions,
    ) -> Result<Self, TunnelError> {
        let addr = Address::parse(uri)?;
        let listener = transport.open_server(&addr.socket_addr()).await?;
        let public_uri = uri::rewrite_scheme(&listener.uri())?;

        tracing::info!(
            uri = %public_uri,
            transport = transport.scheme(),
            handshake_timeout = %humantime::format_duration(opts.handshake_timeout),
            "tunnel: listening"
        );

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(listener, registry.clone(), opts, incoming_tx);
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        Ok(Self {
            uri: public_uri,
            registry,
            incoming: Mutex::new(incoming_rx),
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Public uri; the real port even when bound to port 0.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    /// Next incoming session. `Closed` once the dispatcher has stopped.
    pub async fn accept(&self) -> Result<BoxedStream, TunnelError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TunnelError::Closed)
    }

    /// A new logical connection to the inside peer registered as `id`.
    pub async fn open_signal(&self, id: SignalId) -> Result<BoxedStream, TunnelError> {
        self.registry.request(id).await
    }

    /// Stops the dispatcher and closes the listener. Registrations stay in
    /// the registry; evict them explicitly if the peers should be released.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tunnel::{
        protocol::{self, ConnectionType},
        transport::tcp::TcpTransport,
        virtual_server::VirtualServer,
    };

    async fn bind_local(registry: Arc<SignalRegistry>) -> TunnelServer {
        bind_with(registry, DispatcherOptions::default()).await
    }

    async fn bind_with(registry: Arc<SignalRegistry>, opts: DispatcherOptions) -> TunnelServer {
        TunnelServer::bind(&TcpTransport::new(), "drbfire://127.0.0.1:0", registry, opts)
            .await
            .unwrap()
    }

    fn socket_addr(server: &TunnelServer) -> String {
        Address::parse(server.uri()).unwrap().socket_addr()
    }

    #[tokio::test]
    async fn uri_reports_ephemeral_port() {
        let server = bind_local(Arc::new(SignalRegistry::default())).await;
        let addr = Address::parse(server.uri()).unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_ne!(addr.port, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn signal_registration_then_request_reaches_inside_peer() {
        let server = bind_local(Arc::new(SignalRegistry::default())).await;
        let addr = socket_addr(&server);

        // Inside peer, by hand: register and read the assigned id.
        let mut signal = tokio::net::TcpStream::connect(&addr).await.unwrap();
        protocol::write_connection_type(&mut signal, ConnectionType::Signal)
            .await
            .unwrap();
        let id = protocol::read_signal_id(&mut signal).await.unwrap();
        assert_eq!(id, 1);

        let inside = tokio::spawn(async move {
            protocol::read_nudge(&mut signal).await.unwrap();
            let mut out = tokio::net::TcpStream::connect(&addr).await.unwrap();
            protocol::write_connection_type(&mut out, ConnectionType::Outgoing)
                .await
                .unwrap();
            protocol::write_signal_id(&mut out, id).await.unwrap();
            let mut buf = [0u8; 4];
            out.read_exact(&mut buf).await.unwrap();
            out.write_all(b"pong").await.unwrap();
            (buf, signal)
        });

        let mut st = server.open_signal(id).await.unwrap();
        st.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        st.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        let (got, _signal) = inside.await.unwrap();
        assert_eq!(&got, b"ping");
        server.close().await;
    }

    #[tokio::test]
    async fn unknown_tag_is_dropped_while_incoming_succeeds() {
        let server = bind_local(Arc::new(SignalRegistry::default())).await;
        let addr = socket_addr(&server);

        let mut bad = tokio::net::TcpStream::connect(&addr).await.unwrap();
        bad.write_all(b"x").await.unwrap();

        let mut good = tokio::net::TcpStream::connect(&addr).await.unwrap();
        protocol::write_connection_type(&mut good, ConnectionType::Incoming)
            .await
            .unwrap();
        good.write_all(b"hello").await.unwrap();

        let mut st = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 5];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // The bad connection was closed by the outside peer.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), bad.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn outgoing_for_unknown_id_is_dropped() {
        let registry = Arc::new(SignalRegistry::default());
        let server = bind_local(registry.clone()).await;
        let addr = socket_addr(&server);

        let mut stray = tokio::net::TcpStream::connect(&addr).await.unwrap();
        protocol::write_connection_type(&mut stray, ConnectionType::Outgoing)
            .await
            .unwrap();
        protocol::write_signal_id(&mut stray, 77).await.unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stray.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(registry.is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_handshake_timeout() {
        let server = bind_with(
            Arc::new(SignalRegistry::default()),
            DispatcherOptions {
                handshake_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await;
        let addr = socket_addr(&server);

        let mut silent = tokio::net::TcpStream::connect(&addr).await.unwrap();

        let mut good = tokio::net::TcpStream::connect(&addr).await.unwrap();
        protocol::write_connection_type(&mut good, ConnectionType::Incoming)
            .await
            .unwrap();
        good.write_all(b"hi").await.unwrap();

        let mut st = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 2];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Never sent a tag, so the outside peer hangs up on it.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn idle_sweep_evicts_quiet_registration() {
        let registry = Arc::new(SignalRegistry::default());
        let server = bind_with(
            registry.clone(),
            DispatcherOptions {
                idle_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .await;

        let vs = VirtualServer::open(Arc::new(TcpTransport::new()), server.uri())
            .await
            .unwrap();
        assert_eq!(vs.signal_id(), 1);
        assert_eq!(registry.len(), 1);

        // No traffic: the next sweep closes the signal stream.
        let res = tokio::time::timeout(Duration::from_secs(10), vs.accept())
            .await
            .unwrap();
        assert!(matches!(res, Err(TunnelError::Closed)));
        assert!(registry.is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn close_ends_accept() {
        let server = bind_local(Arc::new(SignalRegistry::default())).await;
        server.close().await;
        assert!(matches!(server.accept().await, Err(TunnelError::Closed)));
    }
}
