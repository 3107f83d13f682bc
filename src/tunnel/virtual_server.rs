use std::sync::Arc;

use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, watch},
};

use crate::tunnel::{
    error::TunnelError,
    protocol::{self, ConnectionType, SignalId},
    transport::{BoxedStream, Transport},
    uri::Address,
};

/// Listening endpoint for a peer that cannot accept inbound connections.
///
/// Keeps one signal stream open to the outside peer. Each nudge received on
/// it is answered with a fresh outbound connection, which `accept()` returns
/// as if it had been accepted locally.
pub struct VirtualServer {
    transport: Arc<dyn Transport>,
    remote: Address,
    signal_id: SignalId,
    signal: Mutex<BoxedStream>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for VirtualServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualServer")
            .field("remote", &self.remote)
            .field("signal_id", &self.signal_id)
            .finish_non_exhaustive()
    }
}

impl VirtualServer {
    /// Registers with the outside peer at `remote_uri` and waits for an id.
    pub async fn open(transport: Arc<dyn Transport>, remote_uri: &str) -> Result<Self, TunnelError> {
        let remote = Address::parse(remote_uri)?.base();

        let mut signal = transport.open(&remote.socket_addr()).await?;
        protocol::write_connection_type(&mut signal, ConnectionType::Signal).await?;
        let signal_id = protocol::read_signal_id(&mut signal).await?;

        tracing::info!(remote = %remote, id = signal_id, "tunnel: registered with outside peer");

        Ok(Self {
            transport,
            remote,
            signal_id,
            signal: Mutex::new(signal),
            closed: watch::channel(false).0,
        })
    }

    pub fn signal_id(&self) -> SignalId {
        self.signal_id
    }

    /// The logical address peers use to reach this endpoint: `remote?id`.
    pub fn uri(&self) -> String {
        self.remote.with_token(self.signal_id.to_string()).to_string()
    }

    /// Waits for a nudge and answers it with a new outbound connection.
    pub async fn accept(&self) -> Result<BoxedStream, TunnelError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TunnelError::Closed);
        }

        {
            let mut signal = self.signal.lock().await;
            tokio::select! {
                _ = closed.wait_for(|c| *c) => return Err(TunnelError::Closed),
                res = protocol::read_nudge(&mut *signal) => match res {
                    Ok(()) => {}
                    Err(err) if err.is_eof() => {
                        tracing::info!(id = self.signal_id, "tunnel: outside peer closed the signal stream");
                        return Err(TunnelError::Closed);
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }

        let mut st = self.transport.open(&self.remote.socket_addr()).await?;
        protocol::write_connection_type(&mut st, ConnectionType::Outgoing).await?;
        protocol::write_signal_id(&mut st, self.signal_id).await?;
        tracing::debug!(id = self.signal_id, "tunnel: answered nudge");
        Ok(st)
    }

    /// Closes the signal stream. Pending and future `accept()` calls fail
    /// with `Closed`.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        let mut signal = self.signal.lock().await;
        let _ = signal.shutdown().await;
    }
}
