use std::{
    sync::Mutex as StdMutex,
    time::{Duration, Instant},
};

use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

use crate::tunnel::{
    error::TunnelError,
    protocol::{self, SignalId},
    transport::BoxedStream,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Outside-peer stand-in for one registered inside peer.
///
/// Turns "give me a connection to this peer" into a nudge on the peer's
/// signal stream plus a wait for the matching outgoing connection. Delivered
/// connections are handed out in delivery order, one per request.
pub struct ConnectionProxy {
    id: SignalId,
    signal: Mutex<BoxedStream>,
    tx: mpsc::UnboundedSender<BoxedStream>,
    // Fair lock: concurrent requesters take turns in arrival order.
    rx: Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
    request_timeout: Duration,
    last_active: StdMutex<Instant>,
}

impl std::fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("id", &self.id)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionProxy {
    pub fn new(id: SignalId, signal: BoxedStream, request_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            signal: Mutex::new(signal),
            tx,
            rx: Mutex::new(rx),
            request_timeout,
            last_active: StdMutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Tells the inside peer its id. Sent once, right after registration.
    pub async fn write_signal_id(&self) -> Result<(), TunnelError> {
        let mut signal = self.signal.lock().await;
        protocol::write_signal_id(&mut *signal, self.id).await?;
        Ok(())
    }

    /// Queues a connection the inside peer opened for this id.
    pub fn deliver(&self, stream: BoxedStream) {
        self.touch();
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.tx.send(stream);
    }

    /// Nudges the inside peer and waits for the next delivered connection.
    ///
    /// The request timeout covers the nudge as well, so a peer that stopped
    /// reading its signal stream cannot stall the caller. On timeout the
    /// queue is left untouched: a connection that arrives late goes to the
    /// next caller. No retry is attempted here.
    pub async fn request(&self) -> Result<BoxedStream, TunnelError> {
        self.touch();

        let nudge_and_wait = async {
            {
                let mut signal = self.signal.lock().await;
                protocol::write_nudge(&mut *signal).await?;
            }
            let mut rx = self.rx.lock().await;
            Ok::<_, protocol::ProtocolError>(rx.recv().await)
        };

        match tokio::time::timeout(self.request_timeout, nudge_and_wait).await {
            Ok(Ok(Some(stream))) => {
                self.touch();
                Ok(stream)
            }
            Ok(Ok(None)) => Err(TunnelError::Closed),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                metrics::counter!("drbfire_requests_timed_out_total").increment(1);
                tracing::warn!(
                    id = self.id,
                    timeout = %humantime::format_duration(self.request_timeout),
                    "tunnel: no connection delivered in time"
                );
                Err(TunnelError::ConnectionUnavailable(self.id))
            }
        }
    }

    /// Time since the last registration, delivery or request.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Shuts the signal stream down, which ends the inside peer's accept loop.
    pub async fn close(&self) {
        let mut signal = self.signal.lock().await;
        let _ = signal.shutdown().await;
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_active.lock() {
            *t = Instant::now();
        }
    }
}
