//! Outside-peer accept loop.
//!
//! Every physical connection on the listening port starts with a one-byte
//! type tag. Handshakes are read in short-lived tasks and reported back to a
//! single coordinating loop, which alone touches the registry. One bad or
//! silent peer therefore never stalls or terminates the loop; only a failure
//! of the listener itself does.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::tunnel::{
    protocol::{self, ConnectionType, ProtocolError, SignalId},
    registry::SignalRegistry,
    transport::{BoxedStream, TransportListener},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Bound on reading the tag (and id) of a fresh connection.
    pub handshake_timeout: Duration,
    /// Evict registrations idle for longer than this. Zero disables eviction.
    pub idle_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Duration::ZERO,
        }
    }
}

/// A physical connection whose header has been read.
pub(crate) enum Handshake {
    Incoming(BoxedStream),
    Outgoing(SignalId, BoxedStream),
    Signal(BoxedStream),
}

impl Handshake {
    fn kind(&self) -> ConnectionType {
        match self {
            Handshake::Incoming(_) => ConnectionType::Incoming,
            Handshake::Outgoing(..) => ConnectionType::Outgoing,
            Handshake::Signal(_) => ConnectionType::Signal,
        }
    }
}

pub(crate) async fn read_handshake(mut st: BoxedStream) -> Result<Handshake, ProtocolError> {
    match protocol::read_connection_type(&mut st).await? {
        ConnectionType::Incoming => Ok(Handshake::Incoming(st)),
        ConnectionType::Outgoing => {
            let id = protocol::read_signal_id(&mut st).await?;
            Ok(Handshake::Outgoing(id, st))
        }
        ConnectionType::Signal => Ok(Handshake::Signal(st)),
    }
}

pub(crate) struct Dispatcher {
    listener: Box<dyn TransportListener>,
    registry: Arc<SignalRegistry>,
    opts: DispatcherOptions,
    incoming: mpsc::UnboundedSender<BoxedStream>,
}

impl Dispatcher {
    pub(crate) fn new(
        listener: Box<dyn TransportListener>,
        registry: Arc<SignalRegistry>,
        opts: DispatcherOptions,
        incoming: mpsc::UnboundedSender<BoxedStream>,
    ) -> Self {
        Self {
            listener,
            registry,
            opts,
            incoming,
        }
    }

    /// Runs until `shutdown` flips or the listener fails. Dropping `incoming`
    /// on return is what tells `accept()` callers there is nothing more.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let uri = self.listener.uri();
        let (events_tx, mut events_rx) = mpsc::channel::<Handshake>(64);
        let mut sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(uri = %uri, "tunnel: dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sweep.tick(), if !self.opts.idle_timeout.is_zero() => {
                    let evicted = self.registry.evict_idle(self.opts.idle_timeout).await;
                    if !evicted.is_empty() {
                        tracing::info!(ids = ?evicted, "tunnel: evicted idle peers");
                    }
                }
                Some(hs) = events_rx.recv() => {
                    self.dispatch(hs).await;
                }
                res = self.listener.accept() => {
                    let st = match res {
                        Ok(st) => st,
                        Err(err) => {
                            tracing::warn!(uri = %uri, err = %err, "tunnel: listener failed; dispatcher stopping");
                            break;
                        }
                    };
                    let tx = events_tx.clone();
                    let timeout = self.opts.handshake_timeout;
                    tokio::spawn(async move {
                        match tokio::time::timeout(timeout, read_handshake(st)).await {
                            Ok(Ok(hs)) => {
                                let _ = tx.send(hs).await;
                            }
                            Ok(Err(err)) => {
                                metrics::counter!("drbfire_protocol_violations_total").increment(1);
                                if err.is_eof() {
                                    tracing::debug!("tunnel: connection closed before handshake");
                                } else {
                                    tracing::warn!(err = %err, "tunnel: bad handshake; dropping connection");
                                }
                            }
                            Err(_) => {
                                metrics::counter!("drbfire_protocol_violations_total").increment(1);
                                tracing::debug!("tunnel: handshake timed out; dropping connection");
                            }
                        }
                    });
                }
            }
        }

        if let Err(err) = self.listener.close().await {
            tracing::debug!(err = %err, "tunnel: listener close failed");
        }
        tracing::info!(uri = %uri, "tunnel: dispatcher stopped");
    }

    async fn dispatch(&self, hs: Handshake) {
        metrics::counter!("drbfire_connections_total", "type" => hs.kind().as_str()).increment(1);
        match hs {
            Handshake::Incoming(st) => {
                if self.incoming.send(st).is_err() {
                    tracing::debug!("tunnel: no acceptor left; dropping incoming connection");
                }
            }
            Handshake::Outgoing(id, st) => {
                if let Err(err) = self.registry.deliver(id, st) {
                    metrics::counter!("drbfire_protocol_violations_total").increment(1);
                    tracing::warn!(id, err = %err, "tunnel: outgoing connection for unknown peer; dropping");
                }
            }
            Handshake::Signal(st) => match self.registry.register_signal(st).await {
                Ok(proxy) => {
                    tracing::info!(id = proxy.id(), "tunnel: peer registered");
                }
                Err(err) => {
                    tracing::warn!(err = %err, "tunnel: signal registration failed");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn handshake_from(bytes: &[u8]) -> Result<Handshake, ProtocolError> {
        let (near, mut far) = tokio::io::duplex(64);
        far.write_all(bytes).await.unwrap();
        drop(far);
        read_handshake(Box::new(near)).await
    }

    #[tokio::test]
    async fn classifies_each_tag() {
        assert!(matches!(handshake_from(b"1").await, Ok(Handshake::Incoming(_))));
        assert!(matches!(handshake_from(b"3").await, Ok(Handshake::Signal(_))));
        match handshake_from(&[b'2', 0, 0, 1, 0]).await {
            Ok(Handshake::Outgoing(id, _)) => assert_eq!(id, 256),
            _ => panic!("expected outgoing"),
        }
    }

    #[tokio::test]
    async fn rejects_unknown_tag_and_truncation() {
        assert!(matches!(
            handshake_from(b"9").await,
            Err(ProtocolError::UnknownTag(b'9'))
        ));
        assert!(matches!(handshake_from(b"").await, Err(e) if e.is_eof()));
        assert!(matches!(handshake_from(&[b'2', 0, 0]).await, Err(e) if e.is_eof()));
    }
}
