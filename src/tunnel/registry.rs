use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use crate::tunnel::{
    error::TunnelError,
    protocol::SignalId,
    proxy::{ConnectionProxy, DEFAULT_REQUEST_TIMEOUT},
    transport::BoxedStream,
};

struct State {
    last_id: SignalId,
    proxies: HashMap<SignalId, Arc<ConnectionProxy>>,
}

/// Outside-peer map from signal id to the proxy of a registered inside peer.
///
/// The id counter and the map share one lock, so concurrent registrations
/// never observe the same id. Ids start at 1 and wrap (skipping 0) after
/// `u32::MAX` registrations; a wrapped id may collide with a long-lived
/// registration, which is a known limitation of the 32-bit wire field.
pub struct SignalRegistry {
    state: Mutex<State>,
    request_timeout: Duration,
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry").finish_non_exhaustive()
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl SignalRegistry {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                last_id: 0,
                proxies: HashMap::new(),
            }),
            request_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Nothing panics while holding the lock; recover the data regardless.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate(&self) -> SignalId {
        let mut st = self.lock();
        next_id(&mut st)
    }

    pub fn register(&self, id: SignalId, proxy: Arc<ConnectionProxy>) {
        insert(&mut self.lock(), id, proxy);
    }

    pub fn lookup(&self, id: SignalId) -> Option<Arc<ConnectionProxy>> {
        self.lock().proxies.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mints a proxy for a freshly accepted signal stream and sends the
    /// inside peer its id.
    pub async fn register_signal(
        &self,
        signal: BoxedStream,
    ) -> Result<Arc<ConnectionProxy>, TunnelError> {
        let proxy = {
            let mut st = self.lock();
            let id = next_id(&mut st);
            let proxy = Arc::new(ConnectionProxy::new(id, signal, self.request_timeout));
            insert(&mut st, id, proxy.clone());
            proxy
        };

        if let Err(err) = proxy.write_signal_id().await {
            self.remove(proxy.id());
            return Err(err);
        }
        Ok(proxy)
    }

    /// Routes an outgoing connection to the proxy it was opened for.
    pub fn deliver(&self, id: SignalId, stream: BoxedStream) -> Result<(), TunnelError> {
        let proxy = self.lookup(id).ok_or(TunnelError::UnknownSignalId(id))?;
        proxy.deliver(stream);
        Ok(())
    }

    /// Obtains a new logical connection to the inside peer registered as `id`.
    ///
    /// A proxy whose signal stream can no longer be written is evicted.
    pub async fn request(&self, id: SignalId) -> Result<BoxedStream, TunnelError> {
        let proxy = self.lookup(id).ok_or(TunnelError::UnknownSignalId(id))?;
        match proxy.request().await {
            Err(TunnelError::Protocol(err)) => {
                tracing::info!(id, err=%err, "tunnel: signal stream broken; evicting peer");
                self.remove(id);
                Err(TunnelError::ConnectionUnavailable(id))
            }
            other => other,
        }
    }

    pub fn remove(&self, id: SignalId) -> Option<Arc<ConnectionProxy>> {
        let mut st = self.lock();
        let out = st.proxies.remove(&id);
        metrics::gauge!("drbfire_registered_peers").set(st.proxies.len() as f64);
        out
    }

    /// Removes a registration and closes its signal stream.
    pub async fn evict(&self, id: SignalId) -> bool {
        let Some(proxy) = self.remove(id) else {
            return false;
        };
        proxy.close().await;
        true
    }

    /// Evicts every proxy with no activity for longer than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<SignalId> {
        let stale: Vec<Arc<ConnectionProxy>> = {
            let mut st = self.lock();
            let ids: Vec<SignalId> = st
                .proxies
                .iter()
                .filter(|(_, p)| p.idle_for() > max_idle)
                .map(|(id, _)| *id)
                .collect();
            let out = ids.iter().filter_map(|id| st.proxies.remove(id)).collect();
            metrics::gauge!("drbfire_registered_peers").set(st.proxies.len() as f64);
            out
        };

        let mut ids = Vec::with_capacity(stale.len());
        for p in stale {
            p.close().await;
            ids.push(p.id());
        }
        ids.sort_unstable();
        ids
    }
}

fn insert(st: &mut State, id: SignalId, proxy: Arc<ConnectionProxy>) {
    if st.proxies.insert(id, proxy).is_some() {
        tracing::warn!(id, "tunnel: signal id reused; previous registration replaced");
    }
    metrics::gauge!("drbfire_registered_peers").set(st.proxies.len() as f64);
}

fn next_id(st: &mut State) -> SignalId {
    st.last_id = st.last_id.wrapping_add(1).max(1);
    st.last_id
}
