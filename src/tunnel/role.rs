use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::tunnel::{
    dispatcher::{DEFAULT_HANDSHAKE_TIMEOUT, DispatcherOptions},
    error::TunnelError,
    protocol::{self, ConnectionType},
    proxy::DEFAULT_REQUEST_TIMEOUT,
    registry::SignalRegistry,
    server::TunnelServer,
    transport::{BoxedStream, Transport, tcp::TcpTransport},
    uri::Address,
    virtual_server::VirtualServer,
};

/// Which side of the firewall this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publicly reachable; owns the real listener and the registry.
    Server,
    /// Behind NAT; listens through a signal stream.
    Client,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            _ => anyhow::bail!("unknown role {s:?} (expected server|client)"),
        }
    }
}

#[derive(Clone)]
pub struct ProtocolOptions {
    pub role: Option<Role>,
    /// Byte-stream delegate; plain TCP when unset.
    pub delegate: Option<Arc<dyn Transport>>,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Zero disables idle eviction.
    pub idle_timeout: Duration,
}

impl std::fmt::Debug for ProtocolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolOptions")
            .field("role", &self.role)
            .field("delegate", &self.delegate.as_ref().map(|d| d.scheme()))
            .field("request_timeout", &self.request_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            role: None,
            delegate: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Duration::ZERO,
        }
    }
}

/// Entry point of the tunnel: picks outside- or inside-peer behavior for
/// `open_server` and `open` from the configured role.
pub struct Protocol {
    role: Option<Role>,
    delegate: Arc<dyn Transport>,
    registry: Arc<SignalRegistry>,
    dispatcher: DispatcherOptions,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("role", &self.role)
            .field("delegate", &self.delegate.scheme())
            .finish_non_exhaustive()
    }
}

impl Protocol {
    pub fn new(opts: ProtocolOptions) -> Self {
        let delegate = opts
            .delegate
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));
        Self {
            role: opts.role,
            delegate,
            registry: Arc::new(SignalRegistry::new(opts.request_timeout)),
            dispatcher: DispatcherOptions {
                handshake_timeout: opts.handshake_timeout,
                idle_timeout: opts.idle_timeout,
            },
        }
    }

    pub fn role(&self) -> Result<Role, TunnelError> {
        self.role.ok_or(TunnelError::Configuration("missing role"))
    }

    /// Registrations seen by this instance when acting as the outside peer.
    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    /// Starts listening on `uri`.
    ///
    /// The outside peer binds a real socket there. The inside peer registers
    /// with the outside peer at `uri` instead and binds nothing.
    pub async fn open_server(&self, uri: &str) -> Result<Endpoint, TunnelError> {
        match self.role()? {
            Role::Server => {
                let server = TunnelServer::bind(
                    self.delegate.as_ref(),
                    uri,
                    self.registry.clone(),
                    self.dispatcher.clone(),
                )
                .await?;
                Ok(Endpoint::Outside(server))
            }
            Role::Client => {
                let vs = VirtualServer::open(self.delegate.clone(), uri).await?;
                Ok(Endpoint::Inside(vs))
            }
        }
    }

    /// Opens a logical connection to `uri`.
    ///
    /// The outside peer reaches an inside peer by the id in the uri token.
    /// The inside peer dials the outside peer directly.
    pub async fn open(&self, uri: &str) -> Result<BoxedStream, TunnelError> {
        let role = self.role()?;
        let addr = Address::parse(uri)?;
        match role {
            Role::Server => {
                let id = addr
                    .signal_id()
                    .ok_or_else(|| TunnelError::BadUri(format!("{uri}: missing signal id")))?;
                tracing::debug!(id, "tunnel: requesting connection to inside peer");
                self.registry.request(id).await
            }
            Role::Client => {
                let mut st = self.delegate.open(&addr.socket_addr()).await?;
                protocol::write_connection_type(&mut st, ConnectionType::Incoming).await?;
                Ok(st)
            }
        }
    }
}

/// A listening endpoint returned by [`Protocol::open_server`].
#[derive(Debug)]
pub enum Endpoint {
    Outside(TunnelServer),
    Inside(VirtualServer),
}

impl Endpoint {
    /// The uri peers use to reach this endpoint.
    pub fn uri(&self) -> String {
        match self {
            Endpoint::Outside(s) => s.uri().to_string(),
            Endpoint::Inside(vs) => vs.uri(),
        }
    }

    pub async fn accept(&self) -> Result<BoxedStream, TunnelError> {
        match self {
            Endpoint::Outside(s) => s.accept().await,
            Endpoint::Inside(vs) => vs.accept().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Endpoint::Outside(s) => s.close().await,
            Endpoint::Inside(vs) => vs.close().await,
        }
    }
}
