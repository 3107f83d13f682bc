//! NAT rendezvous tunnel.
//!
//! An inside peer that can only dial out keeps one signal stream open to a
//! publicly reachable outside peer. When the outside peer wants a new logical
//! connection to it, it writes a nudge on that stream and the inside peer dials
//! back with a tagged connection, which is matched to the waiting request by
//! signal id. Everything rides on the outside peer's single listening port.

pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod role;
pub mod server;
pub mod transport;
pub mod uri;
pub mod virtual_server;

pub use error::TunnelError;
pub use role::{Endpoint, Protocol, ProtocolOptions, Role};
