pub mod client;
pub mod connection;
pub(crate) mod events;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod message;
pub mod pending;
pub mod role;
pub mod roster;
pub mod timer;
pub mod transport;

pub use client::PeerClient;
pub use connection::{Connection, ConnectionId, ConnectionInfo, ConnectionState};
pub use handler::{Handler, Identity};
pub use listener::{Listener, ListenerHandle, ListenerSettings, ShutdownReport};
pub use message::{Envelope, MessageKind, OutboundMessage, RpcError};
pub use pending::{PendingUpdates, SharedPending};
pub use role::Role;
