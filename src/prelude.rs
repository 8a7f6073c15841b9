//! Curated re-exports for embedding the server.
//! Import with: `use opflex_server::prelude::*;`

pub use crate::config::Config;
pub use crate::error::{RequestFailure, ServerError};
pub use crate::network::{ConnectionId, ConnectionInfo, OutboundMessage, Role, ShutdownReport};
pub use crate::server::PolicyServer;
pub use crate::store::{MemoryStore, ObjectStore, PolicyUpdateOp, Reference, Uri};
