//! # opflex-server
//!
//! Connection and messaging engine for an OpFlex-style policy server.
//!
//! Peers (agents) open long-lived connections, announce their roles with an
//! identity handshake and then resolve, push and receive policy objects as
//! NUL-terminated JSON-RPC messages. The server keeps every connection on one
//! event loop, coalesces store changes per peer and flushes them on a
//! periodic reconciliation tick.
//!
//! ## Key Modules
//! * `config` – TOML configuration with defaults for every value.
//! * `network` – Transport, framing, codec, connection state machine,
//!   protocol handler and the listener event loop.
//! * `security` – Cleartext or TLS byte streams behind one interface.
//! * `store` – The object-store seam and an in-memory implementation.
//! * `server` – `PolicyServer`, which owns the event-loop thread.
//! * `events` – Structured logging/events dispatcher.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod network;
pub mod prelude; // curated re-exports
pub mod security;
pub mod server;
pub mod store;

pub use server::PolicyServer;
