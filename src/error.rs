//! Error types shared across the engine's seams.

use crate::network::connection::{ConnectionId, ConnectionState};
use crate::network::frame::FrameError;
use crate::network::message::{ParseError, RpcError};
use crate::store::StoreError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("a write is already in progress on this connection")]
    WriteInProgress,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("private key in {0} is passphrase protected; supply an unencrypted key")]
    EncryptedKey(String),
    #[error("tls configuration: {0}")]
    Config(String),
    #[error("tls handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("channel was built without {0} configuration")]
    NotConfigured(&'static str),
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Config(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection {0} is not accepting messages ({1})")]
    NotAccepting(ConnectionId, ConnectionState),
    #[error("connection {id} exceeded its outbound high-water mark ({queued} bytes queued)")]
    HighWater { id: ConnectionId, queued: usize },
    #[error("encoding {method} failed: {reason}")]
    Encode { method: String, reason: String },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Why a server-originated request produced no result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestFailure {
    #[error("peer answered with an error: {0}")]
    Remote(RpcError),
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("no response within the request timeout")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("listener is no longer running")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("event loop: {0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("connection closed by server")]
    Closed,
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(TransportError::Io(e))
    }
}
