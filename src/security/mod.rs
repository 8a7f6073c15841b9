pub mod secure_channel;

pub use secure_channel::{
    make_secure_channel, AuthSummary, Channel, PlaintextChannel, SecureChannel, SecurityBackend,
    TlsSecureChannel, TlsServerSettings,
};
