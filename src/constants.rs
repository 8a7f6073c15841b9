//! Central place for application-wide constants and default values.

/// Default application name (can be overridden in config)
pub const DEFAULT_APP_NAME: &str = "opflex-server";

/// Left padding used to align console log lines.
pub const ICON_PLACEHOLDER: &str = "   "; // Three spaces for alignment

/// Protocol branding shown in logs
pub const PROTOCOL_NAME: &str = "opflex";
/// Protocol version advertised in the identity response (bump when wire format changes)
pub const PROTOCOL_VERSION: &str = "1.0";

/// Application / crate version (populated from Cargo.toml via env! macro)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port for the policy repository.
pub const DEFAULT_PORT: u16 = 8009;

/// Every JSON message on the wire is terminated by this byte.
pub const FRAME_DELIMITER: u8 = 0;

/// Receive buffers are never allocated smaller than this, whatever the I/O layer suggests.
pub const MIN_READ_BUFFER_BYTES: usize = 4096;

/// Suggested receive allocation when the config leaves it unset.
pub const DEFAULT_READ_BUFFER_BYTES: usize = 64 * 1024;

/// Largest frame accepted before the stream is considered desynchronised.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Queued outbound bytes that force a disconnect of an unresponsive peer.
pub const DEFAULT_OUTBOUND_HIGH_WATER_BYTES: usize = 64 * 1024 * 1024;

/// Default reconciliation tick (seconds).
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 3600;

/// Default time a server-originated request may stay unanswered (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default number of object references carried by one update message.
pub const DEFAULT_MAX_UPDATES_PER_MESSAGE: usize = 1024;

/// Default time `stop()` waits for draining connections (milliseconds).
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;

/// Store client name used for all server-side store access.
pub const SYSTEM_STORE_CLIENT: &str = "_SYSTEM_";

/// Human friendly composite version string used in logs.
pub fn full_version() -> String {
    format!("v{} (protocol={} {})", APP_VERSION, PROTOCOL_NAME, PROTOCOL_VERSION)
}
