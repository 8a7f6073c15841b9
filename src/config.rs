use crate::constants::*;
use crate::network::role::Role;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Interface to bind the accept socket on
    pub bind_addr: Option<String>,
    /// Name and domain reported in the identity response
    pub name: Option<String>,
    pub domain: Option<String>,
    /// Roles this server serves
    pub roles: Role,
    /// Other servers advertised to peers in the identity response
    pub peers: Option<Vec<PeerConfig>>,
    /// Proxy addresses advertised to peers
    pub proxies: Option<Vec<String>>,
    /// Reconciliation / liveness settings (table [reconcile])
    pub reconcile: Option<ReconcileConfig>,
    /// Per-connection buffer limits (table [connection])
    pub connection: Option<ConnectionConfig>,
    /// Optional TLS material (table [encryption])
    pub encryption: Option<EncryptionConfig>,
    /// Logging / events configuration
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub roles: Role,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between reconciliation ticks
    pub interval_secs: Option<u64>,
    /// Close connections silent for longer than this; 0 disables the deadline
    pub keepalive_timeout_secs: Option<u64>,
    /// Fail server-originated requests unanswered for longer than this
    pub request_timeout_secs: Option<u64>,
    /// Upper bound on object references per flushed update message
    pub max_updates_per_message: Option<usize>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: Some(DEFAULT_RECONCILE_INTERVAL_SECS),
            keepalive_timeout_secs: Some(0),
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_updates_per_message: Some(DEFAULT_MAX_UPDATES_PER_MESSAGE),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Suggested receive allocation; floored at MIN_READ_BUFFER_BYTES
    pub read_buffer_bytes: Option<usize>,
    /// Deliver reads with a trailing NUL that is not counted in the logical length
    pub null_terminate_reads: Option<bool>,
    pub max_frame_bytes: Option<usize>,
    /// Queued outbound bytes that force a disconnect
    pub outbound_high_water_bytes: Option<usize>,
    /// How long stop() waits for draining connections
    pub drain_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: Some(DEFAULT_READ_BUFFER_BYTES),
            null_terminate_reads: Some(false),
            max_frame_bytes: Some(DEFAULT_MAX_FRAME_BYTES),
            outbound_high_water_bytes: Some(DEFAULT_OUTBOUND_HIGH_WATER_BYTES),
            drain_timeout_ms: Some(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Directory of *.pem CA certificates, or a single PEM bundle
    pub ca_store: Option<String>,
    /// PEM file holding the server certificate chain and private key
    pub server_key: Option<String>,
    /// Passphrase for the server key (encrypted keys are rejected)
    pub server_key_pass: Option<String>,
    /// Require and verify client certificates against ca_store
    pub verify_peers: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Path to JSON line event log (rotated). If unset, defaults to logs/opflex_events.jsonl
    pub json_path: Option<String>,
    /// Max size in bytes before rotation (default 5MB)
    pub json_max_bytes: Option<usize>,
    /// Number of rotated files to retain (default 3)
    pub json_rotate: Option<u32>,
    /// Disable console sink (default false)
    pub disable_console: Option<bool>,
    /// Minimum level printed to the console (default info)
    pub console_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: Some("0.0.0.0".to_string()),
            name: Some(DEFAULT_APP_NAME.to_string()),
            domain: Some("opflex".to_string()),
            roles: Role::POLICY_REPOSITORY | Role::ENDPOINT_REGISTRY | Role::OBSERVER,
            peers: None,
            proxies: None,
            reconcile: Some(ReconcileConfig::default()),
            connection: Some(ConnectionConfig::default()),
            encryption: None,
            logging: None,
        }
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path))?;
        let cfg: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file '{}'", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.roles.is_empty() {
            anyhow::bail!("config: roles must name at least one role");
        }
        if self.reconcile_interval().is_zero() {
            anyhow::bail!("config: reconcile.interval_secs must be greater than zero");
        }
        if let Some(enc) = &self.encryption {
            if enc.enabled && enc.server_key.is_none() {
                anyhow::bail!("config: encryption enabled without encryption.server_key");
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!(
            "{}:{}",
            self.bind_addr.as_deref().unwrap_or("0.0.0.0"),
            self.port
        )
    }

    pub fn server_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string())
    }

    pub fn server_domain(&self) -> String {
        self.domain.clone().unwrap_or_else(|| "opflex".to_string())
    }

    fn reconcile_cfg(&self) -> ReconcileConfig {
        self.reconcile.clone().unwrap_or_default()
    }

    fn connection_cfg(&self) -> ConnectionConfig {
        self.connection.clone().unwrap_or_default()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(
            self.reconcile_cfg()
                .interval_secs
                .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
        )
    }

    /// None when the inactivity deadline is disabled.
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        match self.reconcile_cfg().keepalive_timeout_secs.unwrap_or(0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.reconcile_cfg()
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn max_updates_per_message(&self) -> usize {
        self.reconcile_cfg()
            .max_updates_per_message
            .unwrap_or(DEFAULT_MAX_UPDATES_PER_MESSAGE)
            .max(1)
    }

    pub fn read_buffer_bytes(&self) -> usize {
        self.connection_cfg()
            .read_buffer_bytes
            .unwrap_or(DEFAULT_READ_BUFFER_BYTES)
    }

    pub fn null_terminate_reads(&self) -> bool {
        self.connection_cfg().null_terminate_reads.unwrap_or(false)
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.connection_cfg()
            .max_frame_bytes
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn outbound_high_water_bytes(&self) -> usize {
        self.connection_cfg()
            .outbound_high_water_bytes
            .unwrap_or(DEFAULT_OUTBOUND_HIGH_WATER_BYTES)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connection_cfg()
                .drain_timeout_ms
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
        )
    }

    pub fn tls_enabled(&self) -> bool {
        self.encryption.as_ref().map(|e| e.enabled).unwrap_or(false)
    }
}
