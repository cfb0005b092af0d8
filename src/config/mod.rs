use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4400;
/// Sessions/machines are demoted when no heartbeat arrives within this window.
const DEFAULT_LIVENESS_WINDOW_MS: i64 = 30_000;
/// Minimum gap between heartbeat-only session broadcasts.
const DEFAULT_BROADCAST_GAP_MS: i64 = 10_000;
/// Keep-alive cadence on live client subscriptions.
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Pending permission requests are cancelled after this long.
const DEFAULT_PERMISSION_TIMEOUT_MS: i64 = 30 * 60_000;
/// Cadence of the liveness/permission sweep.
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;
/// Bound of each subscription's outbound queue.
const DEFAULT_SUBSCRIPTION_QUEUE: usize = 256;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP/WebSocket server port (default: 4400).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,hubd=trace" (default: "info").
    log: Option<String>,
    /// Liveness window in milliseconds (default: 30000).
    liveness_window_ms: Option<i64>,
    /// Heartbeat broadcast coalescing gap in milliseconds (default: 10000).
    broadcast_gap_ms: Option<i64>,
    /// Subscription keep-alive interval in milliseconds (default: 30000).
    heartbeat_interval_ms: Option<u64>,
    /// Permission request timeout in milliseconds (default: 1800000).
    permission_timeout_ms: Option<i64>,
    /// Liveness sweep cadence in milliseconds (default: 5000).
    sweep_interval_ms: Option<u64>,
    /// Outbound queue bound per subscription (default: 256).
    subscription_queue: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share/hubd"))
        .unwrap_or_else(|| PathBuf::from("./hubd-data"))
}

// ─── HubConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub liveness_window_ms: i64,
    pub broadcast_gap_ms: i64,
    pub heartbeat_interval_ms: u64,
    pub permission_timeout_ms: i64,
    pub sweep_interval_ms: u64,
    pub subscription_queue: usize,
}

impl HubConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            liveness_window_ms: toml.liveness_window_ms.unwrap_or(DEFAULT_LIVENESS_WINDOW_MS),
            broadcast_gap_ms: toml.broadcast_gap_ms.unwrap_or(DEFAULT_BROADCAST_GAP_MS),
            heartbeat_interval_ms: toml
                .heartbeat_interval_ms
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            permission_timeout_ms: toml
                .permission_timeout_ms
                .unwrap_or(DEFAULT_PERMISSION_TIMEOUT_MS),
            sweep_interval_ms: toml.sweep_interval_ms.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
            subscription_queue: toml.subscription_queue.unwrap_or(DEFAULT_SUBSCRIPTION_QUEUE),
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HubConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.liveness_window_ms, 30_000);
        assert_eq!(cfg.permission_timeout_ms, 1_800_000);
    }

    #[test]
    fn toml_overrides_defaults_but_not_cli() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 9000\nlog = \"debug\"\nliveness_window_ms = 15000\n",
        )
        .unwrap();

        let cfg = HubConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.liveness_window_ms, 15_000);

        // CLI wins over TOML.
        let cfg = HubConfig::new(Some(4500), Some(dir.path().to_path_buf()), Some("warn".into()));
        assert_eq!(cfg.port, 4500);
        assert_eq!(cfg.log, "warn");
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = \"not a number").unwrap();
        let cfg = HubConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
