//! Configuration for the speculative query proxy
//!
//! Values come from an optional config file, then `SQP_*` environment
//! variables (nested keys use `__`, e.g. `SQP_SPECULATION__WIDTH=2`).

use crate::error::{Result, SqpError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the MySQL listener binds to
    pub listen_addr: String,
    /// Replica addresses; index 0 is the designated read replica
    pub backends: Vec<String>,
    /// User presented to every backend (empty = reuse the client's user)
    pub backend_user: String,
    /// Password presented to every backend
    pub backend_password: String,
    /// Backend connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// TCP keepalive time in seconds for client sockets
    pub tcp_keepalive_secs: u64,
    /// Maximum concurrent client sessions
    pub max_connections: usize,
    /// Failed handshakes after which a client host is blocked
    pub max_connect_errors: u64,
    /// Address of the health/metrics HTTP endpoint (disabled when unset)
    pub metrics_addr: Option<String>,
    /// Speculation engine settings
    pub speculation: SpeculationSettings,
    /// Undo / rollback settings
    pub undo: UndoSettings,
    /// Per-session latency statistics
    pub stats: StatsSettings,
    /// Logging settings
    pub telemetry: TelemetrySettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4243".into(),
            backends: Vec::new(),
            backend_user: "root".into(),
            backend_password: String::new(),
            connect_timeout_secs: 5,
            tcp_keepalive_secs: 10,
            max_connections: 512,
            max_connect_errors: 100,
            metrics_addr: None,
            speculation: SpeculationSettings::default(),
            undo: UndoSettings::default(),
            stats: StatsSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

/// Which speculator a session is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeculatorKind {
    /// Replays a recorded reference trace
    Trace,
    /// Markov successor model learned from the reference trace
    Model,
    /// Fixed SLEEP workload used for benchmarking
    Synthetic,
    /// No speculation; plain redundant proxying
    Disabled,
}

impl FromStr for SpeculatorKind {
    type Err = SqpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "log" => Ok(SpeculatorKind::Trace),
            "model" | "markov" => Ok(SpeculatorKind::Model),
            "synthetic" => Ok(SpeculatorKind::Synthetic),
            "disabled" | "none" | "off" => Ok(SpeculatorKind::Disabled),
            other => Err(SqpError::ConfigError(format!(
                "unknown speculator kind '{}'",
                other
            ))),
        }
    }
}

/// Speculation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationSettings {
    pub kind: SpeculatorKind,
    /// Newline-delimited reference trace
    pub trace_path: Option<PathBuf>,
    /// Probability of proposing the trace successor as primary candidate
    pub hit_probability: f64,
    /// Candidates proposed per real query
    pub width: usize,
    /// Keep destructive statements out of random fill candidates
    pub avoid_destructive_fill: bool,
    /// Allow speculative writes (guarded by savepoint + undo)
    pub speculate_writes: bool,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SpeculationSettings {
    fn default() -> Self {
        Self {
            kind: SpeculatorKind::Trace,
            trace_path: None,
            hit_probability: 0.58,
            width: 1,
            avoid_destructive_fill: true,
            speculate_writes: true,
            seed: None,
        }
    }
}

/// Undo and savepoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoSettings {
    /// Primary key columns per table, used to build DELETE undo statements
    pub primary_keys: HashMap<String, Vec<String>>,
    /// Optional precomputed undo trace (`<index> <statement>` per line)
    pub undo_trace_path: Option<PathBuf>,
    /// Savepoint taken before each speculative write
    pub savepoint_name: String,
}

impl Default for UndoSettings {
    fn default() -> Self {
        Self {
            primary_keys: default_primary_keys(),
            undo_trace_path: None,
            savepoint_name: "sqp_speculation".into(),
        }
    }
}

/// Primary keys of the AuctionMark benchmark schema
fn default_primary_keys() -> HashMap<String, Vec<String>> {
    let tables: [(&str, &[&str]); 9] = [
        ("ITEM", &["i_id", "i_u_id"]),
        ("ITEM_ATTRIBUTE", &["ia_id", "ia_i_id", "ia_u_id"]),
        ("ITEM_BID", &["ib_id", "ib_i_id", "ib_u_id"]),
        ("ITEM_COMMENT", &["ic_id", "ic_i_id", "ic_u_id"]),
        ("ITEM_IMAGE", &["ii_id", "ii_i_id", "ii_u_id"]),
        ("ITEM_MAX_BID", &["imb_i_id", "imb_u_id"]),
        ("ITEM_PURCHASE", &["ip_id", "ip_ib_id", "ip_ib_i_id", "ip_ib_u_id"]),
        ("USERACCT_FEEDBACK", &["uf_u_id", "uf_i_id", "uf_i_u_id", "uf_from_id"]),
        ("USERACCT_ITEM", &["ui_u_id", "ui_i_id", "ui_i_u_id"]),
    ];
    tables
        .iter()
        .map(|(table, keys)| {
            (
                table.to_string(),
                keys.iter().map(|k| k.to_string()).collect(),
            )
        })
        .collect()
}

/// Per-session latency statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Write latency samples on session teardown
    pub enabled: bool,
    /// Directory receiving the sample files
    pub output_dir: PathBuf,
    /// Real queries between debug summaries
    pub report_interval: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from("stats"),
            report_interval: 100,
        }
    }
}

/// Telemetry/observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

impl ProxyConfig {
    /// Load from an optional file, then `SQP_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix("SQP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("backends"),
            )
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(SqpError::ConfigError(
                "at least one backend replica is required".into(),
            ));
        }
        let p = self.speculation.hit_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(SqpError::ConfigError(format!(
                "hit_probability must be within [0, 1], got {}",
                p
            )));
        }
        if self.speculation.width == 0 {
            return Err(SqpError::ConfigError(
                "speculation width must be at least 1".into(),
            ));
        }
        if self.savepoint_name_is_invalid() {
            return Err(SqpError::ConfigError(format!(
                "invalid savepoint name '{}'",
                self.undo.savepoint_name
            )));
        }
        Ok(())
    }

    fn savepoint_name_is_invalid(&self) -> bool {
        let name = &self.undo.savepoint_name;
        name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_require_backends() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.speculation.hit_probability, 0.58);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_probability() {
        let mut cfg = ProxyConfig::default();
        cfg.backends = vec!["127.0.0.1:3306".into()];
        assert!(cfg.validate().is_ok());
        cfg.speculation.hit_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_savepoint() {
        let mut cfg = ProxyConfig::default();
        cfg.backends = vec!["127.0.0.1:3306".into()];
        cfg.undo.savepoint_name = "sp; DROP".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqp.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
listen_addr = "127.0.0.1:5000"
backends = ["10.0.0.1:3306", "10.0.0.2:3306"]

[speculation]
kind = "model"
width = 2
"#
        )
        .unwrap();

        let cfg = ProxyConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:5000");
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.speculation.kind, SpeculatorKind::Model);
        assert_eq!(cfg.speculation.width, 2);
        // untouched sections keep their defaults
        assert_eq!(cfg.undo.savepoint_name, "sqp_speculation");
        assert!(cfg.undo.primary_keys.contains_key("ITEM_BID"));
    }

    #[test]
    fn test_speculator_kind_from_str() {
        assert_eq!("Trace".parse::<SpeculatorKind>().unwrap(), SpeculatorKind::Trace);
        assert_eq!("markov".parse::<SpeculatorKind>().unwrap(), SpeculatorKind::Model);
        assert!("psychic".parse::<SpeculatorKind>().is_err());
    }

    #[test]
    fn test_env_parse_or_default() {
        assert_eq!(env_parse_or_default("SQP_TEST_UNSET_VALUE", 7usize), 7);
    }
}
