//! `GateConfig` — priority: CLI/env override > TOML file > built-in default,
//! the same layering `config::DaemonConfig` uses in the teacher.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;

const DEFAULT_PORT: u16 = 4500;
const DEFAULT_DEFAULT_LEASE_TTL_SECS: i64 = 120;
const DEFAULT_MAX_LEASE_TTL_SECS: i64 = 1800;
const DEFAULT_MAX_LEASE_RENEWALS: i32 = 10;
const DEFAULT_MAX_LEASE_LIFETIME_SECS: i64 = 7200;
const DEFAULT_MAX_ATTEMPTS: i32 = 2;
const DEFAULT_RETRY_BACKOFF_SECS: i64 = 15;
const DEFAULT_MAX_RETRY_BACKOFF_SECS: i64 = 3600;
const DEFAULT_LEASE_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_LEASE_SWEEP_BATCH: i64 = 200;
const DEFAULT_MAX_RECEIPT_BODY_BYTES: usize = 65536;
const DEFAULT_MAX_RECEIPT_PARENTS: usize = 10;
const DEFAULT_MAX_RECEIPT_ARTIFACTS: usize = 100;
const DEFAULT_OBLIGATION_CANDIDATE_HARD_CAP: i64 = 1000;
const DEFAULT_LIST_LIMIT: i64 = 50;
const DEFAULT_MAX_LIST_LIMIT: i64 = 200;

/// Whether a `task.completed` receipt lacking locatability is recorded with
/// stripped parents (lenient, the documented default) or rejected outright
/// (strict). See spec §9 design note and DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocatabilityPolicy {
    #[default]
    Lenient,
    Strict,
}

impl std::str::FromStr for LocatabilityPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown locatability policy: {other}")),
        }
    }
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    database_url: Option<String>,
    default_lease_ttl_seconds: Option<i64>,
    max_lease_ttl_seconds: Option<i64>,
    max_lease_renewals: Option<i32>,
    max_lease_lifetime_seconds: Option<i64>,
    default_max_attempts: Option<i32>,
    default_retry_backoff_seconds: Option<i64>,
    max_retry_backoff_seconds: Option<i64>,
    lease_sweep_interval_seconds: Option<u64>,
    lease_sweep_batch: Option<i64>,
    max_receipt_body_bytes: Option<usize>,
    max_receipt_parents: Option<usize>,
    max_receipt_artifacts: Option<usize>,
    obligation_candidate_hard_cap: Option<i64>,
    default_list_limit: Option<i64>,
    max_list_limit: Option<i64>,
    locatability_policy: Option<String>,
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

/// Shared default across every replica that doesn't set
/// `ASYNCGATE_INSTANCE_ID` — deliberately recognizable so a startup check
/// can refuse to run two unconfigured sweepers against the same tenant set
/// (spec §9: "a default shared identifier across replicas would silently
/// let two sweepers contend").
pub const DEFAULT_INSTANCE_ID: &str = "dev-instance";

#[derive(Debug, Clone, Serialize)]
pub struct GateConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    #[serde(skip_serializing)]
    pub database_url: String,

    /// Identity of this sweeper/server instance, for telemetry and the
    /// one-sweeper-per-node assertion (spec §4.6, §9). Should come from the
    /// deployment environment (container id, pod name, allocation id).
    pub instance_id: String,

    pub default_lease_ttl_seconds: i64,
    pub max_lease_ttl_seconds: i64,
    pub max_lease_renewals: i32,
    pub max_lease_lifetime_seconds: i64,

    pub default_max_attempts: i32,
    pub default_retry_backoff_seconds: i64,
    pub max_retry_backoff_seconds: i64,

    pub lease_sweep_interval_seconds: u64,
    pub lease_sweep_batch: i64,

    pub max_receipt_body_bytes: usize,
    pub max_receipt_parents: usize,
    pub max_receipt_artifacts: usize,

    pub obligation_candidate_hard_cap: i64,
    pub default_list_limit: i64,
    pub max_list_limit: i64,

    pub locatability_policy: LocatabilityPolicy,
}

impl GateConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest): CLI/env > TOML file > built-in default.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let database_url = std::env::var("ASYNCGATE_DATABASE_URL")
            .ok()
            .or(toml.database_url)
            .unwrap_or_else(|| "postgres://localhost/asyncgate".to_string());

        let locatability_policy = std::env::var("ASYNCGATE_LOCATABILITY_POLICY")
            .ok()
            .or(toml.locatability_policy)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let instance_id = std::env::var("ASYNCGATE_INSTANCE_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string());

        Self {
            port,
            data_dir,
            log,
            database_url,
            instance_id,
            default_lease_ttl_seconds: toml
                .default_lease_ttl_seconds
                .unwrap_or(DEFAULT_DEFAULT_LEASE_TTL_SECS),
            max_lease_ttl_seconds: toml
                .max_lease_ttl_seconds
                .unwrap_or(DEFAULT_MAX_LEASE_TTL_SECS),
            max_lease_renewals: toml
                .max_lease_renewals
                .unwrap_or(DEFAULT_MAX_LEASE_RENEWALS),
            max_lease_lifetime_seconds: toml
                .max_lease_lifetime_seconds
                .unwrap_or(DEFAULT_MAX_LEASE_LIFETIME_SECS),
            default_max_attempts: toml.default_max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            default_retry_backoff_seconds: toml
                .default_retry_backoff_seconds
                .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS),
            max_retry_backoff_seconds: toml
                .max_retry_backoff_seconds
                .unwrap_or(DEFAULT_MAX_RETRY_BACKOFF_SECS),
            lease_sweep_interval_seconds: toml
                .lease_sweep_interval_seconds
                .unwrap_or(DEFAULT_LEASE_SWEEP_INTERVAL_SECS),
            lease_sweep_batch: toml.lease_sweep_batch.unwrap_or(DEFAULT_LEASE_SWEEP_BATCH),
            max_receipt_body_bytes: toml
                .max_receipt_body_bytes
                .unwrap_or(DEFAULT_MAX_RECEIPT_BODY_BYTES),
            max_receipt_parents: toml
                .max_receipt_parents
                .unwrap_or(DEFAULT_MAX_RECEIPT_PARENTS),
            max_receipt_artifacts: toml
                .max_receipt_artifacts
                .unwrap_or(DEFAULT_MAX_RECEIPT_ARTIFACTS),
            obligation_candidate_hard_cap: toml
                .obligation_candidate_hard_cap
                .unwrap_or(DEFAULT_OBLIGATION_CANDIDATE_HARD_CAP),
            default_list_limit: toml.default_list_limit.unwrap_or(DEFAULT_LIST_LIMIT),
            max_list_limit: toml.max_list_limit.unwrap_or(DEFAULT_MAX_LIST_LIMIT),
            locatability_policy,
        }
    }
}

impl GateConfig {
    /// Refuses to start a sweeper against a non-development environment
    /// with the shared default instance id — two replicas both claiming
    /// `"dev-instance"` would contend silently rather than fail loudly.
    pub fn validate_instance_id(&self, env_name: &str) -> Result<(), String> {
        if env_name != "development" && self.instance_id == DEFAULT_INSTANCE_ID {
            return Err(format!(
                "ASYNCGATE_INSTANCE_ID must be set to a unique value outside development \
                 (got the shared default {DEFAULT_INSTANCE_ID:?} while ASYNCGATE_ENV={env_name:?})"
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().join("asyncgate")
}

/// Minimal stand-in for a `dirs`-style lookup — avoids pulling in another
/// crate for a single path join the teacher would otherwise get from `dirs`.
fn dirs_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_overridden() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = GateConfig::new(None, Some(tmp.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.default_lease_ttl_seconds, DEFAULT_DEFAULT_LEASE_TTL_SECS);
        assert_eq!(cfg.locatability_policy, LocatabilityPolicy::Lenient);
    }

    #[test]
    fn cli_override_wins_over_toml_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "port = 7000\n").unwrap();
        let cfg = GateConfig::new(Some(9999), Some(tmp.path().to_path_buf()), None);
        assert_eq!(cfg.port, 9999);
    }

    #[test]
    fn toml_override_wins_over_default() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "max_lease_renewals = 3\n",
        )
        .unwrap();
        let cfg = GateConfig::new(None, Some(tmp.path().to_path_buf()), None);
        assert_eq!(cfg.max_lease_renewals, 3);
    }

    #[test]
    fn default_instance_id_is_rejected_outside_development() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = GateConfig::new(None, Some(tmp.path().to_path_buf()), None);
        assert_eq!(cfg.instance_id, DEFAULT_INSTANCE_ID);
        assert!(cfg.validate_instance_id("development").is_ok());
        assert!(cfg.validate_instance_id("production").is_err());
    }

    #[test]
    fn unique_instance_id_passes_validation_anywhere() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = GateConfig::new(None, Some(tmp.path().to_path_buf()), None);
        cfg.instance_id = "pod-7f3a".to_string();
        assert!(cfg.validate_instance_id("production").is_ok());
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "not valid toml :::").unwrap();
        let cfg = GateConfig::new(None, Some(tmp.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
