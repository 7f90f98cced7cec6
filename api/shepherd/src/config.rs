//! Process configuration, read once at startup from a TOML file.  Every key is optional.

use crate::assembler::Defaults;
use fleetstore::Repository;
use log::{debug, info, warn, LevelFilter};
use models::{ConfigMap, HardwareProfile};
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/shepherd.toml";

/// Key of the watched log level config map.
pub const LOG_LEVEL_KEY: &str = "LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub http_port: u16,
    pub readiness_bind: SocketAddr,
    /// Reported at startup; serving metrics is left to the embedding deployment.
    pub metrics_bind: String,
    pub leader_election: bool,
    pub webhook_port: u16,
    /// Bucket claims named in device status are only honoured when set.
    pub obc_auto_create: bool,
    pub log_level: String,

    pub operator_namespace: String,
    pub device_namespace: String,
    pub ca_secret_name: String,
    pub registration_secret_name: String,
    pub registration_validity_hours: u32,
    /// Hours between checks that the registration bundle still verifies.
    pub registration_refresh_hours: u64,

    pub tls_dns_names: Vec<String>,
    pub tls_include_loopback: bool,

    pub request_timeout_seconds: u64,
    pub event_queue_capacity: usize,

    pub heartbeat_period_seconds: i64,
    pub heartbeat_include_hardware: bool,
    pub heartbeat_hardware_scope: String,

    /// Config map in the operator namespace whose `LOG_LEVEL` key is watched.
    pub log_level_config_map: Option<String>,
    pub log_level_poll_seconds: u64,

    /// Records loaded into the in-process store at startup, for local runs.
    pub store_seed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8043,
            readiness_bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            metrics_bind: "0.0.0.0:8080".to_string(),
            leader_election: false,
            webhook_port: 9443,
            obc_auto_create: false,
            log_level: "info".to_string(),
            operator_namespace: "shepherd-system".to_string(),
            device_namespace: "default".to_string(),
            ca_secret_name: "shepherd-ca".to_string(),
            registration_secret_name: "shepherd-registration-client".to_string(),
            registration_validity_hours: 24,
            registration_refresh_hours: 1,
            tls_dns_names: vec!["localhost".to_string()],
            tls_include_loopback: true,
            request_timeout_seconds: 30,
            event_queue_capacity: 1024,
            heartbeat_period_seconds: 60,
            heartbeat_include_hardware: true,
            heartbeat_hardware_scope: "full".to_string(),
            log_level_config_map: None,
            log_level_poll_seconds: 30,
            store_seed_path: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path).context(error::ConfigReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(error::ConfigParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    /// Like `from_file`, but a missing file means every default applies.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        parse_level(&self.log_level)?;
        ensure!(
            self.request_timeout_seconds > 0,
            error::InvalidSnafu {
                key: "request-timeout-seconds",
                reason: "must be positive",
            }
        );
        ensure!(
            self.heartbeat_period_seconds > 0,
            error::InvalidSnafu {
                key: "heartbeat-period-seconds",
                reason: "must be positive",
            }
        );
        ensure!(
            !self.tls_dns_names.is_empty() || self.tls_include_loopback,
            error::InvalidSnafu {
                key: "tls-dns-names",
                reason: "server certificate needs a DNS name or loopback addresses",
            }
        );
        Ok(())
    }

    pub fn level(&self) -> Result<LevelFilter> {
        parse_level(&self.log_level)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn assembler_defaults(&self) -> Defaults {
        Defaults {
            heartbeat_period_seconds: self.heartbeat_period_seconds,
            hardware_profile: HardwareProfile {
                include: self.heartbeat_include_hardware,
                scope: self.heartbeat_hardware_scope.clone(),
            },
            ..Default::default()
        }
    }
}

pub fn parse_level(s: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(s.trim())
        .ok()
        .context(error::LogLevelSnafu { level: s })
}

/// Returns the level named under `LOG_LEVEL` in the config map, if it names a valid one.
pub fn config_map_level(config_map: &ConfigMap) -> Option<LevelFilter> {
    let value = config_map.data.get(LOG_LEVEL_KEY)?;
    match parse_level(value) {
        Ok(level) => Some(level),
        Err(e) => {
            warn!(
                "Ignoring '{}/{}': {}",
                config_map.metadata.namespace, config_map.metadata.name, e
            );
            None
        }
    }
}

/// Polls the log level config map and returns once it names a level other than `baseline`.
/// Missing maps and store errors are retried on the next poll.
pub async fn watch_log_level(
    repo: &dyn Repository,
    namespace: &str,
    name: &str,
    baseline: Option<LevelFilter>,
    period: Duration,
) -> LevelFilter {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let config_map = match repo.read_config_map(namespace, name).await {
            Ok(config_map) => config_map,
            Err(e) if e.is_not_found() => {
                debug!("Log level config map '{}/{}' not found", namespace, name);
                continue;
            }
            Err(e) => {
                warn!("Unable to read log level config map: {}", e);
                continue;
            }
        };
        if let Some(level) = config_map_level(&config_map) {
            if Some(level) != baseline {
                info!(
                    "Log level in '{}/{}' changed to {}",
                    namespace, name, level
                );
                return level;
            }
        }
    }
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to read config file '{}': {}", path.display(), source))]
        ConfigRead { path: PathBuf, source: io::Error },

        #[snafu(display("Unable to parse config file '{}': {}", path.display(), source))]
        ConfigParse {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Invalid log level '{}'", level))]
        LogLevel { level: String },

        #[snafu(display("Invalid value for '{}': {}", key, reason))]
        Invalid {
            key: &'static str,
            reason: &'static str,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
    http-port = 9000
    readiness-bind = "127.0.0.1:9001"
    metrics-bind = "127.0.0.1:9002"
    leader-election = true
    webhook-port = 9443
    obc-auto-create = true
    log-level = "debug"
    operator-namespace = "ops"
    device-namespace = "fleet"
    tls-dns-names = ["shepherd.example.com", "shepherd"]
    tls-include-loopback = false
    request-timeout-seconds = 5
    heartbeat-period-seconds = 15
    heartbeat-hardware-scope = "delta"
    log-level-config-map = "shepherd-config"
    "#;

    fn write(contents: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shepherd.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn full_config() {
        let (_dir, path) = write(FULL_CONFIG);
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.readiness_bind, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
        assert!(config.leader_election);
        assert!(config.obc_auto_create);
        assert_eq!(config.level().unwrap(), LevelFilter::Debug);
        assert_eq!(config.device_namespace, "fleet");
        assert_eq!(config.tls_dns_names.len(), 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_level_config_map.as_deref(), Some("shepherd-config"));

        let defaults = config.assembler_defaults();
        assert_eq!(defaults.heartbeat_period_seconds, 15);
        assert_eq!(defaults.hardware_profile.scope, "delta");
        assert_eq!(defaults.receiver_request_num_samples, 30000);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let (_dir, path) = write("");
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn missing_file_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_file_or_default(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert!(Config::from_file(dir.path().join("nope.toml")).is_err());
    }

    fn level_map(level: &str) -> ConfigMap {
        ConfigMap {
            metadata: models::ObjectMeta::new("ops", "shepherd-config"),
            data: maplit::btreemap! { LOG_LEVEL_KEY.to_string() => level.to_string() },
        }
    }

    #[test]
    fn config_map_levels() {
        assert_eq!(config_map_level(&level_map("warn")), Some(LevelFilter::Warn));
        assert_eq!(config_map_level(&level_map("loud")), None);
        assert_eq!(config_map_level(&ConfigMap::default()), None);
    }

    #[tokio::test]
    async fn watcher_returns_on_change() {
        let repo = fleetstore::MemoryRepository::new();
        repo.insert_config_map(level_map("debug"));
        let level = watch_log_level(
            &repo,
            "ops",
            "shepherd-config",
            Some(LevelFilter::Info),
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(level, LevelFilter::Debug);
    }

    #[tokio::test]
    async fn watcher_waits_while_unchanged() {
        let repo = fleetstore::MemoryRepository::new();
        repo.insert_config_map(level_map("info"));
        let watch = watch_log_level(
            &repo,
            "ops",
            "shepherd-config",
            Some(LevelFilter::Info),
            Duration::from_millis(1),
        );
        assert!(tokio::time::timeout(Duration::from_millis(50), watch)
            .await
            .is_err());

        let missing = watch_log_level(&repo, "ops", "absent", None, Duration::from_millis(1));
        assert!(tokio::time::timeout(Duration::from_millis(20), missing)
            .await
            .is_err());
    }

    #[test]
    fn bad_values_are_rejected() {
        for bad in [
            "log-level = \"loud\"",
            "request-timeout-seconds = 0",
            "no-such-key = 1",
            "http-port = \"high\"",
        ] {
            let (_dir, path) = write(bad);
            assert!(Config::from_file(&path).is_err(), "accepted: {}", bad);
        }
    }
}
