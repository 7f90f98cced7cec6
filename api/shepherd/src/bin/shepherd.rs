//! This is the primary binary for the shepherd fleet endpoint.

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

use argh::FromArgs;
use fleetstore::{MemoryRepository, Repository};
use models::{ConfigMap, Deployment, Device, Secret};
use serde::Deserialize;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use shepherd::assembler::Assembler;
use shepherd::certificates::{self, CertificateAuthority};
use shepherd::config::{self, Config, DEFAULT_CONFIG_PATH};
use shepherd::events::{self, EventRecorder};
use shepherd::metrics::Metrics;
use shepherd::server::{self, Endpoint, ServerSettings};
use shepherd::storage::{ClaimResources, ClaimsDisabled, StorageClaimer};

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("{}", source))]
        Config { source: shepherd::config::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Unable to read store seed '{}': {}", path.display(), source))]
        SeedRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to parse store seed '{}': {}", path.display(), source))]
        SeedParse {
            path: PathBuf,
            source: serde_yaml::Error,
        },

        #[snafu(display("Certificate setup failed: {}", source))]
        Certificates {
            source: shepherd::certificates::Error,
        },

        #[snafu(display("{}", source))]
        Server { source: shepherd::server::Error },
    }
}

/// Serves edge devices their configuration over mutual TLS
#[derive(FromArgs, PartialEq, Debug)]
struct Args {
    /// path to the TOML configuration file
    #[argh(option, default = "DEFAULT_CONFIG_PATH.into()")]
    config_path: PathBuf,
    /// log-level trace|debug|info|warn|error, overriding the configuration
    #[argh(option)]
    log_level: Option<LevelFilter>,
}

/// Records loaded into the in-process store at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct StoreSeed {
    namespaces: Vec<String>,
    devices: Vec<Device>,
    deployments: Vec<Deployment>,
    config_maps: Vec<ConfigMap>,
    secrets: Vec<Secret>,
}

fn seeded_repository(config: &Config) -> Result<MemoryRepository> {
    let repo = MemoryRepository::new();
    repo.add_namespace(config.operator_namespace.as_str());
    repo.add_namespace(config.device_namespace.as_str());

    if let Some(path) = &config.store_seed_path {
        let seed = read_seed(path)?;
        for namespace in seed.namespaces {
            repo.add_namespace(namespace);
        }
        for device in seed.devices {
            repo.insert_device(device);
        }
        for deployment in seed.deployments {
            repo.add_namespace(deployment.metadata.namespace.as_str());
            repo.insert_deployment(deployment);
        }
        for config_map in seed.config_maps {
            repo.add_namespace(config_map.metadata.namespace.as_str());
            repo.insert_config_map(config_map);
        }
        for secret in seed.secrets {
            repo.add_namespace(secret.metadata.namespace.as_str());
            repo.insert_secret(secret);
        }
    }
    Ok(repo)
}

fn read_seed(path: &Path) -> Result<StoreSeed> {
    let s = fs::read_to_string(path).context(error::SeedReadSnafu { path })?;
    serde_yaml::from_str(&s).context(error::SeedParseSnafu { path })
}

/// Re-checks the registration bundle periodically, re-issuing it once it expires.
async fn refresh_registration_client(
    repo: Arc<dyn Repository>,
    ca: Arc<CertificateAuthority>,
    config: Config,
) {
    let period = Duration::from_secs(config.registration_refresh_hours.max(1) * 3600);
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately, and startup already did this check.
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = certificates::ensure_registration_client(
            repo.as_ref(),
            &ca,
            &config.operator_namespace,
            &config.registration_secret_name,
            i64::from(config.registration_validity_hours),
        )
        .await
        {
            error!("Unable to refresh registration bundle: {}", e);
        }
    }
}

/// Loads configuration, sets up certificates and the store, and serves devices until the watched
/// log level changes.
async fn run() -> Result<()> {
    let args: Args = argh::from_env();
    let config =
        Config::from_file_or_default(&args.config_path).context(error::ConfigSnafu)?;
    let repo = Arc::new(seeded_repository(&config)?);

    // Precedence: command line, then the watched config map, then the configuration file.
    let baseline = match &config.log_level_config_map {
        Some(name) => repo
            .read_config_map(&config.operator_namespace, name)
            .await
            .ok()
            .and_then(|config_map| config::config_map_level(&config_map)),
        None => None,
    };
    let log_level = match (args.log_level, baseline) {
        (Some(level), _) | (None, Some(level)) => level,
        (None, None) => config.level().context(error::ConfigSnafu)?,
    };

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    info!(
        "Starting with leader election {}, webhook port {}, metrics bind {}",
        if config.leader_election {
            "enabled"
        } else {
            "disabled"
        },
        config.webhook_port,
        config.metrics_bind
    );

    let repo: Arc<dyn Repository> = repo;
    let (tls, ca) = certificates::init_certificates(
        repo.as_ref(),
        &config.operator_namespace,
        &config.ca_secret_name,
        &config.tls_dns_names,
        config.tls_include_loopback,
    )
    .await
    .context(error::CertificatesSnafu)?;
    certificates::ensure_registration_client(
        repo.as_ref(),
        &ca,
        &config.operator_namespace,
        &config.registration_secret_name,
        i64::from(config.registration_validity_hours),
    )
    .await
    .context(error::CertificatesSnafu)?;
    actix_rt::spawn(refresh_registration_client(
        repo.clone(),
        ca.clone(),
        config.clone(),
    ));

    let (recorder, event_rx) = EventRecorder::channel(config.event_queue_capacity);
    actix_rt::spawn(events::log_events(event_rx));

    let claimer: Arc<dyn StorageClaimer> = if config.obc_auto_create {
        Arc::new(ClaimResources::new(repo.clone()))
    } else {
        Arc::new(ClaimsDisabled)
    };
    let assembler = Assembler::new(repo.clone(), claimer, config.assembler_defaults());
    let endpoint = Arc::new(Endpoint::new(
        repo.clone(),
        ca.clone(),
        assembler,
        recorder,
        Arc::new(Metrics::new()),
        config.device_namespace.as_str(),
    ));

    let stop: Pin<Box<dyn Future<Output = ()>>> = match config.log_level_config_map.clone() {
        Some(name) => {
            let repo = repo.clone();
            let namespace = config.operator_namespace.clone();
            let period = Duration::from_secs(config.log_level_poll_seconds.max(1));
            Box::pin(async move {
                config::watch_log_level(repo.as_ref(), &namespace, &name, baseline, period).await;
            })
        }
        None => Box::pin(futures::future::pending()),
    };

    let settings = ServerSettings {
        http_port: config.http_port,
        readiness_bind: config.readiness_bind,
        request_timeout: config.request_timeout(),
    };
    server::serve(endpoint.clone(), ca, tls, &settings, stop)
        .await
        .context(error::ServerSnafu)?;

    let counts = endpoint.metrics().snapshot();
    info!(
        "Stopped after {} registration(s), {} failed, {} unregistration(s)",
        counts.successful_registrations, counts.failed_registrations, counts.unregistrations
    );
    Ok(())
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
