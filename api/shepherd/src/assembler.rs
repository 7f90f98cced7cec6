//! Builds the configuration message a device pulls from the data channel.
//!
//! The message is a pure function of the device record, the deployments assigned to it, and the
//! config maps and secrets those refer to.  Every map involved is ordered, so assembling the same
//! inputs twice gives byte-identical output.  Assembly is all or nothing: any fatal problem
//! fails the whole message.

use log::{debug, warn};
use models::constants::{
    ALLOW_LIST_KEY, CA_CERT_KEY, DOCKER_CONFIG_KEY, SYSLOG_ADDRESS_KEY, SYSLOG_PROTOCOL_KEY,
};
use models::messages::{
    DeviceConfigurationMessage, HeartbeatPolicy, LogCollectionTarget,
    MetricsAllowList, MetricsConfiguration, MetricsReceiverConfiguration, MetricsRetention,
    SecretPayload, StorageConfiguration, SyslogTarget, SystemMetricsConfiguration, Workload,
    WorkloadData, WorkloadImageRegistries, WorkloadMetrics,
};
use models::{Deployment, Device, HardwareProfile, ObjectRef};
use base64::Engine;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::references;
use crate::storage::{self, StorageClaimer};
use fleetstore::Repository;

const SYSLOG_PROTOCOLS: &[&str] = &["tcp", "udp"];
const DEFAULT_SYSLOG_PROTOCOL: &str = "tcp";

/// Values used when the device record doesn't say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub heartbeat_period_seconds: i64,
    pub hardware_profile: HardwareProfile,
    pub receiver_request_num_samples: i64,
    pub receiver_timeout_seconds: i64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            heartbeat_period_seconds: 60,
            hardware_profile: HardwareProfile {
                include: true,
                scope: "full".to_string(),
            },
            receiver_request_num_samples: 30000,
            receiver_timeout_seconds: 10,
        }
    }
}

pub struct Assembler {
    repo: Arc<dyn Repository>,
    claimer: Arc<dyn StorageClaimer>,
    defaults: Defaults,
}

impl Assembler {
    pub fn new(
        repo: Arc<dyn Repository>,
        claimer: Arc<dyn StorageClaimer>,
        defaults: Defaults,
    ) -> Self {
        Self {
            repo,
            claimer,
            defaults,
        }
    }

    pub async fn assemble(&self, device: &Device) -> Result<DeviceConfigurationMessage> {
        let namespace = device.metadata.namespace.as_str();
        let mut message = DeviceConfigurationMessage {
            device_id: device.metadata.name.clone(),
            version: device.metadata.resource_version.to_string(),
            ..Default::default()
        };
        message.configuration.heartbeat = self.heartbeat(device);

        // A device being deleted only needs to learn that it has nothing left to run.
        if device.metadata.is_deleted() {
            return Ok(message);
        }

        for assignment in &device.status.deployments {
            let deployment = match self.repo.read_deployment(namespace, &assignment.name).await {
                Ok(d) => d,
                Err(e) if e.is_not_found() => {
                    debug!(
                        "Deployment '{}/{}' assigned to '{}' no longer exists, skipping",
                        namespace, assignment.name, device.metadata.name
                    );
                    continue;
                }
                Err(e) => {
                    return Err(e).context(error::DeploymentFetchSnafu {
                        name: &assignment.name,
                    })
                }
            };
            if deployment.metadata.is_deleted() {
                continue;
            }

            let mut workload = self.workload(namespace, &deployment).await?;
            let resolved = references::resolve(self.repo.as_ref(), namespace, &deployment)
                .await
                .context(error::ReferencesSnafu {
                    deployment: &deployment.metadata.name,
                })?;
            workload.configmaps = resolved.config_maps;
            for secret in resolved.secrets {
                merge_secret(&mut message.secrets, secret);
            }
            message.workloads.push(workload);
        }

        let mut seen = BTreeSet::new();
        message.configmaps = message
            .workloads
            .iter()
            .flat_map(|w| w.configmaps.iter())
            .filter(|cm| seen.insert(cm.as_str()))
            .cloned()
            .collect();

        message.configuration.os = device.spec.os_information.clone();
        message.configuration.storage = self.storage(device).await;
        message.configuration.metrics = Some(self.metrics(device).await?);
        for (name, target) in &device.spec.log_collection {
            let syslog_config = match &target.syslog_config {
                Some(cm_ref) => Some(self.syslog(namespace, cm_ref).await?),
                None => None,
            };
            message.configuration.log_collection.insert(
                name.clone(),
                LogCollectionTarget {
                    kind: target.kind.clone(),
                    buffer_size: target.buffer_size,
                    syslog_config,
                },
            );
        }

        Ok(message)
    }

    fn heartbeat(&self, device: &Device) -> HeartbeatPolicy {
        match &device.spec.heartbeat {
            Some(hb) => {
                let mut hardware_profile = hb
                    .hardware_profile
                    .clone()
                    .unwrap_or_else(|| self.defaults.hardware_profile.clone());
                if hardware_profile.scope.is_empty() {
                    hardware_profile.scope = self.defaults.hardware_profile.scope.clone();
                }
                HeartbeatPolicy {
                    period_seconds: if hb.period_seconds > 0 {
                        hb.period_seconds
                    } else {
                        self.defaults.heartbeat_period_seconds
                    },
                    hardware_profile,
                }
            }
            None => HeartbeatPolicy {
                period_seconds: self.defaults.heartbeat_period_seconds,
                hardware_profile: self.defaults.hardware_profile.clone(),
            },
        }
    }

    async fn workload(&self, namespace: &str, deployment: &Deployment) -> Result<Workload> {
        let name = deployment.metadata.name.as_str();
        let spec = &deployment.spec;

        let specification =
            serde_yaml::to_string(&spec.pod.spec).context(error::PodSpecSnafu { name })?;

        let data = spec
            .data
            .as_ref()
            .filter(|d| !d.paths.is_empty())
            .map(|d| WorkloadData {
                paths: d.paths.clone(),
            });

        let image_registries = match spec
            .image_registries
            .as_ref()
            .and_then(|r| r.secret_ref.as_ref())
        {
            Some(secret_ref) => {
                let secret = self
                    .repo
                    .read_secret(namespace, &secret_ref.name)
                    .await
                    .context(error::RegistrySecretSnafu {
                        deployment: name,
                        secret: &secret_ref.name,
                    })?;
                let auth_file = secret.string_value(DOCKER_CONFIG_KEY).context(
                    error::MissingDockerConfigSnafu {
                        deployment: name,
                        secret: &secret_ref.name,
                    },
                )?;
                Some(WorkloadImageRegistries { auth_file })
            }
            None => None,
        };

        let metrics = match spec.metrics.as_ref().filter(|m| m.port > 0) {
            Some(m) => {
                let allow_list = match &m.allow_list {
                    Some(list_ref) => Some(self.allow_list(namespace, list_ref).await?),
                    None => None,
                };
                Some(WorkloadMetrics {
                    path: m.path.clone(),
                    port: m.port,
                    interval: m.interval,
                    allow_list,
                    containers: m.containers.clone(),
                })
            }
            None => None,
        };

        Ok(Workload {
            name: name.to_string(),
            specification,
            data,
            image_registries,
            configmaps: Vec::new(),
            log_collection: spec.log_collection.clone(),
            metrics,
        })
    }

    async fn allow_list(&self, namespace: &str, list_ref: &ObjectRef) -> Result<MetricsAllowList> {
        let name = list_ref.name.as_str();
        let config_map = self
            .repo
            .read_config_map(namespace, name)
            .await
            .context(error::AllowListFetchSnafu { name })?;
        let yaml = config_map
            .data
            .get(ALLOW_LIST_KEY)
            .context(error::AllowListKeySnafu { name })?;
        serde_yaml::from_str(yaml).context(error::AllowListParseSnafu { name })
    }

    /// Storage problems are logged, not fatal; the device just doesn't get storage this time.
    async fn storage(&self, device: &Device) -> Option<StorageConfiguration> {
        let namespace = device.metadata.namespace.as_str();
        let result = if let Some(claim) = &device.status.data_obc {
            self.claimer.s3_configuration(namespace, claim).await
        } else if let Some(s3) = device.spec.storage.as_ref().and_then(|s| s.s3.as_ref()) {
            storage::external_s3(self.repo.as_ref(), namespace, s3).await
        } else {
            return None;
        };

        match result {
            Ok(s3) => Some(StorageConfiguration { s3 }),
            Err(e) => {
                warn!(
                    "Unable to get storage for device '{}/{}': {}",
                    namespace, device.metadata.name, e
                );
                None
            }
        }
    }

    async fn metrics(&self, device: &Device) -> Result<MetricsConfiguration> {
        let namespace = device.metadata.namespace.as_str();
        let spec = device.spec.metrics.as_ref();

        let mut receiver = MetricsReceiverConfiguration {
            request_num_samples: self.defaults.receiver_request_num_samples,
            timeout_seconds: self.defaults.receiver_timeout_seconds,
            ..Default::default()
        };
        if let Some(rc) = spec.and_then(|m| m.receiver_configuration.as_ref()) {
            receiver.url = rc.url.clone();
            if let Some(samples) = rc.request_num_samples.filter(|n| *n > 0) {
                receiver.request_num_samples = samples;
            }
            if let Some(timeout) = rc.timeout_seconds.filter(|n| *n > 0) {
                receiver.timeout_seconds = timeout;
            }
            if !rc.ca_secret_name.is_empty() {
                let name = rc.ca_secret_name.as_str();
                let secret = self
                    .repo
                    .read_secret(namespace, name)
                    .await
                    .context(error::ReceiverCaFetchSnafu { name })?;
                let ca = secret
                    .data
                    .get(CA_CERT_KEY)
                    .context(error::ReceiverCaKeySnafu { name })?;
                receiver.ca_cert = base64::engine::general_purpose::STANDARD.encode(ca);
            }
        }

        let retention = spec.and_then(|m| m.retention.as_ref()).map(|r| MetricsRetention {
            max_mib: r.max_mib,
            max_hours: r.max_hours,
        });

        let system = match spec.and_then(|m| m.system.as_ref()) {
            Some(sys) => {
                let allow_list = match &sys.allow_list {
                    Some(list_ref) => Some(self.allow_list(namespace, list_ref).await?),
                    None => None,
                };
                Some(SystemMetricsConfiguration {
                    interval: sys.interval,
                    disabled: sys.disabled,
                    allow_list,
                })
            }
            None => None,
        };

        Ok(MetricsConfiguration {
            retention,
            system,
            receiver,
        })
    }

    async fn syslog(&self, namespace: &str, cm_ref: &ObjectRef) -> Result<SyslogTarget> {
        let name = cm_ref.name.as_str();
        let config_map = self
            .repo
            .read_config_map(namespace, name)
            .await
            .context(error::SyslogFetchSnafu { name })?;

        let address = config_map
            .data
            .get(SYSLOG_ADDRESS_KEY)
            .cloned()
            .unwrap_or_default();
        let protocol = config_map
            .data
            .get(SYSLOG_PROTOCOL_KEY)
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSLOG_PROTOCOL);
        ensure!(
            SYSLOG_PROTOCOLS.contains(&protocol),
            error::SyslogProtocolSnafu { name, protocol }
        );

        Ok(SyslogTarget {
            address,
            protocol: protocol.to_string(),
        })
    }
}

/// Adds a secret to the list, replacing an earlier one of the same name in place.
fn merge_secret(secrets: &mut Vec<SecretPayload>, secret: SecretPayload) {
    match secrets.iter_mut().find(|s| s.name == secret.name) {
        Some(existing) => *existing = secret,
        None => secrets.push(secret),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to fetch deployment '{}': {}", name, source))]
        DeploymentFetch {
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display("Unable to serialize pod specification of '{}': {}", name, source))]
        PodSpec {
            name: String,
            source: serde_yaml::Error,
        },

        #[snafu(display(
            "Unable to fetch image registry secret '{}' of deployment '{}': {}",
            secret,
            deployment,
            source
        ))]
        RegistrySecret {
            deployment: String,
            secret: String,
            source: fleetstore::Error,
        },

        #[snafu(display(
            "Image registry secret '{}' of deployment '{}' has no '{}' key",
            secret,
            deployment,
            models::constants::DOCKER_CONFIG_KEY
        ))]
        MissingDockerConfig { deployment: String, secret: String },

        #[snafu(display("Unable to resolve references of deployment '{}': {}", deployment, source))]
        References {
            deployment: String,
            source: crate::references::Error,
        },

        #[snafu(display("Unable to fetch metrics allow-list '{}': {}", name, source))]
        AllowListFetch {
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display(
            "Metrics allow-list '{}' has no '{}' key",
            name,
            models::constants::ALLOW_LIST_KEY
        ))]
        AllowListKey { name: String },

        #[snafu(display("Unable to parse metrics allow-list '{}': {}", name, source))]
        AllowListParse {
            name: String,
            source: serde_yaml::Error,
        },

        #[snafu(display("Unable to fetch metrics receiver CA secret '{}': {}", name, source))]
        ReceiverCaFetch {
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display(
            "Metrics receiver CA secret '{}' has no '{}' key",
            name,
            models::constants::CA_CERT_KEY
        ))]
        ReceiverCaKey { name: String },

        #[snafu(display("Unable to fetch syslog config map '{}': {}", name, source))]
        SyslogFetch {
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display(
            "Syslog config map '{}' has invalid protocol '{}'; must be tcp or udp",
            name,
            protocol
        ))]
        SyslogProtocol { name: String, protocol: String },
    }

    impl Error {
        /// Short machine-readable reason, for the event recorded on the device.
        pub fn reason(&self) -> &'static str {
            match self {
                Error::DeploymentFetch { .. } => "DeploymentUnavailable",
                Error::PodSpec { .. } => "InvalidPodSpecification",
                Error::RegistrySecret { .. } | Error::MissingDockerConfig { .. } => {
                    "ImageRegistryAuthUnavailable"
                }
                Error::References { .. } => "ReferenceUnavailable",
                Error::AllowListFetch { .. }
                | Error::AllowListKey { .. }
                | Error::AllowListParse { .. } => "MetricsAllowListUnavailable",
                Error::ReceiverCaFetch { .. } | Error::ReceiverCaKey { .. } => {
                    "MetricsReceiverCaUnavailable"
                }
                Error::SyslogFetch { .. } | Error::SyslogProtocol { .. } => "InvalidSyslogConfig",
            }
        }
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
