//! Where a device uploads its data: bucket connection details for the configuration message.
//!
//! A device gets storage one of two ways.  If a bucket claim was provisioned for it (its status
//! names the claim), the [`StorageClaimer`] turns the claim into connection details.  Otherwise
//! its spec may point at an externally provided bucket: a config map with the endpoint and a
//! secret with the credentials.

use async_trait::async_trait;
use base64::Engine;
use models::constants::{
    AWS_ACCESS_KEY_ID_KEY, AWS_CA_BUNDLE_KEY, AWS_SECRET_ACCESS_KEY_KEY, BUCKET_HOST_KEY,
    BUCKET_NAME_KEY, BUCKET_PORT_KEY, BUCKET_REGION_KEY,
};
use models::messages::S3StorageConfiguration;
use models::S3Reference;
use snafu::{ensure, OptionExt, ResultExt};
use std::sync::Arc;

use fleetstore::Repository;

/// Turns a provisioned bucket claim into connection details.
#[async_trait]
pub trait StorageClaimer: Send + Sync {
    async fn s3_configuration(
        &self,
        namespace: &str,
        claim_name: &str,
    ) -> Result<S3StorageConfiguration>;
}

/// Claimer used when bucket claims are disabled; every claim is refused.
#[derive(Debug, Default)]
pub struct ClaimsDisabled;

#[async_trait]
impl StorageClaimer for ClaimsDisabled {
    async fn s3_configuration(
        &self,
        _namespace: &str,
        claim_name: &str,
    ) -> Result<S3StorageConfiguration> {
        error::ClaimsDisabledSnafu { claim_name }.fail()
    }
}

/// Reads a provisioned claim from the config map and secret the provisioner creates next to it,
/// both named after the claim.
pub struct ClaimResources {
    repo: Arc<dyn Repository>,
}

impl ClaimResources {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl StorageClaimer for ClaimResources {
    async fn s3_configuration(
        &self,
        namespace: &str,
        claim_name: &str,
    ) -> Result<S3StorageConfiguration> {
        read_s3(self.repo.as_ref(), namespace, claim_name, claim_name).await
    }
}

/// Reads an externally provided bucket named in the device spec.
pub async fn external_s3(
    repo: &dyn Repository,
    namespace: &str,
    s3: &S3Reference,
) -> Result<S3StorageConfiguration> {
    read_s3(repo, namespace, &s3.config_map_name, &s3.secret_name).await
}

async fn read_s3(
    repo: &dyn Repository,
    namespace: &str,
    config_map_name: &str,
    secret_name: &str,
) -> Result<S3StorageConfiguration> {
    let config_map = repo
        .read_config_map(namespace, config_map_name)
        .await
        .context(error::FetchSnafu {
            kind: "config map",
            name: config_map_name,
        })?;
    let secret = repo
        .read_secret(namespace, secret_name)
        .await
        .context(error::FetchSnafu {
            kind: "secret",
            name: secret_name,
        })?;

    let cm_value = |key: &'static str| {
        config_map.data.get(key).cloned().context(error::MissingKeySnafu {
            kind: "config map",
            name: config_map_name,
            key,
        })
    };
    let secret_value = |key: &'static str| {
        secret.string_value(key).context(error::MissingKeySnafu {
            kind: "secret",
            name: secret_name,
            key,
        })
    };

    let port = cm_value(BUCKET_PORT_KEY)?;
    let bucket_port = port
        .trim()
        .parse::<i32>()
        .ok()
        .context(error::InvalidPortSnafu { value: &port })?;
    ensure!(bucket_port > 0, error::InvalidPortSnafu { value: &port });

    Ok(S3StorageConfiguration {
        bucket_host: cm_value(BUCKET_HOST_KEY)?,
        bucket_name: cm_value(BUCKET_NAME_KEY)?,
        bucket_port,
        bucket_region: config_map
            .data
            .get(BUCKET_REGION_KEY)
            .cloned()
            .unwrap_or_default(),
        aws_access_key_id: secret_value(AWS_ACCESS_KEY_ID_KEY)?,
        aws_secret_access_key: secret_value(AWS_SECRET_ACCESS_KEY_KEY)?,
        aws_ca_bundle: secret
            .data
            .get(AWS_CA_BUNDLE_KEY)
            .map(|bundle| base64::engine::general_purpose::STANDARD.encode(bundle))
            .unwrap_or_default(),
    })
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Bucket claims are disabled; not resolving claim '{}'", claim_name))]
        ClaimsDisabled { claim_name: String },

        #[snafu(display("Unable to fetch {} '{}': {}", kind, name, source))]
        Fetch {
            kind: &'static str,
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display("Key '{}' missing from {} '{}'", key, kind, name))]
        MissingKey {
            kind: &'static str,
            name: String,
            key: &'static str,
        },

        #[snafu(display("Invalid bucket port '{}'", value))]
        InvalidPort { value: String },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use fleetstore::MemoryRepository;
    use maplit::btreemap;
    use models::{ConfigMap, ObjectMeta, Secret};

    fn seed(repo: &MemoryRepository, name: &str, port: &str) {
        repo.insert_config_map(ConfigMap {
            metadata: ObjectMeta::new("fleet", name),
            data: btreemap! {
                BUCKET_HOST_KEY.to_string() => "s3.local".to_string(),
                BUCKET_NAME_KEY.to_string() => "bucket".to_string(),
                BUCKET_PORT_KEY.to_string() => port.to_string(),
            },
        });
        repo.insert_secret(Secret {
            metadata: ObjectMeta::new("fleet", name),
            data: btreemap! {
                AWS_ACCESS_KEY_ID_KEY.to_string() => b"id".to_vec(),
                AWS_SECRET_ACCESS_KEY_KEY.to_string() => b"secret".to_vec(),
                AWS_CA_BUNDLE_KEY.to_string() => b"ca".to_vec(),
            },
        });
    }

    #[tokio::test]
    async fn claim_resources_read_same_named_objects() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "claim-1", "443");
        let claimer = ClaimResources::new(repo.clone());

        let s3 = claimer.s3_configuration("fleet", "claim-1").await.unwrap();
        assert_eq!(
            s3,
            S3StorageConfiguration {
                bucket_host: "s3.local".to_string(),
                bucket_name: "bucket".to_string(),
                bucket_port: 443,
                bucket_region: String::new(),
                aws_access_key_id: "id".to_string(),
                aws_secret_access_key: "secret".to_string(),
                aws_ca_bundle: "Y2E=".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn bad_port_is_reported() {
        let repo = MemoryRepository::new();
        seed(&repo, "ext", "http");
        let s3 = S3Reference {
            secret_name: "ext".to_string(),
            config_map_name: "ext".to_string(),
            create_obc: false,
        };
        let err = external_s3(&repo, "fleet", &s3).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPort { .. }));
    }

    #[tokio::test]
    async fn disabled_claimer_refuses() {
        assert!(ClaimsDisabled
            .s3_configuration("fleet", "claim-1")
            .await
            .is_err());
    }
}
