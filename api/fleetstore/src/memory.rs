//! In-memory repository for use in testing other modules and for local runs.
//!
//! Mimics the decisions a real declarative store makes: every write is assigned the next value of
//! a store-wide revision counter, status writes are compare-and-swap on that revision, and a
//! device marked for deletion disappears once its last finalizer is removed.

use async_trait::async_trait;
use chrono::Utc;
use log::trace;
use models::{ConfigMap, Deployment, Device, ObjectMeta, Secret};
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{self, Result};
use crate::{patch, Repository};

/// Repository operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    NamespaceExists,
    ReadDevice,
    CreateDevice,
    PatchDeviceStatus,
    UpdateDeviceLabels,
    RemoveDeviceFinalizer,
    ReadDeployment,
    ReadConfigMap,
    ReadSecret,
    CreateSecret,
    UpdateSecret,
}

/// A failure to inject into an upcoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Conflict,
}

type Key = (String, String);

#[derive(Debug, Default)]
struct State {
    revision: u64,
    namespaces: BTreeSet<String>,
    devices: BTreeMap<Key, Device>,
    deployments: BTreeMap<Key, Deployment>,
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    calls: HashMap<Operation, usize>,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Counts the call and returns the injected failure for it, if one is queued.
    fn enter(&mut self, op: Operation, meta: Option<&ObjectMeta>) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        trace!("memory repository: {:?}", op);

        match self.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            None => Ok(()),
            Some(Fault::Transient) => error::TransientSnafu {
                operation: format!("{:?}", op),
                msg: "injected failure",
            }
            .fail(),
            Some(Fault::Conflict) => {
                let (namespace, name, expected) = meta
                    .map(|m| (m.namespace.clone(), m.name.clone(), m.resource_version))
                    .unwrap_or_default();
                error::ConflictSnafu {
                    kind: "record",
                    namespace,
                    name,
                    expected,
                    found: self.revision,
                }
                .fail()
            }
        }
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn fetch<T: Clone>(
    map: &BTreeMap<Key, T>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<T> {
    match map.get(&key(namespace, name)) {
        Some(v) => Ok(v.clone()),
        None => error::NotFoundSnafu {
            kind,
            namespace,
            name,
        }
        .fail(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Default::default()
    }

    // Nothing panics while holding the lock, but if it did the state is still usable.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_namespace<S: Into<String>>(&self, namespace: S) {
        self.state().namespaces.insert(namespace.into());
    }

    /// Stores a device as-is, bypassing call counting and faults.  Returns it with its revision.
    pub fn insert_device(&self, mut device: Device) -> Device {
        let mut state = self.state();
        device.metadata.resource_version = state.next_revision();
        state.namespaces.insert(device.metadata.namespace.clone());
        let k = key(&device.metadata.namespace, &device.metadata.name);
        state.devices.insert(k, device.clone());
        device
    }

    pub fn insert_deployment(&self, mut deployment: Deployment) -> Deployment {
        let mut state = self.state();
        deployment.metadata.resource_version = state.next_revision();
        let k = key(&deployment.metadata.namespace, &deployment.metadata.name);
        state.deployments.insert(k, deployment.clone());
        deployment
    }

    pub fn insert_config_map(&self, mut config_map: ConfigMap) -> ConfigMap {
        let mut state = self.state();
        config_map.metadata.resource_version = state.next_revision();
        let k = key(&config_map.metadata.namespace, &config_map.metadata.name);
        state.config_maps.insert(k, config_map.clone());
        config_map
    }

    pub fn insert_secret(&self, mut secret: Secret) -> Secret {
        let mut state = self.state();
        secret.metadata.resource_version = state.next_revision();
        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        state.secrets.insert(k, secret.clone());
        secret
    }

    /// Sets the deletion marker on a stored device, the way an operator deleting it would.
    pub fn mark_device_deleted(&self, namespace: &str, name: &str) -> Option<Device> {
        let mut state = self.state();
        let revision = state.next_revision();
        let device = state.devices.get_mut(&key(namespace, name))?;
        device.metadata.deletion_timestamp = Some(Utc::now());
        device.metadata.resource_version = revision;
        Some(device.clone())
    }

    /// Returns the stored device without counting a call.
    pub fn device(&self, namespace: &str, name: &str) -> Option<Device> {
        self.state().devices.get(&key(namespace, name)).cloned()
    }

    /// Returns the stored secret without counting a call.
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state().secrets.get(&key(namespace, name)).cloned()
    }

    /// Makes the next `count` calls of `op` fail with `fault`.
    pub fn fail_next(&self, op: Operation, fault: Fault, count: usize) {
        let mut state = self.state();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Number of calls of `op` made through the trait so far.
    pub fn calls(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let mut state = self.state();
        state.enter(Operation::NamespaceExists, None)?;
        Ok(state.namespaces.contains(namespace))
    }

    async fn read_device(&self, namespace: &str, name: &str) -> Result<Device> {
        let mut state = self.state();
        state.enter(Operation::ReadDevice, None)?;
        fetch(&state.devices, "device", namespace, name)
    }

    async fn create_device(&self, device: &Device) -> Result<Device> {
        let mut state = self.state();
        state.enter(Operation::CreateDevice, Some(&device.metadata))?;

        let k = key(&device.metadata.namespace, &device.metadata.name);
        ensure!(
            !state.devices.contains_key(&k),
            error::AlreadyExistsSnafu {
                kind: "device",
                namespace: &device.metadata.namespace,
                name: &device.metadata.name,
            }
        );

        let mut stored = device.clone();
        stored.metadata.resource_version = state.next_revision();
        stored.metadata.deletion_timestamp = None;
        state.namespaces.insert(stored.metadata.namespace.clone());
        state.devices.insert(k, stored.clone());
        Ok(stored)
    }

    async fn patch_device_status(&self, old: &Device, new: &Device) -> Result<Device> {
        let mut state = self.state();
        state.enter(Operation::PatchDeviceStatus, Some(&old.metadata))?;

        let k = key(&old.metadata.namespace, &old.metadata.name);
        let stored = fetch(
            &state.devices,
            "device",
            &old.metadata.namespace,
            &old.metadata.name,
        )?;
        ensure!(
            stored.metadata.resource_version == old.metadata.resource_version,
            error::ConflictSnafu {
                kind: "device",
                namespace: &old.metadata.namespace,
                name: &old.metadata.name,
                expected: old.metadata.resource_version,
                found: stored.metadata.resource_version,
            }
        );

        let before = serde_json::to_value(&old.status).context(error::PatchSnafu)?;
        let after = serde_json::to_value(&new.status).context(error::PatchSnafu)?;
        let status_patch = patch::diff(&before, &after);
        if patch::is_empty(&status_patch) {
            return Ok(stored);
        }

        let mut status =
            serde_json::to_value(&stored.status).context(error::PatchSnafu)?;
        patch::apply(&mut status, &status_patch);

        let mut updated = stored;
        updated.status =
            serde_json::from_value(status).context(error::PatchSnafu)?;
        updated.metadata.resource_version = state.next_revision();
        state.devices.insert(k, updated.clone());
        Ok(updated)
    }

    async fn update_device_labels(
        &self,
        device: &Device,
        labels: &BTreeMap<String, String>,
    ) -> Result<Device> {
        let mut state = self.state();
        state.enter(Operation::UpdateDeviceLabels, Some(&device.metadata))?;

        let k = key(&device.metadata.namespace, &device.metadata.name);
        let revision = state.next_revision();
        match state.devices.get_mut(&k) {
            Some(stored) => {
                stored.metadata.labels = labels.clone();
                stored.metadata.resource_version = revision;
                Ok(stored.clone())
            }
            None => error::NotFoundSnafu {
                kind: "device",
                namespace: &device.metadata.namespace,
                name: &device.metadata.name,
            }
            .fail(),
        }
    }

    async fn remove_device_finalizer(&self, device: &mut Device, tag: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::RemoveDeviceFinalizer, Some(&device.metadata))?;

        let k = key(&device.metadata.namespace, &device.metadata.name);
        let revision = state.next_revision();
        let gone = match state.devices.get_mut(&k) {
            // Already deleted; nothing holds it any more.
            None => {
                device.metadata.remove_finalizer(tag);
                return Ok(());
            }
            Some(stored) => {
                if stored.metadata.remove_finalizer(tag) {
                    stored.metadata.resource_version = revision;
                }
                device.metadata.finalizers = stored.metadata.finalizers.clone();
                device.metadata.resource_version = stored.metadata.resource_version;
                stored.metadata.is_deleted() && stored.metadata.finalizers.is_empty()
            }
        };
        if gone {
            state.devices.remove(&k);
        }
        Ok(())
    }

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let mut state = self.state();
        state.enter(Operation::ReadDeployment, None)?;
        fetch(&state.deployments, "deployment", namespace, name)
    }

    async fn read_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let mut state = self.state();
        state.enter(Operation::ReadConfigMap, None)?;
        fetch(&state.config_maps, "config map", namespace, name)
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let mut state = self.state();
        state.enter(Operation::ReadSecret, None)?;
        fetch(&state.secrets, "secret", namespace, name)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut state = self.state();
        state.enter(Operation::CreateSecret, Some(&secret.metadata))?;

        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        ensure!(
            !state.secrets.contains_key(&k),
            error::AlreadyExistsSnafu {
                kind: "secret",
                namespace: &secret.metadata.namespace,
                name: &secret.metadata.name,
            }
        );
        let mut stored = secret.clone();
        stored.metadata.resource_version = state.next_revision();
        state.secrets.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut state = self.state();
        state.enter(Operation::UpdateSecret, Some(&secret.metadata))?;

        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        let stored = fetch(
            &state.secrets,
            "secret",
            &secret.metadata.namespace,
            &secret.metadata.name,
        )?;
        ensure!(
            stored.metadata.resource_version == secret.metadata.resource_version,
            error::ConflictSnafu {
                kind: "secret",
                namespace: &secret.metadata.namespace,
                name: &secret.metadata.name,
                expected: secret.metadata.resource_version,
                found: stored.metadata.resource_version,
            }
        );
        let mut updated = stored;
        updated.data = secret.data.clone();
        updated.metadata.labels = secret.metadata.labels.clone();
        updated.metadata.resource_version = state.next_revision();
        state.secrets.insert(k, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use models::{DeploymentAssignment, DeviceStatus};

    fn device(name: &str) -> Device {
        Device {
            metadata: ObjectMeta::new("fleet", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn revisions_increase_on_every_write() {
        let repo = MemoryRepository::new();
        let created = repo.create_device(&device("dev-1")).await.unwrap();

        let mut new = created.clone();
        new.status.phase = "up".to_string();
        let patched = repo.patch_device_status(&created, &new).await.unwrap();
        assert!(patched.metadata.resource_version > created.metadata.resource_version);
        assert_eq!(patched.status.phase, "up");

        let labelled = repo
            .update_device_labels(&patched, &btreemap! {"a".to_string() => "b".to_string()})
            .await
            .unwrap();
        assert!(labelled.metadata.resource_version > patched.metadata.resource_version);
        assert_eq!(labelled.status.phase, "up");
    }

    #[tokio::test]
    async fn create_conflicts_on_existing_name() {
        let repo = MemoryRepository::new();
        repo.create_device(&device("dev-1")).await.unwrap();
        let err = repo.create_device(&device("dev-1")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn stale_status_patch_conflicts() {
        let repo = MemoryRepository::new();
        let created = repo.insert_device(device("dev-1"));
        // Someone else writes first.
        repo.update_device_labels(&created, &BTreeMap::new())
            .await
            .unwrap();

        let mut new = created.clone();
        new.status.phase = "up".to_string();
        let err = repo.patch_device_status(&created, &new).await.unwrap_err();
        assert!(matches!(err, error::Error::Conflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(repo.device("fleet", "dev-1").unwrap().status.phase, "");
    }

    #[tokio::test]
    async fn status_patch_keeps_concurrent_fields() {
        let repo = MemoryRepository::new();
        let mut seeded = device("dev-1");
        seeded.status = DeviceStatus {
            deployments: vec![DeploymentAssignment {
                name: "w1".to_string(),
                ..Default::default()
            }],
            data_obc: Some("claim".to_string()),
            ..Default::default()
        };
        let stored = repo.insert_device(seeded);

        // The caller's view lacks the claim; the patch only names what the caller changed.
        let mut old = stored.clone();
        old.status.data_obc = None;
        let mut new = old.clone();
        new.status.deployments[0].phase = "running".to_string();

        let patched = repo.patch_device_status(&old, &new).await.unwrap();
        assert_eq!(patched.status.deployments[0].phase, "running");
        assert_eq!(patched.status.data_obc.as_deref(), Some("claim"));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let repo = MemoryRepository::new();
        repo.insert_device(device("dev-1"));
        repo.fail_next(Operation::ReadDevice, Fault::Transient, 2);

        assert!(repo.read_device("fleet", "dev-1").await.unwrap_err().is_retryable());
        assert!(repo.read_device("fleet", "dev-1").await.is_err());
        assert!(repo.read_device("fleet", "dev-1").await.is_ok());
        assert_eq!(repo.calls(Operation::ReadDevice), 3);
    }

    #[tokio::test]
    async fn finalizer_removal_is_idempotent_and_deletes_when_last() {
        let repo = MemoryRepository::new();
        let mut seeded = device("dev-1");
        seeded.metadata.add_finalizer("a");
        seeded.metadata.add_finalizer("b");
        repo.insert_device(seeded);
        let mut dev = repo.mark_device_deleted("fleet", "dev-1").unwrap();

        repo.remove_device_finalizer(&mut dev, "a").await.unwrap();
        repo.remove_device_finalizer(&mut dev, "a").await.unwrap();
        assert_eq!(dev.metadata.finalizers, vec!["b".to_string()]);
        assert!(repo.device("fleet", "dev-1").is_some());

        repo.remove_device_finalizer(&mut dev, "b").await.unwrap();
        assert!(dev.metadata.finalizers.is_empty());
        assert!(repo.device("fleet", "dev-1").is_none());
        assert!(repo
            .read_device("fleet", "dev-1")
            .await
            .unwrap_err()
            .is_not_found());

        // Still fine once it's gone.
        repo.remove_device_finalizer(&mut dev, "b").await.unwrap();
    }

    #[tokio::test]
    async fn secrets_update_is_conditional() {
        let repo = MemoryRepository::new();
        let secret = Secret {
            metadata: ObjectMeta::new("ops", "ca"),
            data: btreemap! {"ca.crt".to_string() => b"x".to_vec()},
        };
        let created = repo.create_secret(&secret).await.unwrap();
        assert!(repo.create_secret(&secret).await.unwrap_err().is_conflict());

        let mut changed = created.clone();
        changed.data.insert("ca.key".to_string(), b"y".to_vec());
        let updated = repo.update_secret(&changed).await.unwrap();
        assert_eq!(updated.data.len(), 2);
        assert!(repo.update_secret(&changed).await.is_err());
    }
}
