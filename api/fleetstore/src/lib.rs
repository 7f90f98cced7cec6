/*!
# Background

The fleet endpoint doesn't own its data.  Devices, deployments, config maps and secrets live in a
declarative desired-state store shared with other controllers, which may write the same records
at any time.  This library defines the narrow contract the endpoint needs from that store.

# Library

The [`Repository`] trait lists every operation the endpoint performs.  Records carry a revision
token (`metadata.resource_version`) that the store bumps on every write.  Status writes are
conditional on the caller's revision, so a caller that raced with another writer gets a conflict
and must re-read before trying again.

[`MemoryRepository`] implements the trait in process, for tests and local runs.  It can be told
to fail upcoming calls so retry paths can be exercised, and it counts calls per operation.

The [`patch`] module computes the JSON merge patches status writes are expressed as.

# Current limitations

* There's no watch support; callers poll.
* Namespaces are only checked for existence, never created or deleted through the trait.
*/

pub mod error;
pub mod memory;
pub mod patch;

pub use error::{Error, Result};
pub use memory::{Fault, MemoryRepository, Operation};

use async_trait::async_trait;
use models::{ConfigMap, Deployment, Device, Secret};
use std::collections::BTreeMap;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns whether the given namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    async fn read_device(&self, namespace: &str, name: &str) -> Result<Device>;
    /// Stores a new device, failing with a conflict if the name is taken.  Returns the stored
    /// record, with its revision assigned.
    async fn create_device(&self, device: &Device) -> Result<Device>;
    /// Writes the difference between `old.status` and `new.status`, but only if the stored
    /// record is still at `old`'s revision.  Returns the stored record after the write.
    async fn patch_device_status(&self, old: &Device, new: &Device) -> Result<Device>;
    /// Replaces the device's labels.  Not conditional on revision, and not transactional with
    /// status writes.
    async fn update_device_labels(
        &self,
        device: &Device,
        labels: &BTreeMap<String, String>,
    ) -> Result<Device>;
    /// Removes a finalizer from the stored device, succeeding if it was already gone.  On
    /// success `device` is updated to reflect the stored finalizers and revision.  Removing the
    /// last finalizer of a device marked for deletion deletes it.
    async fn remove_device_finalizer(&self, device: &mut Device, tag: &str) -> Result<()>;

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn read_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    /// Replaces an existing secret's data and labels, conditional on its revision.
    async fn update_secret(&self, secret: &Secret) -> Result<Secret>;
}
