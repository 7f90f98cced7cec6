//! The controller module maps between the device protocol and the fleet store.  Handlers in the
//! server module parse requests and call in here; everything that reads or changes records, and
//! the device lifecycle, lives here.
//!
//! A device's lifecycle is tracked with two finalizers added when it registers.  When an
//! operator marks the device deleted, the data channel releases the workload finalizer the next
//! time the device pulls its configuration (which then lists no workloads), and only after that
//! does the control channel tell the device to disconnect and release the connection finalizer.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use models::constants::{
    CONNECTION_FINALIZER, DEVICE_LABEL_PREFIX, WORKLOAD_FINALIZER, WORKLOAD_LABEL_PREFIX,
};
use models::messages::{
    Command, DeviceConfigurationMessage, Heartbeat, Message, MessageType, RegistrationInfo,
    RegistrationResponse, WorkloadReport, COMMAND_DISCONNECT, DIRECTIVE_HEARTBEAT,
    DIRECTIVE_REGISTRATION, DIRECTIVE_REGISTRATION_RESPONSE,
};
use models::modeled_types::{sanitize_label_value, DeviceName};
use models::{Device, ObjectMeta, WorkloadStatus};
use serde::de::DeserializeOwned;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, FibonacciBackoff};
use tokio_retry::RetryIf;

use super::error::{self, Result};
use super::verifier::VerifiedPeer;
use crate::assembler::Assembler;
use crate::certificates::{self, CertificateAuthority, Role};
use crate::events::{EventRecorder, EventType};
use crate::metrics::Metrics;
use fleetstore::Repository;

const PHASE_UP: &str = "up";

/// How status-changing store calls are retried.  Conflicts and transient failures are retried
/// with a fresh read of the device; anything else fails at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delays between attempts; one fewer than the number of attempts.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let base_millis = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        FibonacciBackoff::from_millis(base_millis)
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(50),
        }
    }
}

pub struct Endpoint {
    repo: Arc<dyn Repository>,
    ca: Arc<CertificateAuthority>,
    assembler: Assembler,
    events: EventRecorder,
    metrics: Arc<Metrics>,
    namespace: String,
    retry: RetryPolicy,
}

impl Endpoint {
    pub fn new<S: Into<String>>(
        repo: Arc<dyn Repository>,
        ca: Arc<CertificateAuthority>,
        assembler: Assembler,
        events: EventRecorder,
        metrics: Arc<Metrics>,
        namespace: S,
    ) -> Self {
        Self {
            repo,
            ca,
            assembler,
            events,
            metrics,
            namespace: namespace.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Control channel pull.  Returns a command for the device, if there is one.
    pub async fn get_control(&self, device_id: &str) -> Result<Option<Message>> {
        let device = self.read_device(device_id).await?;
        if !device.metadata.is_deleted() {
            return Ok(None);
        }

        // The data channel tears down workloads first; until it has, stay connected.
        if device.metadata.has_finalizer(WORKLOAD_FINALIZER) {
            debug!(
                "Device '{}' is deleted but still releasing workloads",
                device_id
            );
            return Ok(None);
        }
        if device.metadata.finalizers != [CONNECTION_FINALIZER] {
            return Ok(None);
        }

        self.remove_finalizer(&device, CONNECTION_FINALIZER).await?;
        self.metrics.inc_unregistration();
        info!("Device '{}' unregistered, sending disconnect", device_id);

        let command = Command {
            command: COMMAND_DISCONNECT.to_string(),
            ..Default::default()
        };
        Ok(Some(outgoing(
            MessageType::Command,
            "",
            to_content(&command)?,
            None,
        )))
    }

    /// Data channel pull: the device's configuration message.
    pub async fn get_data(&self, device_id: &str) -> Result<Message> {
        let mut device = self.read_device(device_id).await?;

        if device.metadata.is_deleted() && device.metadata.has_finalizer(WORKLOAD_FINALIZER) {
            device = self.remove_finalizer(&device, WORKLOAD_FINALIZER).await?;
            info!(
                "Device '{}' is being deleted; released its workloads",
                device_id
            );
        }

        let configuration = match self.assembler.assemble(&device).await {
            Ok(configuration) => configuration,
            Err(e) => {
                warn!("Unable to assemble configuration for '{}': {}", device_id, e);
                self.events.warning(&device, e.reason(), e.to_string());
                return Err(e).context(error::AssemblySnafu { device: device_id });
            }
        };
        Ok(outgoing(
            MessageType::Data,
            "",
            to_content::<DeviceConfigurationMessage>(&configuration)?,
            None,
        ))
    }

    /// Data channel push.  Returns the reply to send back, if the directive has one.
    pub async fn post_data(
        &self,
        device_id: &str,
        peer: &VerifiedPeer,
        message: Message,
    ) -> Result<Option<Message>> {
        match message.directive.as_str() {
            DIRECTIVE_HEARTBEAT => {
                ensure!(
                    peer.role() == Role::Device,
                    error::WrongPeerSnafu {
                        directive: DIRECTIVE_HEARTBEAT
                    }
                );
                let heartbeat: Heartbeat = from_content(DIRECTIVE_HEARTBEAT, message.content)?;
                self.heartbeat(device_id, heartbeat).await?;
                Ok(None)
            }
            DIRECTIVE_REGISTRATION => {
                let info: RegistrationInfo =
                    from_content(DIRECTIVE_REGISTRATION, message.content)?;
                let certificate = self.register(device_id, peer, info).await?;
                let response = RegistrationResponse { certificate };
                Ok(Some(outgoing(
                    MessageType::Data,
                    DIRECTIVE_REGISTRATION_RESPONSE,
                    to_content(&response)?,
                    Some(message.message_id).filter(|id| !id.is_empty()),
                )))
            }
            other => error::UnknownDirectiveSnafu { directive: other }.fail(),
        }
    }

    /// Control channel push; devices acknowledge commands here.
    pub fn post_control(&self, device_id: &str, message: &Message) {
        info!(
            "Device '{}' sent '{}' on the control channel{}",
            device_id,
            message.directive,
            message
                .response_to
                .as_ref()
                .map(|id| format!(" in response to '{}'", id))
                .unwrap_or_default()
        );
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    async fn heartbeat(&self, device_id: &str, heartbeat: Heartbeat) -> Result<()> {
        let now = Utc::now();
        let device = self.read_device_with_retry(device_id).await?;
        let updated = self
            .update_status(device, "heartbeat status update", |d| {
                apply_heartbeat(d, &heartbeat, now)
            })
            .await?;
        debug!(
            "Heartbeat from '{}' applied at revision {}",
            device_id, updated.metadata.resource_version
        );

        self.sync_labels(&updated).await;

        for event in &heartbeat.events {
            self.events.record(
                &updated,
                EventType::from_reported(&event.event_type),
                event.reason.as_str(),
                event.message.as_str(),
            );
        }
        Ok(())
    }

    async fn register(
        &self,
        device_id: &str,
        peer: &VerifiedPeer,
        info: RegistrationInfo,
    ) -> Result<String> {
        let name = DeviceName::try_from(device_id).context(error::InvalidDeviceIdSnafu)?;
        certificates::check_device_csr(&name, &info.certificate_request)
            .context(error::CertificateSnafu { device: device_id })?;

        let device = match self.repo.read_device(&self.namespace, &name).await {
            Ok(device) => {
                info!("Renewing certificate of device '{}'", device_id);
                device
            }
            Err(e) if e.is_not_found() => {
                // A device certificate can renew, but only the registration certificate creates.
                ensure!(
                    peer.role() == Role::Register,
                    error::DeviceNotFoundSnafu {
                        namespace: &self.namespace,
                        name: device_id,
                    }
                );
                let mut device = Device {
                    metadata: ObjectMeta::new(self.namespace.as_str(), device_id),
                    ..Default::default()
                };
                device.metadata.add_finalizer(WORKLOAD_FINALIZER);
                device.metadata.add_finalizer(CONNECTION_FINALIZER);
                device.status.hardware = info.hardware.clone();

                match self.repo.create_device(&device).await {
                    Ok(created) => {
                        self.metrics.inc_successful_registration();
                        info!("Registered new device '{}'", device_id);
                        created
                    }
                    Err(e) => {
                        self.metrics.inc_failed_registration();
                        return Err(e).context(error::RepositorySnafu {
                            op: "device creation",
                        });
                    }
                }
            }
            Err(e) => {
                self.metrics.inc_failed_registration();
                return Err(e).context(error::RepositorySnafu { op: "device read" });
            }
        };

        let hardware = info.hardware;
        self.update_status(device, "registration status update", |d| {
            if hardware.is_some() {
                d.status.hardware = hardware.clone();
            }
        })
        .await?;

        self.ca
            .sign_device_csr(&name, &info.certificate_request)
            .context(error::CertificateSnafu { device: device_id })
    }

    /// Replaces the labels this endpoint derives, leaving any others alone.  Best effort.
    async fn sync_labels(&self, device: &Device) {
        let labels = derived_labels(device);
        if labels == device.metadata.labels {
            return;
        }
        if let Err(e) = self.repo.update_device_labels(device, &labels).await {
            warn!(
                "Unable to update labels of device '{}': {}",
                device.metadata.name, e
            );
        }
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Read for dispatch; not retried.
    async fn read_device(&self, device_id: &str) -> Result<Device> {
        let name = DeviceName::try_from(device_id).context(error::InvalidDeviceIdSnafu)?;
        let result = self.repo.read_device(&self.namespace, &name).await;
        self.device_result(device_id, result)
    }

    async fn read_device_with_retry(&self, device_id: &str) -> Result<Device> {
        let name = DeviceName::try_from(device_id).context(error::InvalidDeviceIdSnafu)?;
        let (repo, namespace, name) = (&self.repo, self.namespace.as_str(), name.as_ref());
        let result = self
            .retry("device read", || async move {
                repo.read_device(namespace, name).await
            })
            .await;
        self.device_result(device_id, result)
    }

    fn device_result(
        &self,
        device_id: &str,
        result: fleetstore::Result<Device>,
    ) -> Result<Device> {
        match result {
            Ok(device) => Ok(device),
            Err(e) if e.is_not_found() => error::DeviceNotFoundSnafu {
                namespace: &self.namespace,
                name: device_id,
            }
            .fail(),
            Err(e) => Err(e).context(error::RepositorySnafu { op: "device read" }),
        }
    }

    /// Applies `mutate` to the device's status and writes it conditionally on the revision it
    /// was read at.  The first attempt uses `device` as given; later ones re-read it.
    async fn update_status<F>(&self, device: Device, op: &'static str, mutate: F) -> Result<Device>
    where
        F: Fn(&mut Device),
    {
        let (repo, mutate) = (&self.repo, &mutate);
        let (namespace, name) = (device.metadata.namespace.clone(), device.metadata.name.clone());
        let mut known = Some(device);
        let result = self
            .retry(op, || {
                let known = known.take();
                let (namespace, name) = (namespace.as_str(), name.as_str());
                async move {
                    let old = match known {
                        Some(device) => device,
                        None => repo.read_device(namespace, name).await?,
                    };
                    let mut new = old.clone();
                    mutate(&mut new);
                    repo.patch_device_status(&old, &new).await
                }
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => error::DeviceNotFoundSnafu { namespace, name }.fail(),
            other => other.context(error::RepositorySnafu { op }),
        }
    }

    async fn remove_finalizer(&self, device: &Device, tag: &'static str) -> Result<Device> {
        let repo = &self.repo;
        self.retry("finalizer removal", || {
            let mut device = device.clone();
            async move {
                repo.remove_device_finalizer(&mut device, tag).await?;
                Ok(device)
            }
        })
        .await
        .context(error::RepositorySnafu {
            op: "finalizer removal",
        })
    }

    /// Runs `action` until it succeeds, fails with an error that isn't worth retrying, or the
    /// attempts run out.
    async fn retry<T, A, Fut>(&self, op: &'static str, action: A) -> fleetstore::Result<T>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = fleetstore::Result<T>>,
    {
        RetryIf::start(self.retry.backoff(), action, |e: &fleetstore::Error| {
            let retryable = e.is_retryable();
            if retryable {
                warn!("Retrying {} after: {}", op, e);
            }
            retryable
        })
        .await
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Applies a heartbeat to a device's status.  Only depends on its inputs, so applying the same
/// heartbeat again gives the same status.
fn apply_heartbeat(device: &mut Device, heartbeat: &Heartbeat, now: DateTime<Utc>) {
    let status = &mut device.status;
    status.phase = PHASE_UP.to_string();
    status.last_seen_time = Some(now);
    status.last_synced_resource_version = heartbeat.version.clone();
    if heartbeat.hardware.is_some() {
        status.hardware = heartbeat.hardware.clone();
    }

    for report in &heartbeat.workloads {
        if let Some(assignment) = status.deployment_mut(&report.name) {
            if assignment.phase != report.status {
                assignment.phase = report.status.clone();
                assignment.last_transition_time = Some(now);
            }
        }
    }

    let previous = std::mem::take(&mut status.workloads);
    status.workloads = heartbeat
        .workloads
        .iter()
        .map(|report| workload_status(report, &previous, now))
        .collect();
}

fn workload_status(
    report: &WorkloadReport,
    previous: &[WorkloadStatus],
    now: DateTime<Utc>,
) -> WorkloadStatus {
    let last_transition_time = previous
        .iter()
        .find(|w| w.name == report.name && w.phase == report.status)
        .and_then(|w| w.last_transition_time)
        .or(Some(now));
    WorkloadStatus {
        name: report.name.clone(),
        phase: report.status.clone(),
        last_transition_time,
        last_data_upload: report.last_data_upload,
    }
}

/// The device's labels with ours recomputed from its hardware and workloads.
fn derived_labels(device: &Device) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = device
        .metadata
        .labels
        .iter()
        .filter(|(k, _)| {
            !k.starts_with(DEVICE_LABEL_PREFIX) && !k.starts_with(WORKLOAD_LABEL_PREFIX)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut add = |suffix: &str, value: &str| {
        let value = sanitize_label_value(value);
        if !value.is_empty() {
            labels.insert(format!("{}{}", DEVICE_LABEL_PREFIX, suffix), value);
        }
    };
    if let Some(hw) = &device.status.hardware {
        add("hostname", &hw.hostname);
        if let Some(cpu) = &hw.cpu {
            add("cpu-architecture", &cpu.architecture);
            add("cpu-model", &cpu.model_name);
        }
        if let Some(vendor) = &hw.system_vendor {
            add("system-manufacturer", &vendor.manufacturer);
            add("system-product", &vendor.product_name);
        }
    }

    for workload in &device.status.workloads {
        let name = sanitize_label_value(&workload.name);
        if !name.is_empty() {
            labels.insert(format!("{}{}", WORKLOAD_LABEL_PREFIX, name), "true".to_string());
        }
    }
    labels
}

fn from_content<T: DeserializeOwned>(directive: &str, content: serde_json::Value) -> Result<T> {
    serde_json::from_value(content).context(error::MalformedContentSnafu { directive })
}

fn to_content<T: serde::Serialize>(content: &T) -> Result<serde_json::Value> {
    serde_json::to_value(content).context(error::ResponseSerializationSnafu)
}

fn outgoing(
    message_type: MessageType,
    directive: &str,
    content: serde_json::Value,
    response_to: Option<String>,
) -> Message {
    let mut message = Message::new(message_type, directive, content);
    message.message_id = format!("{:032x}", rand::random::<u128>());
    message.response_to = response_to;
    message.sent = Some(Utc::now());
    message
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembler::Defaults;
    use crate::certificates::test_support::{csr_for, der_chain};
    use crate::certificates::Peer;
    use crate::events::Event;
    use crate::storage::ClaimsDisabled;
    use fleetstore::{Fault, MemoryRepository, Operation};
    use maplit::btreemap;
    use models::messages::SyslogTarget;
    use models::{
        ConfigMap, Cpu, DeploymentAssignment, Hardware, LogCollectionConfig, ObjectRef, Secret,
    };
    use tokio::sync::mpsc;

    const NS: &str = "fleet";

    struct Harness {
        repo: Arc<MemoryRepository>,
        ca: Arc<CertificateAuthority>,
        endpoint: Endpoint,
        events: mpsc::Receiver<Event>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_namespace(NS);
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let assembler = Assembler::new(repo.clone(), Arc::new(ClaimsDisabled), Defaults::default());
        let (recorder, events) = EventRecorder::channel(16);
        let endpoint = Endpoint::new(
            repo.clone(),
            ca.clone(),
            assembler,
            recorder,
            Arc::new(Metrics::new()),
            NS,
        )
        .with_retry_policy(RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(1),
        });
        Harness {
            repo,
            ca,
            endpoint,
            events,
        }
    }

    fn peer(cn: &str) -> VerifiedPeer {
        VerifiedPeer {
            peer: Peer {
                common_name: cn.to_string(),
            },
        }
    }

    fn message(directive: &str, content: serde_json::Value) -> Message {
        serde_json::from_value(serde_json::json!({
            "directive": directive,
            "content": content,
        }))
        .unwrap()
    }

    fn registered(repo: &MemoryRepository, deployments: &[(&str, &str)]) -> Device {
        let mut device = Device {
            metadata: ObjectMeta::new(NS, "dev-1"),
            ..Default::default()
        };
        device.metadata.add_finalizer(WORKLOAD_FINALIZER);
        device.metadata.add_finalizer(CONNECTION_FINALIZER);
        device.status.deployments = deployments
            .iter()
            .map(|(name, phase)| DeploymentAssignment {
                name: name.to_string(),
                phase: phase.to_string(),
                ..Default::default()
            })
            .collect();
        repo.insert_device(device)
    }

    fn deployment_using_secret(repo: &MemoryRepository, optional: bool) {
        let mut deployment = models::Deployment {
            metadata: ObjectMeta::new(NS, "w1"),
            ..Default::default()
        };
        deployment.spec.pod.spec = serde_json::from_value(serde_json::json!({
            "containers": [{"name": "c", "env": [{"name": "V", "valueFrom": {
                "secretKeyRef": {"name": "s1", "key": "k1", "optional": optional}
            }}]}]
        }))
        .unwrap();
        repo.insert_deployment(deployment);
    }

    fn configuration(message: &Message) -> DeviceConfigurationMessage {
        serde_json::from_value(message.content.clone()).unwrap()
    }

    #[tokio::test]
    async fn registration_creates_device_and_signs() {
        let h = harness();
        let msg = message(
            DIRECTIVE_REGISTRATION,
            serde_json::json!({
                "certificate_request": csr_for("dev-1"),
                "hardware": {"hostname": "h1"},
            }),
        );

        let reply = h
            .endpoint
            .post_data("dev-1", &peer("register"), msg)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.repo.calls(Operation::CreateDevice), 1);
        assert_eq!(h.repo.calls(Operation::PatchDeviceStatus), 1);
        let counters = h.endpoint.metrics().snapshot();
        assert_eq!(counters.successful_registrations, 1);
        assert_eq!(counters.failed_registrations, 0);

        assert_eq!(reply.directive, DIRECTIVE_REGISTRATION_RESPONSE);
        let response: RegistrationResponse = serde_json::from_value(reply.content).unwrap();
        assert!(response.certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        let signed = h.ca.authenticate(&der_chain(&response.certificate)).unwrap();
        assert_eq!(signed.common_name, "dev-1");

        let stored = h.repo.device(NS, "dev-1").unwrap();
        assert!(stored.metadata.has_finalizer(WORKLOAD_FINALIZER));
        assert!(stored.metadata.has_finalizer(CONNECTION_FINALIZER));
        assert_eq!(stored.status.hardware.unwrap().hostname, "h1");
        assert!(stored.status.deployments.is_empty());
    }

    #[tokio::test]
    async fn registration_failures() {
        let h = harness();
        let register = peer("register");

        // CSR for someone else: rejected before the store is touched.
        let msg = message(
            DIRECTIVE_REGISTRATION,
            serde_json::json!({"certificate_request": csr_for("dev-2")}),
        );
        let err = h.endpoint.post_data("dev-1", &register, msg).await.unwrap_err();
        assert!(matches!(err, error::Error::Certificate { .. }));
        assert_eq!(h.repo.calls(Operation::ReadDevice), 0);

        // Store failure while creating counts as a failed registration.
        h.repo.fail_next(Operation::CreateDevice, Fault::Transient, 1);
        let msg = message(
            DIRECTIVE_REGISTRATION,
            serde_json::json!({"certificate_request": csr_for("dev-1")}),
        );
        let err = h.endpoint.post_data("dev-1", &register, msg).await.unwrap_err();
        assert!(matches!(err, error::Error::Repository { .. }));
        assert_eq!(h.endpoint.metrics().snapshot().failed_registrations, 1);
        assert!(h.repo.device(NS, "dev-1").is_none());

        // Content of the wrong shape.
        let msg = message(DIRECTIVE_REGISTRATION, serde_json::json!({"csr": 1}));
        let err = h.endpoint.post_data("dev-1", &register, msg).await.unwrap_err();
        assert!(matches!(err, error::Error::MalformedContent { .. }));
    }

    #[tokio::test]
    async fn renewal_with_own_certificate() {
        let h = harness();
        registered(&h.repo, &[]);
        let msg = message(
            DIRECTIVE_REGISTRATION,
            serde_json::json!({"certificate_request": csr_for("dev-1")}),
        );
        let reply = h
            .endpoint
            .post_data("dev-1", &peer("dev-1"), msg)
            .await
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(h.repo.calls(Operation::CreateDevice), 0);
        assert_eq!(h.endpoint.metrics().snapshot().successful_registrations, 0);

        // A device certificate can't bring back a record that's gone.
        let msg = message(
            DIRECTIVE_REGISTRATION,
            serde_json::json!({"certificate_request": csr_for("dev-9")}),
        );
        let err = h
            .endpoint
            .post_data("dev-9", &peer("dev-9"), msg)
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn heartbeat_updates_phase() {
        let mut h = harness();
        registered(&h.repo, &[("w1", "failing")]);
        let msg = message(
            DIRECTIVE_HEARTBEAT,
            serde_json::json!({
                "version": "7",
                "workloads": [{"name": "w1", "status": "running"}, {"name": "zz", "status": "x"}],
                "hardware": {"hostname": "edge host", "cpu": {"architecture": "aarch64"}},
                "events": [{"message": "disk low", "reason": "Disk", "type": "warn"}],
            }),
        );

        let reply = h.endpoint.post_data("dev-1", &peer("dev-1"), msg).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(h.repo.calls(Operation::PatchDeviceStatus), 1);

        let stored = h.repo.device(NS, "dev-1").unwrap();
        assert_eq!(stored.status.deployments[0].phase, "running");
        assert_eq!(stored.status.deployments.len(), 1);
        assert_eq!(stored.status.phase, "up");
        assert_eq!(stored.status.last_synced_resource_version, "7");
        assert_eq!(stored.status.workloads.len(), 2);
        assert_eq!(
            stored.metadata.labels,
            btreemap! {
                "device.shepherd.io/cpu-architecture".to_string() => "aarch64".to_string(),
                "device.shepherd.io/hostname".to_string() => "edge-host".to_string(),
                "workload/w1".to_string() => "true".to_string(),
                "workload/zz".to_string() => "true".to_string(),
            }
        );

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.reason, "Disk");
        assert_eq!(event.event_type, EventType::Warning);
    }

    #[tokio::test]
    async fn heartbeat_needs_device_certificate() {
        let h = harness();
        registered(&h.repo, &[]);
        let msg = message(DIRECTIVE_HEARTBEAT, serde_json::json!({}));
        let err = h
            .endpoint
            .post_data("dev-1", &peer("register"), msg)
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::WrongPeer { .. }));
    }

    #[tokio::test]
    async fn heartbeat_is_idempotent_across_transient_errors() {
        let heartbeat = Heartbeat {
            version: "3".to_string(),
            workloads: vec![WorkloadReport {
                name: "w1".to_string(),
                status: "running".to_string(),
                last_data_upload: None,
            }],
            hardware: Some(Hardware {
                hostname: "h1".to_string(),
                cpu: Some(Cpu::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let content = serde_json::to_value(&heartbeat).unwrap();

        let clean = harness();
        registered(&clean.repo, &[("w1", "failing")]);
        clean
            .endpoint
            .post_data("dev-1", &peer("dev-1"), message(DIRECTIVE_HEARTBEAT, content.clone()))
            .await
            .unwrap();

        let flaky = harness();
        registered(&flaky.repo, &[("w1", "failing")]);
        flaky.repo.fail_next(Operation::ReadDevice, Fault::Transient, 1);
        flaky.repo.fail_next(Operation::PatchDeviceStatus, Fault::Conflict, 2);
        flaky
            .endpoint
            .post_data("dev-1", &peer("dev-1"), message(DIRECTIVE_HEARTBEAT, content))
            .await
            .unwrap();
        assert_eq!(flaky.repo.calls(Operation::PatchDeviceStatus), 3);

        let strip = |mut d: Device| {
            d.status.last_seen_time = None;
            for w in d.status.workloads.iter_mut() {
                w.last_transition_time = None;
            }
            for a in d.status.deployments.iter_mut() {
                a.last_transition_time = None;
            }
            d.status
        };
        assert_eq!(
            strip(clean.repo.device(NS, "dev-1").unwrap()),
            strip(flaky.repo.device(NS, "dev-1").unwrap())
        );
    }

    #[tokio::test]
    async fn heartbeat_retries_are_bounded() {
        let h = harness();
        registered(&h.repo, &[]);
        h.repo.fail_next(Operation::PatchDeviceStatus, Fault::Transient, 4);
        let err = h
            .endpoint
            .post_data("dev-1", &peer("dev-1"), message(DIRECTIVE_HEARTBEAT, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::Repository { .. }));
        assert_eq!(h.repo.calls(Operation::PatchDeviceStatus), 4);

        let err = h
            .endpoint
            .post_data("dev-2", &peer("dev-2"), message(DIRECTIVE_HEARTBEAT, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn heartbeat_survives_label_update_failure() {
        let h = harness();
        registered(&h.repo, &[]);
        h.repo.fail_next(Operation::UpdateDeviceLabels, Fault::Transient, 1);
        let msg = message(
            DIRECTIVE_HEARTBEAT,
            serde_json::json!({"hardware": {"hostname": "h1"}}),
        );

        let reply = h.endpoint.post_data("dev-1", &peer("dev-1"), msg).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(h.repo.calls(Operation::UpdateDeviceLabels), 1);

        // Status landed; labels are left for the next heartbeat.
        let stored = h.repo.device(NS, "dev-1").unwrap();
        assert_eq!(stored.status.phase, "up");
        assert_eq!(stored.status.hardware.unwrap().hostname, "h1");
        assert!(stored.metadata.labels.is_empty());
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(10),
        };
        let delays: Vec<_> = policy.backoff().collect();
        assert_eq!(delays.len(), 3);
        for (delay, bound) in delays.iter().zip([10, 10, 20]) {
            assert!(*delay <= Duration::from_millis(bound));
        }

        let huge = RetryPolicy {
            attempts: 3,
            base_delay: Duration::MAX,
        };
        assert_eq!(huge.backoff().count(), 2);

        let once = RetryPolicy {
            attempts: 1,
            base_delay: Duration::from_millis(10),
        };
        assert_eq!(once.backoff().count(), 0);
    }

    #[tokio::test]
    async fn unknown_directive_is_rejected() {
        let h = harness();
        let err = h
            .endpoint
            .post_data("dev-1", &peer("dev-1"), message("reboot", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::UnknownDirective { .. }));
    }

    #[tokio::test]
    async fn missing_mandatory_secret_key_fails_data_pull() {
        let mut h = harness();
        deployment_using_secret(&h.repo, false);
        h.repo.insert_secret(Secret {
            metadata: ObjectMeta::new(NS, "s1"),
            data: btreemap! { "k2".to_string() => b"v".to_vec() },
        });
        registered(&h.repo, &[("w1", "")]);

        let err = h.endpoint.get_data("dev-1").await.unwrap_err();
        assert!(matches!(err, error::Error::Assembly { .. }));
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Warning);
        assert_eq!(event.reason, "ReferenceUnavailable");
    }

    #[tokio::test]
    async fn optional_secret_absent_is_fine() {
        let h = harness();
        deployment_using_secret(&h.repo, true);
        registered(&h.repo, &[("w1", "")]);

        let reply = h.endpoint.get_data("dev-1").await.unwrap();
        assert_eq!(reply.message_type, MessageType::Data);
        let config = configuration(&reply);
        assert_eq!(config.workloads.len(), 1);
        assert!(config.secrets.iter().all(|s| s.name != "s1"));
    }

    #[tokio::test]
    async fn decommission_ordering() {
        let h = harness();
        registered(&h.repo, &[("w1", "running")]);
        h.repo.mark_device_deleted(NS, "dev-1").unwrap();

        // Control channel waits for the workload finalizer.
        assert!(h.endpoint.get_control("dev-1").await.unwrap().is_none());
        assert_eq!(h.endpoint.metrics().snapshot().unregistrations, 0);
        let stored = h.repo.device(NS, "dev-1").unwrap();
        assert_eq!(stored.metadata.finalizers.len(), 2);

        let reply = h.endpoint.get_data("dev-1").await.unwrap();
        assert!(configuration(&reply).workloads.is_empty());
        let stored = h.repo.device(NS, "dev-1").unwrap();
        assert_eq!(stored.metadata.finalizers, vec![CONNECTION_FINALIZER.to_string()]);

        // Pulling again still emits no workloads.
        let reply = h.endpoint.get_data("dev-1").await.unwrap();
        assert!(configuration(&reply).workloads.is_empty());

        let command = h.endpoint.get_control("dev-1").await.unwrap().unwrap();
        assert_eq!(command.message_type, MessageType::Command);
        let command: Command = serde_json::from_value(command.content).unwrap();
        assert_eq!(command.command, COMMAND_DISCONNECT);
        assert_eq!(h.endpoint.metrics().snapshot().unregistrations, 1);
        assert!(h.repo.device(NS, "dev-1").is_none());

        let err = h.endpoint.get_control("dev-1").await.unwrap_err();
        assert!(matches!(err, error::Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_connection_release_is_an_error() {
        let h = harness();
        let mut device = registered(&h.repo, &[]);
        device.metadata.remove_finalizer(WORKLOAD_FINALIZER);
        h.repo.insert_device(device);
        h.repo.mark_device_deleted(NS, "dev-1").unwrap();
        h.repo.fail_next(Operation::RemoveDeviceFinalizer, Fault::Transient, 4);

        assert!(h.endpoint.get_control("dev-1").await.is_err());
        assert_eq!(h.endpoint.metrics().snapshot().unregistrations, 0);
        assert!(h.repo.device(NS, "dev-1").unwrap().metadata.has_finalizer(CONNECTION_FINALIZER));
    }

    #[tokio::test]
    async fn invalid_syslog_protocol_fails_data_pull() {
        let h = harness();
        h.repo.insert_config_map(ConfigMap {
            metadata: ObjectMeta::new(NS, "syslog"),
            data: btreemap! {
                "Address".to_string() => "x:1".to_string(),
                "Protocol".to_string() => "sctp".to_string(),
            },
        });
        let mut device = registered(&h.repo, &[]);
        device.spec.log_collection = btreemap! {
            "system".to_string() => LogCollectionConfig {
                kind: "syslog".to_string(),
                buffer_size: 8,
                syslog_config: Some(ObjectRef::new("syslog")),
            },
        };
        h.repo.insert_device(device);

        let err = h.endpoint.get_data("dev-1").await.unwrap_err();
        assert!(err.to_string().contains("protocol"));

        h.repo.insert_config_map(ConfigMap {
            metadata: ObjectMeta::new(NS, "syslog"),
            data: btreemap! { "Address".to_string() => "x:1".to_string() },
        });
        let config = configuration(&h.endpoint.get_data("dev-1").await.unwrap());
        assert_eq!(
            config.configuration.log_collection["system"].syslog_config,
            Some(SyslogTarget {
                address: "x:1".to_string(),
                protocol: "tcp".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn live_device_gets_no_command() {
        let h = harness();
        registered(&h.repo, &[]);
        assert!(h.endpoint.get_control("dev-1").await.unwrap().is_none());
        assert!(matches!(
            h.endpoint.get_control("Not_A_Name").await.unwrap_err(),
            error::Error::InvalidDeviceId { .. }
        ));
    }

    #[test]
    fn labels_keep_foreign_keys() {
        let mut device = Device::default();
        device.metadata.labels = btreemap! {
            "team".to_string() => "edge".to_string(),
            "workload/old".to_string() => "true".to_string(),
        };
        device.status.workloads = vec![WorkloadStatus {
            name: "new".to_string(),
            ..Default::default()
        }];
        assert_eq!(
            derived_labels(&device),
            btreemap! {
                "team".to_string() => "edge".to_string(),
                "workload/new".to_string() => "true".to_string(),
            }
        );
    }

    #[test]
    fn unchanged_workload_keeps_transition_time() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let previous = vec![WorkloadStatus {
            name: "w1".to_string(),
            phase: "running".to_string(),
            last_transition_time: Some(earlier),
            last_data_upload: None,
        }];
        let report = WorkloadReport {
            name: "w1".to_string(),
            status: "running".to_string(),
            last_data_upload: None,
        };
        let now = Utc::now();
        assert_eq!(
            workload_status(&report, &previous, now).last_transition_time,
            Some(earlier)
        );
        let changed = WorkloadReport {
            status: "failing".to_string(),
            ..report
        };
        assert_eq!(
            workload_status(&changed, &previous, now).last_transition_time,
            Some(now)
        );
    }
}
