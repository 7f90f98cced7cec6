//! Messages exchanged with devices.
//!
//! Every request and response body is a [`Message`] envelope.  Devices push `heartbeat` and
//! `registration` directives on the data channel and pull their [`DeviceConfigurationMessage`]
//! from it; the control channel carries commands such as `disconnect`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::deployment::{ContainerMetrics, DataPath};
use crate::device::{Hardware, HardwareProfile, OsInformation};

pub const DIRECTIVE_HEARTBEAT: &str = "heartbeat";
pub const DIRECTIVE_REGISTRATION: &str = "registration";
pub const DIRECTIVE_REGISTRATION_RESPONSE: &str = "registration-response";
pub const COMMAND_DISCONNECT: &str = "disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Data,
    Command,
    Event,
    Connection,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Data
    }
}

/// Envelope of every message on both channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    #[serde(default)]
    pub version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub directive: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub content: Value,
}

impl Message {
    /// Builds an outgoing message of the given type around already-serialized content.
    pub fn new(message_type: MessageType, directive: &str, content: Value) -> Self {
        Self {
            message_type,
            directive: directive.to_string(),
            version: 1,
            content,
            ..Default::default()
        }
    }
}

/// Content of a control-channel command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, String>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Content of the `heartbeat` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub status: String,
    /// Version of the last configuration message the device applied.
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workloads: Vec<WorkloadReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
    #[serde(default)]
    pub events: Vec<EventInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_upload: Option<DateTime<Utc>>,
}

/// Something the device wants surfaced on its record's event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
}

/// Content of the `registration` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub certificate_request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
}

/// Content of the `registration-response` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub certificate: String,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Everything a device needs to converge, emitted on the data channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigurationMessage {
    pub device_id: String,
    /// Revision of the device record this message was assembled from.
    pub version: String,
    pub configuration: DeviceConfiguration,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    #[serde(default)]
    pub secrets: Vec<SecretPayload>,
    #[serde(default)]
    pub configmaps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfiguration {
    pub heartbeat: HeartbeatPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfiguration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_collection: BTreeMap<String, LogCollectionTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPolicy {
    pub period_seconds: i64,
    pub hardware_profile: HardwareProfile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfiguration {
    pub s3: S3StorageConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageConfiguration {
    pub bucket_host: String,
    pub bucket_name: String,
    pub bucket_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    /// Base64 of the CA bundle to trust for the bucket endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_ca_bundle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<MetricsRetention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetricsConfiguration>,
    pub receiver: MetricsReceiverConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRetention {
    pub max_mib: i32,
    pub max_hours: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsConfiguration {
    pub interval: i32,
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<MetricsAllowList>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReceiverConfiguration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub request_num_samples: i64,
    pub timeout_seconds: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
}

/// Metric names a device is allowed to forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsAllowList {
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionTarget {
    pub kind: String,
    pub buffer_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_config: Option<SyslogTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyslogTarget {
    pub address: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub name: String,
    /// The deployment's pod specification, as YAML.
    pub specification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WorkloadData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<WorkloadImageRegistries>,
    /// Referenced config maps, each as YAML.
    #[serde(default)]
    pub configmaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkloadMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadData {
    pub paths: Vec<DataPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadImageRegistries {
    pub auth_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetrics {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub port: i32,
    pub interval: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<MetricsAllowList>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, ContainerMetrics>,
}

/// A referenced secret; `data` is a JSON object of key to base64 value, as a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub name: String,
    pub data: String,
}
