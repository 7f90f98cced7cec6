/*!
# Fleet models

These are the shared types of the fleet control plane: the declarative records kept in the
desired-state store (devices, deployments, config maps, secrets), and the messages exchanged with
devices over the data and control channels.

Records follow the usual layout of a declarative store: an `ObjectMeta` carrying identity,
revision, labels, finalizers and the deletion marker, then a `spec` and (for devices) a `status`.

All maps are ordered (`BTreeMap`) so that serializing the same record twice produces the same
bytes; devices rely on that to treat the configuration message as idempotent.

"Modeled types" in [`modeled_types`] add input validation to plain strings.
*/

pub mod deployment;
pub mod device;
pub mod messages;
pub mod meta;
pub mod modeled_types;

pub use deployment::{
    ConfigMapEnvSource, ConfigMapKeySelector, ConfigMapVolumeSource, Container, ContainerMetrics,
    DataConfiguration, DataPath, Deployment, DeploymentMetrics, DeploymentSpec, EnvFromSource,
    EnvVar, EnvVarSource, ImageRegistries, PodSpec, PodTemplate, SecretEnvSource,
    SecretKeySelector, SecretVolumeSource, Volume,
};
pub use device::{
    Cpu, DeploymentAssignment, Device, DeviceMetrics, DeviceSpec, DeviceStatus, Hardware,
    HardwareProfile, HeartbeatConfiguration, Interface, LogCollectionConfig, Memory,
    OsInformation, ReceiverConfiguration, Retention, S3Reference, Storage, SystemMetrics,
    SystemVendor, WorkloadStatus,
};
pub use meta::{ConfigMap, ObjectMeta, ObjectRef, Secret};

/// Well-known names shared between the endpoint, the assembler and the store.
pub mod constants {
    /// Finalizer held by the data channel until the device has observed its decommissioning.
    pub const WORKLOAD_FINALIZER: &str = "shepherd.io/workload-finalizer";
    /// Finalizer held by the control channel until the device has been told to disconnect.
    pub const CONNECTION_FINALIZER: &str = "shepherd.io/connection-finalizer";

    /// Common name of the bootstrap certificate handed to devices without an identity.
    pub const REGISTRATION_COMMON_NAME: &str = "register";

    /// Keys of the certificate authority secret.
    pub const CA_CERT_KEY: &str = "ca.crt";
    pub const CA_KEY_KEY: &str = "ca.key";
    /// Keys of the registration client bundle secret.
    pub const CLIENT_CERT_KEY: &str = "client.crt";
    pub const CLIENT_KEY_KEY: &str = "client.key";
    /// Label marking the registration bundle secret for discovery.
    pub const REGISTRATION_SECRET_LABEL: &str = "reg-client-ca";

    /// Key an image-registry secret must expose.
    pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
    /// Key of a metrics allow-list config map.
    pub const ALLOW_LIST_KEY: &str = "metrics_list.yaml";
    /// Keys of a syslog target config map.
    pub const SYSLOG_ADDRESS_KEY: &str = "Address";
    pub const SYSLOG_PROTOCOL_KEY: &str = "Protocol";

    /// Keys of externally provided bucket configuration.
    pub const BUCKET_HOST_KEY: &str = "BUCKET_HOST";
    pub const BUCKET_NAME_KEY: &str = "BUCKET_NAME";
    pub const BUCKET_PORT_KEY: &str = "BUCKET_PORT";
    pub const BUCKET_REGION_KEY: &str = "BUCKET_REGION";
    pub const AWS_ACCESS_KEY_ID_KEY: &str = "AWS_ACCESS_KEY_ID";
    pub const AWS_SECRET_ACCESS_KEY_KEY: &str = "AWS_SECRET_ACCESS_KEY";
    pub const AWS_CA_BUNDLE_KEY: &str = "AWS_CA_BUNDLE";

    /// Prefix of labels derived from device hardware.
    pub const DEVICE_LABEL_PREFIX: &str = "device.shepherd.io/";
    /// Prefix of labels advertising the workloads running on a device.
    pub const WORKLOAD_LABEL_PREFIX: &str = "workload/";
}
