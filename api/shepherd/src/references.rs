//! Finds the config maps and secrets a deployment's pod specification refers to, checks they
//! exist with the keys the pod needs, and renders them for the device.
//!
//! References are collected per kind into a [`ReferenceSet`].  Each name maps to a
//! [`Requirement`], and repeated references to the same name are merged with
//! [`Requirement::join`]:
//!
//! ```text
//! Optional  ⊑  Required({})  ⊑  Required(K)      for any key set K
//! Required(A) ⊔ Required(B) = Required(A ∪ B)
//! ```
//!
//! Whole-object references (`envFrom`, volumes) contribute `Optional` or `Required({})`; key
//! references (`env[].valueFrom`) contribute `Optional` or `Required({key})`.

use log::debug;
use models::messages::SecretPayload;
use models::meta::base64_map;
use models::{Container, Deployment, PodSpec};
use serde::Serialize;
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, BTreeSet};

use fleetstore::Repository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The pod tolerates the object being absent.
    Optional,
    /// The object must exist and carry every listed key.
    Required(BTreeSet<String>),
}

impl Requirement {
    fn from_ref(optional: Option<bool>, key: Option<&str>) -> Self {
        if optional.unwrap_or(false) {
            return Requirement::Optional;
        }
        Requirement::Required(key.into_iter().map(str::to_string).collect())
    }

    /// Least upper bound of two requirements.
    pub fn join(self, other: Requirement) -> Requirement {
        match (self, other) {
            (Requirement::Optional, other) => other,
            (this, Requirement::Optional) => this,
            (Requirement::Required(mut a), Requirement::Required(b)) => {
                a.extend(b);
                Requirement::Required(a)
            }
        }
    }
}

/// Referenced names in the order they were first seen, with their merged requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    order: Vec<String>,
    entries: BTreeMap<String, Requirement>,
}

impl ReferenceSet {
    pub fn observe<S: Into<String>>(&mut self, name: S, requirement: Requirement) {
        let name = name.into();
        match self.entries.remove(&name) {
            Some(existing) => {
                self.entries.insert(name, existing.join(requirement));
            }
            None => {
                self.order.push(name.clone());
                self.entries.insert(name, requirement);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Requirement)> {
        self.order
            .iter()
            .filter_map(move |name| self.entries.get(name).map(|r| (name.as_str(), r)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Config map and secret references of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodReferences {
    pub config_maps: ReferenceSet,
    pub secrets: ReferenceSet,
}

/// Walks init containers then containers (`envFrom` before `env` in each), then volumes.
pub fn collect(pod: &PodSpec) -> PodReferences {
    let mut refs = PodReferences::default();
    for container in pod.init_containers.iter().chain(pod.containers.iter()) {
        collect_container(container, &mut refs);
    }
    for volume in &pod.volumes {
        if let Some(cm) = &volume.config_map {
            refs.config_maps
                .observe(&cm.name, Requirement::from_ref(cm.optional, None));
        }
        if let Some(secret) = &volume.secret {
            refs.secrets.observe(
                &secret.secret_name,
                Requirement::from_ref(secret.optional, None),
            );
        }
    }
    refs
}

fn collect_container(container: &Container, refs: &mut PodReferences) {
    for source in &container.env_from {
        if let Some(cm) = &source.config_map_ref {
            refs.config_maps
                .observe(&cm.name, Requirement::from_ref(cm.optional, None));
        }
        if let Some(secret) = &source.secret_ref {
            refs.secrets
                .observe(&secret.name, Requirement::from_ref(secret.optional, None));
        }
    }
    for var in &container.env {
        let value_from = match &var.value_from {
            Some(v) => v,
            None => continue,
        };
        if let Some(sel) = &value_from.config_map_key_ref {
            refs.config_maps.observe(
                &sel.name,
                Requirement::from_ref(sel.optional, Some(sel.key.as_str())),
            );
        }
        if let Some(sel) = &value_from.secret_key_ref {
            refs.secrets.observe(
                &sel.name,
                Requirement::from_ref(sel.optional, Some(sel.key.as_str())),
            );
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The referenced objects, rendered for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedReferences {
    /// Config maps as YAML, name and data only.
    pub config_maps: Vec<String>,
    pub secrets: Vec<SecretPayload>,
}

#[derive(Serialize)]
struct RenderedMeta<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct RenderedConfigMap<'a> {
    metadata: RenderedMeta<'a>,
    data: &'a BTreeMap<String, String>,
}

/// Fetches everything the deployment's pod refers to from its namespace.
pub async fn resolve(
    repo: &dyn Repository,
    namespace: &str,
    deployment: &Deployment,
) -> Result<ResolvedReferences> {
    let refs = collect(&deployment.spec.pod.spec);
    let mut resolved = ResolvedReferences::default();

    for (name, requirement) in refs.config_maps.iter() {
        let config_map = match repo.read_config_map(namespace, name).await {
            Ok(cm) => cm,
            Err(e) if e.is_not_found() => {
                ensure!(
                    *requirement == Requirement::Optional,
                    error::MissingObjectSnafu {
                        kind: "config map",
                        name
                    }
                );
                debug!("Skipping absent optional config map '{}/{}'", namespace, name);
                continue;
            }
            Err(e) => {
                return Err(e).context(error::FetchSnafu {
                    kind: "config map",
                    name,
                })
            }
        };
        if let Requirement::Required(keys) = requirement {
            for key in keys {
                ensure!(
                    config_map.data.contains_key(key),
                    error::MissingKeySnafu {
                        kind: "config map",
                        name,
                        key
                    }
                );
            }
        }
        let rendered = serde_yaml::to_string(&RenderedConfigMap {
            metadata: RenderedMeta { name },
            data: &config_map.data,
        })
        .context(error::RenderYamlSnafu { name })?;
        resolved.config_maps.push(rendered);
    }

    for (name, requirement) in refs.secrets.iter() {
        let secret = match repo.read_secret(namespace, name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                ensure!(
                    *requirement == Requirement::Optional,
                    error::MissingObjectSnafu {
                        kind: "secret",
                        name
                    }
                );
                debug!("Skipping absent optional secret '{}/{}'", namespace, name);
                continue;
            }
            Err(e) => return Err(e).context(error::FetchSnafu { kind: "secret", name }),
        };
        if let Requirement::Required(keys) = requirement {
            for key in keys {
                ensure!(
                    secret.data.contains_key(key),
                    error::MissingKeySnafu {
                        kind: "secret",
                        name,
                        key
                    }
                );
            }
        }
        let data = serde_json::to_string(&base64_map::encode(&secret.data))
            .context(error::RenderJsonSnafu { name })?;
        resolved.secrets.push(SecretPayload {
            name: name.to_string(),
            data,
        });
    }

    Ok(resolved)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Required {} '{}' not found", kind, name))]
        MissingObject { kind: &'static str, name: String },

        #[snafu(display("Required key '{}' missing from {} '{}'", key, kind, name))]
        MissingKey {
            kind: &'static str,
            name: String,
            key: String,
        },

        #[snafu(display("Unable to fetch {} '{}': {}", kind, name, source))]
        Fetch {
            kind: &'static str,
            name: String,
            source: fleetstore::Error,
        },

        #[snafu(display("Unable to render config map '{}': {}", name, source))]
        RenderYaml {
            name: String,
            source: serde_yaml::Error,
        },

        #[snafu(display("Unable to render secret '{}': {}", name, source))]
        RenderJson {
            name: String,
            source: serde_json::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use fleetstore::MemoryRepository;
    use maplit::{btreemap, btreeset};
    use models::{ConfigMap, ObjectMeta, Secret};

    fn pod(json: serde_json::Value) -> PodSpec {
        serde_json::from_value(json).unwrap()
    }

    fn deployment(pod_json: serde_json::Value) -> Deployment {
        let mut d = Deployment {
            metadata: ObjectMeta::new("fleet", "w1"),
            ..Default::default()
        };
        d.spec.pod.spec = pod(pod_json);
        d
    }

    fn required(keys: &[&str]) -> Requirement {
        Requirement::Required(keys.iter().map(|k| k.to_string()).collect())
    }

    #[test]
    fn join_is_the_lattice_upper_bound() {
        use Requirement::Optional;
        assert_eq!(Optional.join(Optional), Optional);
        assert_eq!(Optional.join(required(&[])), required(&[]));
        assert_eq!(required(&["a"]).join(Optional), required(&["a"]));
        assert_eq!(required(&[]).join(required(&["a"])), required(&["a"]));
        assert_eq!(
            required(&["a"]).join(required(&["b"])),
            Requirement::Required(btreeset! {"a".to_string(), "b".to_string()})
        );
    }

    #[test]
    fn mandatory_key_promotes_optional_entry() {
        let refs = collect(&pod(serde_json::json!({
            "containers": [{
                "name": "c1",
                "envFrom": [{"secretRef": {"name": "s1", "optional": true}}],
                "env": [{"name": "V", "valueFrom": {"secretKeyRef": {"name": "s1", "key": "k1"}}}]
            }]
        })));
        assert_eq!(refs.secrets.get("s1"), Some(&required(&["k1"])));
    }

    #[test]
    fn optional_key_ref_does_not_weaken_mandatory() {
        let refs = collect(&pod(serde_json::json!({
            "containers": [{
                "name": "c1",
                "envFrom": [{"configMapRef": {"name": "cm1"}}],
                "env": [{"name": "V", "valueFrom": {"configMapKeyRef": {"name": "cm1", "key": "k", "optional": true}}}]
            }]
        })));
        assert_eq!(refs.config_maps.get("cm1"), Some(&required(&[])));
    }

    #[test]
    fn discovery_order_is_init_containers_then_containers_then_volumes() {
        let refs = collect(&pod(serde_json::json!({
            "initContainers": [{"name": "i", "envFrom": [{"configMapRef": {"name": "from-init"}}]}],
            "containers": [{
                "name": "c",
                "env": [{"name": "A", "valueFrom": {"configMapKeyRef": {"name": "from-env", "key": "a"}}}],
                "envFrom": [{"configMapRef": {"name": "from-env-from"}}]
            }],
            "volumes": [
                {"name": "v1", "configMap": {"name": "from-volume", "optional": true}},
                {"name": "v2", "secret": {"secretName": "secret-volume"}}
            ]
        })));
        let names: Vec<&str> = refs.config_maps.iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["from-init", "from-env-from", "from-env", "from-volume"]
        );
        assert_eq!(refs.config_maps.get("from-volume"), Some(&Requirement::Optional));
        assert_eq!(refs.secrets.get("secret-volume"), Some(&required(&[])));
    }

    #[tokio::test]
    async fn mandatory_secret_key_must_exist() {
        let repo = MemoryRepository::new();
        repo.insert_secret(Secret {
            metadata: ObjectMeta::new("fleet", "s1"),
            data: btreemap! {"k2".to_string() => b"v".to_vec()},
        });
        let d = deployment(serde_json::json!({
            "containers": [{"name": "c", "env": [
                {"name": "V", "valueFrom": {"secretKeyRef": {"name": "s1", "key": "k1"}}}
            ]}]
        }));
        let err = resolve(&repo, "fleet", &d).await.unwrap_err();
        assert!(matches!(err, Error::MissingKey { ref key, .. } if key == "k1"));
    }

    #[tokio::test]
    async fn optional_absent_is_skipped_but_mandatory_absent_fails() {
        let repo = MemoryRepository::new();
        let optional = deployment(serde_json::json!({
            "containers": [{"name": "c", "envFrom": [{"secretRef": {"name": "s1", "optional": true}}]}]
        }));
        let resolved = resolve(&repo, "fleet", &optional).await.unwrap();
        assert!(resolved.secrets.is_empty());

        let mandatory = deployment(serde_json::json!({
            "containers": [{"name": "c", "envFrom": [{"secretRef": {"name": "s1", "optional": false}}]}]
        }));
        let err = resolve(&repo, "fleet", &mandatory).await.unwrap_err();
        assert!(matches!(err, Error::MissingObject { .. }));
    }

    #[tokio::test]
    async fn objects_are_rendered_for_the_device() {
        let repo = MemoryRepository::new();
        let mut cm = ConfigMap {
            metadata: ObjectMeta::new("fleet", "cm1"),
            data: btreemap! {"k".to_string() => "v".to_string()},
        };
        cm.metadata.labels.insert("internal".to_string(), "x".to_string());
        repo.insert_config_map(cm);
        repo.insert_secret(Secret {
            metadata: ObjectMeta::new("fleet", "s1"),
            data: btreemap! {"k1".to_string() => b"hi".to_vec()},
        });
        let d = deployment(serde_json::json!({
            "containers": [{"name": "c",
                "envFrom": [{"configMapRef": {"name": "cm1"}}, {"secretRef": {"name": "s1"}}]}]
        }));

        let resolved = resolve(&repo, "fleet", &d).await.unwrap();
        assert_eq!(resolved.config_maps, vec!["metadata:\n  name: cm1\ndata:\n  k: v\n"]);
        assert_eq!(
            resolved.secrets,
            vec![SecretPayload {
                name: "s1".to_string(),
                data: r#"{"k1":"aGk="}"#.to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn transient_fetch_fails_resolution() {
        let repo = MemoryRepository::new();
        repo.fail_next(
            fleetstore::Operation::ReadConfigMap,
            fleetstore::Fault::Transient,
            1,
        );
        let d = deployment(serde_json::json!({
            "containers": [{"name": "c", "envFrom": [{"configMapRef": {"name": "cm1", "optional": true}}]}]
        }));
        let err = resolve(&repo, "fleet", &d).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }
}
