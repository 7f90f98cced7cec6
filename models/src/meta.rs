//! Identity and bookkeeping common to every stored record, plus the two plain-data records that
//! workloads reference: config maps and secrets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata carried by every record in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Revision token; assigned by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new<S1, S2>(namespace: S1, name: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn has_finalizer(&self, tag: &str) -> bool {
        self.finalizers.iter().any(|f| f == tag)
    }

    /// Adds the finalizer unless it's already present; finalizers have set semantics.
    pub fn add_finalizer<S: Into<String>>(&mut self, tag: S) {
        let tag = tag.into();
        if !self.has_finalizer(&tag) {
            self.finalizers.push(tag);
        }
    }

    /// Removes the finalizer, returning whether it was present.
    pub fn remove_finalizer(&mut self, tag: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != tag);
        before != self.finalizers.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A by-name reference to another record in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub name: String,
}

impl ObjectRef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    /// Raw secret bytes; base64 encoded when serialized.
    #[serde(default, with = "base64_map")]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Returns the value under `key` as UTF-8 text, if present and valid.
    pub fn string_value(&self, key: &str) -> Option<String> {
        self.data
            .get(key)
            .and_then(|v| String::from_utf8(v.clone()).ok())
    }
}

/// Serde helper storing byte values as standard base64 text, the way secrets are exchanged.
pub mod base64_map {
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        encode(map).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }

    /// Encodes every value, keeping key order.
    pub fn encode(map: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    base64::engine::general_purpose::STANDARD.encode(v),
                )
            })
            .collect()
    }
}
