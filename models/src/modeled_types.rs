//! Data types that validate their input on construction, so a model field of this type can't
//! hold a value the store would reject.

// The pattern is a struct wrapping a String, with TryFrom<&str> doing the checks; serde goes
// through TryFrom so deserialization validates too.

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Device names must be lowercase DNS-1123 labels of at most 63 characters, received '{}'",
            input
        ))]
        InvalidDeviceName { input: String },
    }
}

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ensure;
use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;

const MAX_NAME_LEN: usize = 63;

lazy_static! {
    static ref DNS_LABEL: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    static ref LABEL_INVALID_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

/// DeviceName is the identity a device registers under: its certificate CN, its record name, and
/// the `{deviceId}` path segment of every request.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DeviceName {
    inner: String,
}

impl TryFrom<&str> for DeviceName {
    type Error = error::Error;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        ensure!(
            input.len() <= MAX_NAME_LEN && DNS_LABEL.is_match(input),
            error::InvalidDeviceNameSnafu { input }
        );
        Ok(DeviceName {
            inner: input.to_string(),
        })
    }
}

impl TryFrom<String> for DeviceName {
    type Error = error::Error;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        Self::try_from(input.as_str())
    }
}

impl Deref for DeviceName {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<DeviceName> for String {
    fn from(name: DeviceName) -> Self {
        name.inner
    }
}

impl Serialize for DeviceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner)
    }
}

impl<'de> Deserialize<'de> for DeviceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let original = String::deserialize(deserializer)?;
        Self::try_from(original.as_str()).map_err(serde::de::Error::custom)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Turns free-form reported text (hostnames, CPU model strings) into a valid label value: runs of
/// disallowed characters become `-`, the result is cut to 63 characters and trimmed so it starts
/// and ends with an alphanumeric.  May return an empty string, which is itself a valid value.
pub fn sanitize_label_value(input: &str) -> String {
    let replaced = LABEL_INVALID_CHARS.replace_all(input.trim(), "-");
    let truncated: String = replaced.chars().take(MAX_NAME_LEN).collect();
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn good_device_names() {
        let longest = "x".repeat(63);
        for ok in ["dev-1", "a", "0abc", longest.as_str()] {
            DeviceName::try_from(ok).unwrap();
        }
    }

    #[test]
    fn bad_device_names() {
        let too_long = "x".repeat(64);
        for err in ["", "Dev-1", "-dev", "dev-", "dev_1", "dev.1", too_long.as_str()] {
            DeviceName::try_from(err).unwrap_err();
        }
    }

    #[test]
    fn device_name_deserialize_validates() {
        assert!(serde_json::from_str::<DeviceName>(r#""dev-1""#).is_ok());
        assert!(serde_json::from_str::<DeviceName>(r#""dev 1""#).is_err());
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(
            sanitize_label_value("Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz"),
            "Intel-R-Core-TM-i7-8650U-CPU-1.90GHz"
        );
        assert_eq!(sanitize_label_value("  host.local  "), "host.local");
        assert_eq!(sanitize_label_value("(x86_64)"), "x86_64");
        assert_eq!(sanitize_label_value("!!!"), "");
        assert_eq!(sanitize_label_value(&"a".repeat(80)).len(), 63);
    }
}
