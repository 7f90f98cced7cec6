use snafu::Snafu;

/// Possible errors from repository operations.
///
/// Callers generally only care which of three classes an error falls in: the record isn't there
/// ([`Error::is_not_found`]), someone else wrote it first ([`Error::is_conflict`]), or the store
/// couldn't be reached.  Conflicts and transient failures are both worth retrying with a fresh
/// read; see [`Error::is_retryable`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{} '{}/{}' not found", kind, namespace, name))]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[snafu(display("{} '{}/{}' already exists", kind, namespace, name))]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[snafu(display(
        "{} '{}/{}' changed underneath us: expected revision {}, found {}",
        kind,
        namespace,
        name,
        expected,
        found
    ))]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        expected: u64,
        found: u64,
    },

    #[snafu(display("Repository unavailable during {}: {}", operation, msg))]
    Transient { operation: String, msg: String },

    #[snafu(display("Unable to compute status patch: {}", source))]
    Patch { source: serde_json::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::AlreadyExists { .. })
    }

    /// Whether re-reading the record and trying again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
