//! Error types for the storage client operator

use thiserror::Error;

use crate::store::ObjectKey;

/// Errors surfaced by a reconciliation pass
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API or transport error that has no more specific mapping
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The object does not exist in the remote store
    #[error("{0} not found")]
    NotFound(ObjectKey),

    /// A create raced with another writer that created the same object
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    /// Update carried a stale resourceVersion
    #[error("conflicting update to {0}: the object has been modified")]
    Conflict(ObjectKey),

    /// A flag in the operator configuration map is not a boolean
    #[error("failed to parse value {value:?} for {key:?} in operator configmap as a boolean")]
    ConfigParseError { key: String, value: String },

    /// The owner reference could not be attached
    #[error("ownership error: {0}")]
    Ownership(String),

    /// A mutate function changed the identity of the object it was given
    #[error("mutate function cannot change the name or namespace of {0}")]
    InvalidMutation(ObjectKey),

    /// No sidecar image set is known for the platform version
    #[error("unsupported platform version: {0:?}")]
    UnsupportedVersion(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Map a kube error for `key` onto the store taxonomy
    pub fn from_kube(err: kube::Error, key: &ObjectKey) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(key.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(key.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(key.clone()),
            other => Error::KubeError(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Whether the next delivery is likely to succeed without operator action
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::AlreadyExists(_) | Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::KubeError(_) => true,
            _ => false,
        }
    }
}
