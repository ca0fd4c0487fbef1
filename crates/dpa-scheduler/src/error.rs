use dpa_model::Key;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("descriptor '{0}' is already registered")]
    DuplicateDescriptor(String),
    #[error("descriptors '{first}' and '{second}' both select key '{key}'")]
    SelectorOverlap {
        first: String,
        second: String,
        key: Key,
    },
    #[error("descriptor '{descriptor}' declares unknown retrieve dependency '{dependency}'")]
    UnknownRetrieveDependency {
        descriptor: String,
        dependency: String,
    },
    #[error("cycle in retrieve dependencies involving descriptor '{0}'")]
    RetrieveDependencyCycle(String),
    #[error("dependency cycle between keys [{}]", keys.join(", "))]
    DependencyCycle { keys: Vec<String> },
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Validation failure: the value can never be applied as-is. Permanent by
/// definition; the scheduler will not retry it without a new value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value: {reason}")]
pub struct InvalidValueError {
    pub reason: String,
    /// Names of the offending fields, when the descriptor can tell.
    pub invalid_fields: Vec<String>,
}

impl InvalidValueError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            invalid_fields: Vec::new(),
        }
    }

    pub fn with_fields(reason: impl Into<String>, fields: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            reason: reason.into(),
            invalid_fields: fields.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Failure reported by a descriptor's backend operation. Whether it is worth
/// retrying is decided by the descriptor via
/// [`KVDescriptor::is_retriable_failure`](crate::KVDescriptor::is_retriable_failure);
/// `Unsupported` is never retriable.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("operation '{0}' is not implemented by the descriptor")]
    Unsupported(&'static str),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DescriptorError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        DescriptorError::Backend(err.into())
    }

    pub fn message(msg: impl Into<String>) -> Self {
        DescriptorError::Backend(anyhow::anyhow!(msg.into()))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, DescriptorError::Unsupported(_))
    }
}
