//! Error types shared by the state, resource and driver layers.

use thiserror::Error;

/// Errors raised by the state access layer and state drivers.
#[derive(Debug, Error)]
pub enum StateError {
    /// No value is stored under the key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The stored bytes do not deserialize to the expected entity.
    #[error("failed to decode value at {key}: {reason}")]
    Decode { key: String, reason: String },

    /// The entity could not be serialized.
    #[error("failed to encode value for {key}: {reason}")]
    Encode { key: String, reason: String },

    /// Entity identifiers must be non-empty and must not contain '/'.
    #[error("invalid key identifier '{0}'")]
    InvalidKey(String),

    /// The key changed between read and write of an atomic update.
    #[error("concurrent modification of {0}")]
    Conflict(String),

    /// A watcher fell behind and the oldest buffered events were dropped.
    #[error("watch on {prefix} lagged, {skipped} events dropped")]
    WatchLagged { prefix: String, skipped: u64 },

    /// The backing store is unreachable (transient).
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The backing store rejected the request (non-retryable).
    #[error("state store error: {0}")]
    StoreFatal(String),
}

impl StateError {
    /// Whether the caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::StoreUnavailable(_)
                | StateError::Conflict(_)
                | StateError::WatchLagged { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

/// Errors raised by resource pools and the resource manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {desc}/{id} is already defined")]
    AlreadyDefined { id: String, desc: String },

    #[error("resource {desc}/{id} is not defined")]
    NotDefined { id: String, desc: String },

    #[error("resource {desc}/{id} still has {allocated} allocated values")]
    ResourceBusy {
        id: String,
        desc: String,
        allocated: usize,
    },

    #[error("resource {desc}/{id} is exhausted")]
    ResourceExhausted { id: String, desc: String },

    #[error("value {value} is not allocated in {desc}/{id}")]
    DoubleFree {
        id: String,
        desc: String,
        value: String,
    },

    #[error("value {value} does not belong to {desc}/{id}")]
    InvalidValue {
        id: String,
        desc: String,
        value: String,
    },

    #[error("invalid resource config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config section '{section}': {reason}")]
    Section { section: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by network and endpoint drivers and by the plugin.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The entity is still referenced and cannot be removed.
    #[error("{0} is still in use")]
    InUse(String),

    /// A dependency of the requested operation is not provisioned yet.
    #[error("{0} is not ready")]
    NotReady(String),

    #[error("switch programming failed: {0}")]
    Switch(String),

    #[error("traffic shaping failed: {0}")]
    Traffic(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::State(e) if e.is_not_found())
    }
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
