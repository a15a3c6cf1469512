//! Error types for the rollup engine

use thiserror::Error;

/// Main error type for the rollup engine
#[derive(Error, Debug)]
pub enum Error {
    /// Bad tier chain, unknown metric or tier, invalid settings.
    ///
    /// Fatal at startup and never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Raw store or a lower tier could not be read
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Query or refresh range is empty, inverted, or outside retained history
    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    /// Aggregate store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A refresh plan stopped part way through
    ///
    /// Steps before `completed_steps` are committed; the failing step and
    /// everything after it left their watermarks untouched.
    #[error("Refresh failed after {completed_steps} completed step(s): {source}")]
    RefreshFailed {
        /// Number of plan steps that were committed before the failure
        completed_steps: usize,
        /// The error that stopped the plan
        #[source]
        source: Box<Error>,
    },

    /// A refresh plan was cancelled between steps
    #[error("Refresh cancelled after {completed_steps} completed step(s)")]
    Cancelled {
        /// Number of plan steps that were committed before cancellation
        completed_steps: usize,
    },

    /// A refresh task died before reporting a result
    #[error("Refresh task failed: {0}")]
    TaskFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SourceUnavailable(_) => true,
            Error::Store(e) => e.is_retryable(),
            Error::RefreshFailed { source, .. } => source.is_retryable(),
            Error::Cancelled { .. } | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is a configuration problem (unknown metric, bad chain)
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Configuration(_) => true,
            Error::RefreshFailed { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// Process exit code used by the command-line tool
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 3,
            Error::Range(_) => 5,
            Error::RefreshFailed { source, .. } => source.exit_code(),
            _ if self.is_retryable() => 4,
            _ => 1,
        }
    }
}

/// Aggregate and raw store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be decoded
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Data could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key component cannot be mapped to a storage location
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Whether the failure is transient
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Range validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// Start equals end
    #[error("Empty time range at {0}")]
    Empty(i64),

    /// Start is after end
    #[error("Invalid time range: start {start} > end {end}")]
    Inverted {
        /// Start timestamp
        start: i64,
        /// End timestamp
        end: i64,
    },

    /// Range does not intersect the retained raw history of the entity
    #[error("Range [{start}, {end}) is outside retained history for {metric}/{entity}")]
    OutsideHistory {
        /// Metric name
        metric: String,
        /// Entity identifier
        entity: String,
        /// Start timestamp
        start: i64,
        /// End timestamp
        end: i64,
    },

    /// A forced range neither overlaps nor adjoins the materialized window
    #[error(
        "Forced range [{start}, {end}) for tier {tier} is disjoint from its materialized window"
    )]
    DisjointForce {
        /// Tier identifier
        tier: String,
        /// Start timestamp
        start: i64,
        /// End timestamp
        end: i64,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
