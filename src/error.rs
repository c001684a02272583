//! Error types for metricstore

use std::fmt;

/// Result type alias for metricstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for metricstore
///
/// `Clone` so that a failure observed by one coalesced caller (e.g. a shared
/// entity allocation) can be handed to every waiter.
#[derive(Debug, Clone)]
pub enum Error {
    /// Backing table unreachable or refusing operations
    StorageUnavailable(String),
    /// Messaging topic does not exist
    TopicNotFound(String),
    /// A retention run failed
    SchedulingFailure(Box<Error>),
    /// One or more independently stopped resources failed during shutdown
    ShutdownAggregate {
        primary: Box<Error>,
        suppressed: Vec<Error>,
    },
    /// Payload could not be decoded
    Decode(String),
    /// Metric value violates a data model invariant
    InvalidMetric(String),
    /// Configuration errors
    Config(String),
    /// Serialization errors
    Serialization(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Attach `other` as a secondary failure of `self`.
    ///
    /// The first failure stays the reported one; later failures are kept
    /// alongside it instead of being dropped.
    pub fn with_suppressed(self, other: Error) -> Error {
        match self {
            Error::ShutdownAggregate {
                primary,
                mut suppressed,
            } => {
                suppressed.push(other);
                Error::ShutdownAggregate {
                    primary,
                    suppressed,
                }
            }
            primary => Error::ShutdownAggregate {
                primary: Box::new(primary),
                suppressed: vec![other],
            },
        }
    }

    /// Secondary failures attached to this error
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Error::ShutdownAggregate { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// The failure that is reported first
    pub fn primary(&self) -> &Error {
        match self {
            Error::ShutdownAggregate { primary, .. } => primary.primary(),
            other => other,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SchedulingFailure(e) => Some(e.as_ref()),
            Error::ShutdownAggregate { primary, .. } => Some(primary.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            Error::TopicNotFound(topic) => write!(f, "Topic not found: {}", topic),
            Error::SchedulingFailure(e) => write!(f, "Retention run failed: {}", e),
            Error::ShutdownAggregate {
                primary,
                suppressed,
            } => {
                write!(f, "Shutdown failed: {}", primary)?;
                for e in suppressed {
                    write!(f, "; suppressed: {}", e)?;
                }
                Ok(())
            }
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::InvalidMetric(msg) => write!(f, "Invalid metric: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
