//! Error types for queue administration
//!
//! Configuration, allocation and registration failures. The data path
//! never produces these.

use std::io;
use thiserror::Error;

use crate::module::SchedulerError;

/// Errors surfaced by administrative queue operations.
///
/// Hot-path operations (enqueue, run) never fail; overflow is handled by
/// dropping and is not an error.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to allocate ring with {slots} slots: {source}")]
    ResourceExhausted {
        slots: usize,
        #[source]
        source: io::Error,
    },

    #[error("task registration failed: {0}")]
    TaskRegistration(#[from] SchedulerError),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{0}' requires exclusive access to the queue")]
    NeedsExclusiveAccess(&'static str),
}

impl QueueError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        QueueError::Config(msg.into())
    }

    /// True when the queue instance can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::TaskRegistration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = QueueError::config("must be a power of 2");
        assert_eq!(err.to_string(), "invalid configuration: must be a power of 2");
        assert!(!err.is_fatal());

        let err = QueueError::ResourceExhausted {
            slots: 1024,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert!(err.to_string().starts_with("failed to allocate ring with 1024 slots"));

        let err = QueueError::from(SchedulerError::TaskLimit { max: 4 });
        assert!(err.is_fatal());
    }
}
