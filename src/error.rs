//! Error types shared by the membership, feed and lease layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The resource mapper was asked for an owner while no member is ready.
    /// Callers must not try to acquire anything in this state.
    #[error("no members available to own resource {resource}")]
    NoMembersAvailable { resource: String },

    #[error("cluster service is shutting down")]
    ShuttingDown,

    #[error("{component} has not been started")]
    NotStarted { component: &'static str },

    #[error("lease store request failed: {message}")]
    Store { message: String },

    #[error("orchestrator watch failed: {message}")]
    Orchestrator { message: String },

    #[error("lease store session {session} expired")]
    SessionExpired { session: i64 },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl ClusterError {
    pub fn store(message: impl Into<String>) -> Self {
        ClusterError::Store {
            message: message.into(),
        }
    }

    pub fn orchestrator(message: impl Into<String>) -> Self {
        ClusterError::Orchestrator {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ClusterError::Config {
            message: message.into(),
        }
    }

    /// Transport failures are worth retrying, everything else is a caller or
    /// lifecycle problem that will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Store { .. }
                | ClusterError::Orchestrator { .. }
                | ClusterError::SessionExpired { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
