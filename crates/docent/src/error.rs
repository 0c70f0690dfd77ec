//! Error taxonomy for the agent core.
//!
//! Collaborators (models, stores, converters, repositories) report failures as
//! `anyhow::Error`; those surface unchanged through [`AgentError::External`].

use thiserror::Error;

/// Why a turn-serving call was refused before touching the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    NotConfigured,
    GraphNotBuilt,
    TurnedOff,
    Restarting,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::NotConfigured => {
                "The agent has not been configured yet. Please call `configure()` first."
            }
            Self::GraphNotBuilt => {
                "The agent graph has not been initialized yet. Please call `build_graph()` first."
            }
            Self::TurnedOff => "The agent is turned off.",
            Self::Restarting => "The agent is restarting.",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// A required collaborator is missing or its settings are invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    NotReady(NotReadyReason),

    /// The turn executed more nodes than the run allows.
    #[error("recursion limit of {0} node executions reached without a final answer")]
    RecursionLimit(usize),

    /// Model, store, converter or repository failure. Never retried here.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl AgentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_messages_are_distinct() {
        let reasons = [
            NotReadyReason::NotConfigured,
            NotReadyReason::GraphNotBuilt,
            NotReadyReason::TurnedOff,
            NotReadyReason::Restarting,
        ];
        let messages: std::collections::HashSet<String> = reasons
            .iter()
            .map(|r| AgentError::NotReady(*r).to_string())
            .collect();
        assert_eq!(messages.len(), 4);
        assert_eq!(
            AgentError::NotReady(NotReadyReason::Restarting).to_string(),
            "The agent is restarting."
        );
    }

    #[test]
    fn test_external_error_is_transparent() {
        let err: AgentError = anyhow::anyhow!("vector store unreachable").into();
        assert_eq!(err.to_string(), "vector store unreachable");
        assert!(!err.is_not_ready());
    }
}
