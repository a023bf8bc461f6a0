use crate::agent::AgentError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a run. Argument errors never get here: clap exits first.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("agent execution failed: {0}")]
    Agent(#[from] AgentError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}
