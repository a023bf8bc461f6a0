pub mod agent;
pub mod browser;
pub mod config;
pub mod error;
pub mod llm;
pub mod runner;

pub use agent::{Agent, AgentConfig, AgentError, RunReport};
pub use browser::{Browser, BrowserConfig};
pub use config::Configuration;
pub use error::RunError;
pub use llm::{LlmClient, LlmConfig};
pub use runner::{AgentResult, SearchAgent};
