//! Configuration to agent run to Markdown report on disk.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::agent::{
    Agent, AgentConfig, AgentError, ChromiumComputer, DiskSnapshotStore, LlmReasoner,
    NullMemoryStore, ScopePolicy,
};
use crate::browser::BrowserConfig;
use crate::config::Configuration;
use crate::error::RunError;
use crate::llm::{LlmClient, LlmConfig};

/// Text produced by the agent. Treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult(String);

impl AgentResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can take a task and come back with one answer.
#[async_trait]
pub trait SearchAgent: Send + Sync {
    async fn search(&self, task: &str) -> Result<AgentResult, AgentError>;
}

pub type BrowserAgent = Agent<ChromiumComputer, LlmReasoner, NullMemoryStore, ScopePolicy>;

pub fn parse_configuration() -> Configuration {
    Configuration::parse()
}

/// Build the model client and a Chromium-backed agent for `config`.
pub async fn build_agent(config: &Configuration) -> Result<BrowserAgent, RunError> {
    let llm = LlmConfig::from_env(config.model_id.clone());
    let screenshots = llm.is_computer_use() || config.screenshots_dir.is_some();
    let client = LlmClient::new(llm).map_err(|e| RunError::Config(e.to_string()))?;

    let computer = match &config.chrome_ws_url {
        Some(ws) => ChromiumComputer::connect(ws).await?,
        None => {
            ChromiumComputer::launch(BrowserConfig { headless: config.headless })
                .await?
        }
    }
    .with_screenshots(screenshots);

    let agent_cfg = AgentConfig {
        max_steps: config.max_steps,
        start_url: config.start_url.clone(),
        ..Default::default()
    };
    let mut agent = Agent::with_defaults(computer, LlmReasoner::new(client), agent_cfg);
    if let Some(dir) = &config.screenshots_dir {
        agent = agent.with_snapshot_store(Arc::new(DiskSnapshotStore::new(dir)));
    }
    Ok(agent)
}

/// Construct the agent for `config` and await its single answer.
pub async fn execute_task(config: &Configuration) -> Result<AgentResult, RunError> {
    let agent = build_agent(config).await?;
    execute_with(&agent, config).await
}

pub async fn execute_with<A>(agent: &A, config: &Configuration) -> Result<AgentResult, RunError>
where
    A: SearchAgent + ?Sized,
{
    info!(task = %config.task, model = %config.model_id, "executing task");
    Ok(agent.search(&config.task).await?)
}

pub fn render_report(config: &Configuration, result: &AgentResult) -> String {
    render_report_at(&config.task, result, Local::now())
}

pub fn render_report_at(task: &str, result: &AgentResult, generated_at: DateTime<Local>) -> String {
    format!(
        "# Search Result for: {task}\n\n{result}\n\n---\nGenerated at: {}\n",
        generated_at.format("%Y-%m-%d %H:%M:%S%.6f")
    )
}

/// Create or truncate `path` and write `content` in full. The handle is
/// dropped when this returns, on success or failure.
pub async fn persist(path: &Path, content: &str) -> Result<(), RunError> {
    let io_err = |source| RunError::Io { path: path.to_path_buf(), source };
    let mut file = File::create(path).await.map_err(io_err)?;
    file.write_all(content.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

/// Start, configured, executed, rendered, persisted, done. Any failure ends the run.
pub async fn run(config: &Configuration) -> Result<(), RunError> {
    let result = execute_task(config).await?;
    report(config, &result).await
}

pub async fn run_with<A>(agent: &A, config: &Configuration) -> Result<(), RunError>
where
    A: SearchAgent + ?Sized,
{
    let result = execute_with(agent, config).await?;
    report(config, &result).await
}

async fn report(config: &Configuration, result: &AgentResult) -> Result<(), RunError> {
    println!("[result]: {result}");

    let document = render_report(config, result);
    persist(&config.output_path, &document).await?;
    println!("Browser Search Result Saved to: {}", config.output_path.display());
    Ok(())
}
