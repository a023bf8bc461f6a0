use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use crate::browser::{index_selector, Browser, BrowserConfig};
use crate::llm::{ComputerAction, LlmClient, LlmOutput, ResponseId, ToolOutput, TurnInput};
use crate::runner::{AgentResult, SearchAgent};
use serde_json::Value;
use tokio::sync::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

// ========================= Core Types =========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { target: Locator },
    Type { text: String, into: Locator, submit: bool },
    Key { combo: String },
    Hover { target: Locator },
    Scroll { dx: i32, dy: i32 },
    NavGoto { url: String },
    Back,
    Wait { ms: u64 },
    Done { answer: String },
}

impl Action {
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Action::NavGoto { .. } | Action::Back => Some(Scope::BrowserNavigate),
            Action::Click { .. }
            | Action::Type { .. }
            | Action::Key { .. }
            | Action::Hover { .. }
            | Action::Scroll { .. } => Some(Scope::Input),
            Action::Wait { .. } | Action::Done { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    Index { index: usize },
    Coordinates { x: i32, y: i32 },
    Focused,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub image_base64: Option<String>,
    pub dom_summary: Option<String>,
    pub captured_at_ms: u128,
}

impl Snapshot {
    /// Text rendition of the page handed to the model after each step.
    pub fn observation(&self, error: Option<&str>) -> String {
        let mut s = format!("url: {}\n", self.url.as_deref().unwrap_or("about:blank"));
        if let Some(title) = &self.title {
            s.push_str(&format!("title: {title}\n"));
        }
        if let Some(err) = error {
            s.push_str(&format!("last action failed: {err}\n"));
        }
        if let Some(dom) = &self.dom_summary {
            s.push_str(dom);
        }
        s
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub snapshot: Snapshot,
    pub changed: bool,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Goal {
    pub task: String,
    pub start_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thought {
    pub plan: String,
    pub action: Option<Action>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Scope {
    BrowserNavigate,
    Input,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    pub granted: bool,
    pub scope: Option<Scope>,
    pub reason: Option<String>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("computer error: {0}")]
    Computer(String),
    #[error("reasoner error: {0}")]
    Reasoner(String),
    #[error("policy denied: {0:?}")]
    Denied(Scope),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("memory error: {0}")]
    Memory(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RunStatus {
    Success,
    Timeout,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RunMetrics {
    pub steps: usize,
    pub time_ms: u128,
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StepLog {
    pub step: usize,
    pub plan: String,
    pub action: Option<Action>,
    pub approval: Option<Approval>,
    pub result_hint: String,
    pub snapshot_id: Option<String>,
    pub error: Option<String>,
    pub timestamp_ms: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub goal: Goal,
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub steps: Vec<StepLog>,
    pub answer: Option<String>,
    pub last_snapshot: Option<Snapshot>,
    pub error: Option<String>,
}

impl RunReport {
    /// The answer if the run produced one, otherwise the reason it stopped.
    pub fn final_result(&self) -> String {
        match (&self.answer, &self.error) {
            (Some(answer), _) => answer.clone(),
            (None, Some(err)) => err.clone(),
            (None, None) => format!("{:?}", self.status),
        }
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Computer: Send + Sync {
    async fn open_url(&self, url: &str) -> Result<Snapshot, AgentError>;
    async fn snapshot(&self) -> Result<Snapshot, AgentError>;
    async fn act(&self, action: &Action, timeout: Duration) -> Result<ActionResult, AgentError>;
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn think(
        &self,
        goal: &Goal,
        snapshot: &Snapshot,
        last_error: Option<&AgentError>,
    ) -> Result<Thought, AgentError>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn write_run_start(&self, run_id: &str, goal: &Goal) -> Result<(), AgentError>;
    async fn write_step(&self, run_id: &str, step: &StepLog) -> Result<(), AgentError>;
    async fn write_run_end(&self, run_id: &str, report: &RunReport) -> Result<(), AgentError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, run_id: &str, step: Option<usize>, snapshot: &Snapshot) -> Result<(), AgentError>;
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn approve(&self, scopes: &[Scope], action: &Action) -> Result<Approval, AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub step_timeout: Duration,
    pub scopes: Vec<Scope>,
    pub start_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            step_timeout: Duration::from_secs(30),
            scopes: vec![Scope::BrowserNavigate, Scope::Input],
            start_url: None,
        }
    }
}

pub struct Agent<C, R, M, P>
where
    C: Computer,
    R: Reasoner,
    M: MemoryStore,
    P: PolicyEngine,
{
    computer: C,
    reasoner: R,
    memory: M,
    policy: P,
    cfg: AgentConfig,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl<C, R, M, P> Agent<C, R, M, P>
where
    C: Computer,
    R: Reasoner,
    M: MemoryStore,
    P: PolicyEngine,
{
    pub fn new(computer: C, reasoner: R, memory: M, policy: P, cfg: AgentConfig) -> Self {
        Self {
            computer,
            reasoner,
            memory,
            policy,
            cfg,
            snapshot_store: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub async fn run(&self, task: &str, start_url: Option<&str>) -> Result<RunReport, AgentError> {
        let goal = Goal {
            task: task.to_string(),
            start_url: start_url.map(str::to_string),
        };
        self.run_goal(goal).await
    }

    pub async fn run_goal(&self, goal: Goal) -> Result<RunReport, AgentError> {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut steps: Vec<StepLog> = Vec::new();
        let mut last_error: Option<AgentError> = None;

        self.memory.write_run_start(&run_id, &goal).await?;
        info!(run_id = %run_id, task = %goal.task, "run started");

        let mut last_snapshot = match goal.start_url.as_deref() {
            Some(url) => self.computer.open_url(url).await?,
            None => self.computer.snapshot().await?,
        };
        self.store_snapshot(&run_id, None, &last_snapshot).await;

        for i in 0..self.cfg.max_steps {
            let thought = self
                .reasoner
                .think(&goal, &last_snapshot, last_error.as_ref())
                .await?;
            let maybe_action = thought.action.clone();
            let mut step_log = StepLog {
                step: i,
                plan: thought.plan.clone(),
                action: maybe_action.clone(),
                approval: None,
                result_hint: String::new(),
                snapshot_id: None,
                error: None,
                timestamp_ms: start.elapsed().as_millis(),
            };
            info!(step = i, plan = %thought.plan, has_action = %maybe_action.is_some(), "agent step");

            if let Some(Action::Done { answer }) = &maybe_action {
                step_log.result_hint = "done".into();
                self.memory.write_step(&run_id, &step_log).await?;
                steps.push(step_log);
                let answer = answer.clone();
                return self
                    .finish(run_id, goal, steps, start, last_snapshot, RunStatus::Success, Some(answer), None)
                    .await;
            }

            if maybe_action.is_none() && !thought.plan.trim().is_empty() {
                info!(step = i, "agent message: {}", thought.plan.trim());
                step_log.result_hint = "message".into();
                self.memory.write_step(&run_id, &step_log).await?;
                steps.push(step_log);
                continue;
            }

            if let Some(action) = &maybe_action {
                let approval = self.policy.approve(&self.cfg.scopes, action).await?;
                step_log.approval = Some(approval.clone());
                if !approval.granted {
                    last_error = Some(AgentError::Denied(
                        approval.scope.unwrap_or(Scope::BrowserNavigate),
                    ));
                    step_log.result_hint = "denied".into();
                    self.memory.write_step(&run_id, &step_log).await?;
                    steps.push(step_log);
                    info!(step = i, "action denied by policy");
                    continue;
                }
                info!(step = i, action = ?action, "action approved");
            }

            let result = match maybe_action {
                Some(action) => self.computer.act(&action, self.cfg.step_timeout).await,
                None => self.computer.snapshot().await.map(|snapshot| ActionResult {
                    snapshot,
                    changed: false,
                    message: Some("observe".to_string()),
                }),
            };

            match result {
                Ok(out) => {
                    last_snapshot = out.snapshot;
                    self.store_snapshot(&run_id, Some(i), &last_snapshot).await;
                    step_log.result_hint = if out.changed {
                        "changed".into()
                    } else {
                        "unchanged".into()
                    };
                    step_log.snapshot_id = Some(last_snapshot.id.clone());
                    last_error = None;
                    self.memory.write_step(&run_id, &step_log).await?;
                    steps.push(step_log);
                    info!(step = i, changed = out.changed, url = ?last_snapshot.url, "action result");
                }
                Err(err) => {
                    warn!("step {} failed: {}", i, err);
                    step_log.error = Some(err.to_string());
                    step_log.result_hint = "error".into();
                    self.memory.write_step(&run_id, &step_log).await?;
                    steps.push(step_log);
                    last_error = Some(err);
                }
            }
        }

        let err = match last_error {
            Some(e) => format!("Step budget exceeded; last error: {e}"),
            None => "Step budget exceeded".to_string(),
        };
        self.finish(run_id, goal, steps, start, last_snapshot, RunStatus::Timeout, None, Some(err))
            .await
    }

    async fn store_snapshot(&self, run_id: &str, step: Option<usize>, snapshot: &Snapshot) {
        if let Some(store) = &self.snapshot_store {
            if let Err(e) = store.save(run_id, step, snapshot).await {
                warn!("snapshot not saved: {}", e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run_id: String,
        goal: Goal,
        steps: Vec<StepLog>,
        start: Instant,
        last_snapshot: Snapshot,
        status: RunStatus,
        answer: Option<String>,
        error: Option<String>,
    ) -> Result<RunReport, AgentError> {
        let metrics = RunMetrics {
            steps: steps.len(),
            time_ms: start.elapsed().as_millis(),
            success: status == RunStatus::Success,
        };
        let report = RunReport {
            run_id: run_id.clone(),
            goal,
            status,
            metrics,
            steps,
            answer,
            last_snapshot: Some(last_snapshot),
            error,
        };
        self.memory.write_run_end(&run_id, &report).await?;
        info!(run_id = %run_id, status = ?report.status, steps = report.metrics.steps, "run finished");
        Ok(report)
    }
}

#[async_trait]
impl<C, R, M, P> SearchAgent for Agent<C, R, M, P>
where
    C: Computer,
    R: Reasoner,
    M: MemoryStore,
    P: PolicyEngine,
{
    async fn search(&self, task: &str) -> Result<AgentResult, AgentError> {
        let report = self.run(task, self.cfg.start_url.as_deref()).await?;
        Ok(AgentResult::new(report.final_result()))
    }
}

// ========================= Defaults & Helpers =========================

pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn write_run_start(&self, _run_id: &str, _goal: &Goal) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_step(&self, _run_id: &str, _step: &StepLog) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_run_end(&self, _run_id: &str, _report: &RunReport) -> Result<(), AgentError> {
        Ok(())
    }
}

pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(&self, run_id: &str, step: Option<usize>, snapshot: &Snapshot) -> Result<(), AgentError> {
        let Some(b64) = &snapshot.image_base64 else {
            return Ok(());
        };
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Memory(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(b64)
            .map_err(|e| AgentError::Memory(format!("b64 decode: {}", e)))?;
        let name = match step {
            Some(s) => format!("step_{:03}.png", s),
            None => "start.png".to_string(),
        };
        async_fs::write(dir.join(name), &png)
            .await
            .map_err(|e| AgentError::Memory(format!("write: {}", e)))?;
        Ok(())
    }
}

/// Grants every action whose scope is listed in the agent's configured scopes.
#[derive(Clone, Copy)]
pub struct ScopePolicy;

#[async_trait]
impl PolicyEngine for ScopePolicy {
    async fn approve(&self, scopes: &[Scope], action: &Action) -> Result<Approval, AgentError> {
        match action.scope() {
            Some(scope) if !scopes.contains(&scope) => Ok(Approval {
                granted: false,
                scope: Some(scope),
                reason: Some(format!("{scope:?} not granted")),
            }),
            scope => Ok(Approval { granted: true, scope, reason: None }),
        }
    }
}

impl<C: Computer, R: Reasoner> Agent<C, R, NullMemoryStore, ScopePolicy> {
    pub fn with_defaults(computer: C, reasoner: R, cfg: AgentConfig) -> Self {
        Self::new(computer, reasoner, NullMemoryStore, ScopePolicy, cfg)
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

// ========================= Chromium Adapter =========================

pub struct ChromiumComputer {
    browser: Browser,
    screenshots: bool,
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, AgentError> {
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| AgentError::Computer(e.to_string()))?;
        Ok(Self { browser, screenshots: false })
    }

    pub async fn connect(ws_url: &str) -> Result<Self, AgentError> {
        let browser = Browser::connect(ws_url)
            .await
            .map_err(|e| AgentError::Computer(e.to_string()))?;
        Ok(Self { browser, screenshots: false })
    }

    /// Attach a screenshot to every snapshot.
    pub fn with_screenshots(mut self, enabled: bool) -> Self {
        self.screenshots = enabled;
        self
    }

    /// Resolve a locator to a CSS selector. Coordinate locators are clicked
    /// in place instead and yield no selector.
    async fn selector_for(&self, locator: &Locator) -> Result<Option<String>, AgentError> {
        match locator {
            Locator::Css { selector } => Ok(Some(selector.clone())),
            Locator::Index { index } => Ok(Some(index_selector(*index))),
            Locator::Coordinates { x, y } => {
                self.browser
                    .click(*x as i64, *y as i64, "left")
                    .await
                    .map_err(|e| AgentError::Computer(e.to_string()))?;
                Ok(None)
            }
            Locator::Focused => Ok(None),
        }
    }

    async fn perform(&self, action: &Action) -> Result<(), AgentError> {
        let err = |e: anyhow::Error| AgentError::Computer(e.to_string());
        match action {
            Action::NavGoto { url } => self.browser.goto(url).await.map_err(err)?,
            Action::Back => self.browser.back().await.map_err(err)?,
            Action::Click { target } => {
                if let Some(sel) = self.selector_for(target).await? {
                    self.browser.click_selector(&sel).await.map_err(err)?;
                }
            }
            Action::Hover { target } => match target {
                Locator::Coordinates { x, y } => {
                    self.browser.move_mouse(*x as i64, *y as i64).await.map_err(err)?
                }
                _ => return Err(AgentError::Computer("hover needs coordinates".into())),
            },
            Action::Scroll { dx, dy } => {
                self.browser.scroll(*dx as i64, *dy as i64).await.map_err(err)?
            }
            Action::Key { combo } => self.browser.keypress(combo).await.map_err(err)?,
            Action::Type { text, into, submit } => {
                if let Some(sel) = self.selector_for(into).await? {
                    self.browser.focus_selector(&sel).await.map_err(err)?;
                }
                self.browser.type_text(text).await.map_err(err)?;
                if *submit {
                    self.browser.keypress("Enter").await.map_err(err)?;
                }
            }
            Action::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Action::Done { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Computer for ChromiumComputer {
    async fn open_url(&self, url: &str) -> Result<Snapshot, AgentError> {
        self.browser
            .goto(url)
            .await
            .map_err(|e| AgentError::Computer(e.to_string()))?;
        self.snapshot().await
    }

    async fn snapshot(&self) -> Result<Snapshot, AgentError> {
        let err = |e: anyhow::Error| AgentError::Computer(e.to_string());
        // Keep links in this tab so the agent does not lose the page
        if let Err(e) = self.browser.enable_single_tab_mode().await {
            warn!("single-tab mode not applied: {}", e);
        }
        self.browser.wait_for_stable().await.map_err(err)?;
        let url = self.browser.url().await.map_err(err)?;
        let title = self.browser.title().await.map_err(err)?;
        let dom_summary = match self.browser.page_summary().await {
            Ok(summary) => Some(summary.render()),
            Err(e) => {
                warn!("page summary unavailable: {}", e);
                None
            }
        };
        let image_base64 = if self.screenshots {
            Some(self.browser.screenshot_b64().await.map_err(err)?)
        } else {
            None
        };
        Ok(Snapshot {
            id: nanoid!(),
            url: Some(url),
            title,
            image_base64,
            dom_summary,
            captured_at_ms: now_ms(),
        })
    }

    async fn act(&self, action: &Action, timeout: Duration) -> Result<ActionResult, AgentError> {
        tokio::time::timeout(timeout, self.perform(action))
            .await
            .map_err(|_| AgentError::Timeout(format!("{action:?} exceeded {timeout:?}")))??;
        Ok(ActionResult {
            snapshot: self.snapshot().await?,
            changed: true,
            message: None,
        })
    }
}

// ========================= LLM-backed Reasoner =========================

const INSTRUCTIONS: &str = "You control a web browser to complete the user's goal. \
Each observation lists the interactive elements of the current page by index, followed by the page text. \
Use the browser tools one at a time. When the goal is complete, call done with a complete answer \
written for the user; do not ask for confirmation.";

#[derive(Debug)]
enum PendingCall {
    Function { call_id: String },
    Computer { call_id: String, safety_checks: Vec<Value> },
}

#[derive(Default)]
struct ReasonerState {
    previous: Option<ResponseId>,
    pending: Option<PendingCall>,
    rejected: Option<String>,
}

#[derive(Clone)]
pub struct LlmReasoner {
    client: LlmClient,
    instructions: String,
    state: Arc<Mutex<ReasonerState>>,
}

impl LlmReasoner {
    pub fn new(client: LlmClient) -> Self {
        Self::with_instructions(client, INSTRUCTIONS)
    }

    pub fn with_instructions(client: LlmClient, instructions: impl Into<String>) -> Self {
        Self {
            client,
            instructions: instructions.into(),
            state: Arc::new(Mutex::new(ReasonerState::default())),
        }
    }

    fn compose_instructions(base: &str, goal: &Goal) -> String {
        let mut s = String::new();
        if !base.trim().is_empty() {
            s.push_str(base);
            s.push_str("\n\n");
        }
        s.push_str("Goal: ");
        s.push_str(&goal.task);
        s
    }

    fn interpret(&self, st: &mut ReasonerState, out: LlmOutput) -> Thought {
        match out {
            LlmOutput::Message { text, response_id } => {
                st.previous = Some(response_id);
                st.pending = None;
                Thought { plan: "answer".into(), action: Some(Action::Done { answer: text }) }
            }
            LlmOutput::FunctionCall { call_id, name, arguments, response_id } => {
                st.previous = Some(response_id);
                st.pending = Some(PendingCall::Function { call_id });
                let decoded = arguments
                    .map_err(AgentError::Reasoner)
                    .and_then(|args| decode_function_call(&name, &args));
                match decoded {
                    Ok(action) => Thought { plan: name, action: Some(action) },
                    Err(e) => {
                        st.rejected = Some(e.to_string());
                        Thought { plan: format!("rejected {name}: {e}"), action: None }
                    }
                }
            }
            LlmOutput::ComputerCall { call_id, action, response_id, safety_checks } => {
                st.previous = Some(response_id);
                st.pending = Some(PendingCall::Computer { call_id, safety_checks });
                Thought { plan: String::new(), action: map_computer_action(action) }
            }
            LlmOutput::Done { response_id } => {
                st.previous = Some(response_id);
                st.pending = None;
                Thought {
                    plan: "done".into(),
                    action: Some(Action::Done {
                        answer: "The agent finished without a final message.".into(),
                    }),
                }
            }
        }
    }
}

/// Translate a browser function call into an agent action.
pub fn decode_function_call(name: &str, args: &Value) -> Result<Action, AgentError> {
    let str_arg = |k: &str| {
        args.get(k)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::Reasoner(format!("{name}: missing {k}")))
    };
    let index = || {
        args.get("index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize)
            .ok_or_else(|| AgentError::Reasoner(format!("{name}: missing index")))
    };
    let action = match name {
        "navigate" => Action::NavGoto { url: str_arg("url")? },
        "click" => Action::Click { target: Locator::Index { index: index()? } },
        "type_text" => Action::Type {
            text: str_arg("text")?,
            into: Locator::Index { index: index()? },
            submit: args.get("submit").and_then(|v| v.as_bool()).unwrap_or(false),
        },
        "press_key" => Action::Key { combo: str_arg("key")? },
        "scroll" => {
            let amount = args.get("amount").and_then(|v| v.as_i64()).unwrap_or(600) as i32;
            let dy = match args.get("direction").and_then(|v| v.as_str()) {
                Some("up") => -amount,
                _ => amount,
            };
            Action::Scroll { dx: 0, dy }
        }
        "go_back" => Action::Back,
        "wait" => Action::Wait {
            ms: args.get("seconds").and_then(|v| v.as_u64()).unwrap_or(1).min(30) * 1000,
        },
        "done" => Action::Done { answer: str_arg("answer")? },
        other => return Err(AgentError::Reasoner(format!("unknown tool {other}"))),
    };
    Ok(action)
}

fn map_computer_action(action: ComputerAction) -> Option<Action> {
    let at = |x: i64, y: i64| Locator::Coordinates { x: x as i32, y: y as i32 };
    match action {
        ComputerAction::Click { x, y, .. } | ComputerAction::DoubleClick { x, y } => {
            Some(Action::Click { target: at(x, y) })
        }
        ComputerAction::Move { x, y } => Some(Action::Hover { target: at(x, y) }),
        ComputerAction::Scroll { dx, dy } => Some(Action::Scroll { dx: dx as i32, dy: dy as i32 }),
        ComputerAction::Type { text } => Some(Action::Type { text, into: Locator::Focused, submit: false }),
        ComputerAction::Keypress { key } => Some(Action::Key { combo: key }),
        ComputerAction::WaitMs { ms } => Some(Action::Wait { ms: ms.max(0) as u64 }),
        ComputerAction::Screenshot | ComputerAction::Unknown(_) => None,
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn think(
        &self,
        goal: &Goal,
        snapshot: &Snapshot,
        last_error: Option<&AgentError>,
    ) -> Result<Thought, AgentError> {
        let mut st = self.state.lock().await;
        let error = last_error
            .map(|e| e.to_string())
            .or_else(|| st.rejected.take());

        let out = match st.pending.take() {
            Some(PendingCall::Function { call_id }) => {
                let output = ToolOutput::Text(snapshot.observation(error.as_deref()));
                self.client.send_tool_output(&call_id, output, st.previous.as_ref()).await
            }
            Some(PendingCall::Computer { call_id, safety_checks }) => {
                let data_base64 = snapshot
                    .image_base64
                    .clone()
                    .ok_or_else(|| AgentError::Reasoner("missing snapshot image".into()))?;
                let output = ToolOutput::Screenshot { data_base64, safety_checks };
                self.client.send_tool_output(&call_id, output, st.previous.as_ref()).await
            }
            None => {
                let input = TurnInput {
                    instructions: Self::compose_instructions(&self.instructions, goal),
                    observation: snapshot.observation(error.as_deref()),
                };
                self.client.turn(input, st.previous.as_ref()).await
            }
        }
        .map_err(|e| AgentError::Reasoner(e.to_string()))?;

        Ok(self.interpret(&mut st, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn snap(url: &str) -> Snapshot {
        Snapshot {
            id: nanoid!(),
            url: Some(url.to_string()),
            title: None,
            image_base64: None,
            dom_summary: Some("interactive elements:\n(none)\n".into()),
            captured_at_ms: 0,
        }
    }

    struct FakeComputer {
        acted: AtomicUsize,
        fail_clicks: bool,
    }

    impl FakeComputer {
        fn new() -> Self {
            Self { acted: AtomicUsize::new(0), fail_clicks: false }
        }
    }

    #[async_trait]
    impl Computer for FakeComputer {
        async fn open_url(&self, url: &str) -> Result<Snapshot, AgentError> {
            Ok(snap(url))
        }

        async fn snapshot(&self) -> Result<Snapshot, AgentError> {
            Ok(snap("about:blank"))
        }

        async fn act(&self, action: &Action, _timeout: Duration) -> Result<ActionResult, AgentError> {
            self.acted.fetch_add(1, Ordering::SeqCst);
            if self.fail_clicks && matches!(action, Action::Click { .. }) {
                return Err(AgentError::Computer("no element matches".into()));
            }
            let url = match action {
                Action::NavGoto { url } => url.clone(),
                _ => "https://news.example".to_string(),
            };
            Ok(ActionResult { snapshot: snap(&url), changed: true, message: None })
        }
    }

    /// Replays scripted thoughts and records the errors it was shown.
    struct Scripted {
        thoughts: std::sync::Mutex<VecDeque<Thought>>,
        seen_errors: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn new(actions: Vec<Option<Action>>) -> Self {
            let thoughts = actions
                .into_iter()
                .map(|action| Thought { plan: String::new(), action })
                .collect();
            Self { thoughts: std::sync::Mutex::new(thoughts), seen_errors: Default::default() }
        }
    }

    #[async_trait]
    impl Reasoner for Scripted {
        async fn think(
            &self,
            _goal: &Goal,
            _snapshot: &Snapshot,
            last_error: Option<&AgentError>,
        ) -> Result<Thought, AgentError> {
            self.seen_errors.lock().unwrap().push(last_error.map(|e| e.to_string()));
            self.thoughts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Reasoner("script exhausted".into()))
        }
    }

    fn cfg(max_steps: usize) -> AgentConfig {
        AgentConfig { max_steps, ..Default::default() }
    }

    #[tokio::test]
    async fn done_action_ends_run_with_answer() {
        let reasoner = Scripted::new(vec![
            Some(Action::NavGoto { url: "https://news.google.com".into() }),
            Some(Action::Done { answer: "Headlines: A, B".into() }),
        ]);
        let agent = Agent::with_defaults(FakeComputer::new(), reasoner, cfg(10));
        let report = agent.run("get news", None).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert!(report.metrics.success);
        assert_eq!(report.metrics.steps, 2);
        assert_eq!(report.final_result(), "Headlines: A, B");
        assert_eq!(
            report.last_snapshot.unwrap().url.as_deref(),
            Some("https://news.google.com")
        );
    }

    #[tokio::test]
    async fn step_budget_exhaustion_is_a_report_not_an_error() {
        let reasoner = Scripted::new(vec![
            Some(Action::Scroll { dx: 0, dy: 600 }),
            Some(Action::Scroll { dx: 0, dy: 600 }),
        ]);
        let agent = Agent::with_defaults(FakeComputer::new(), reasoner, cfg(2));
        let report = agent.run("scroll forever", Some("https://example.com")).await.unwrap();
        assert_eq!(report.status, RunStatus::Timeout);
        assert!(report.answer.is_none());
        assert_eq!(report.final_result(), "Step budget exceeded");
    }

    #[tokio::test]
    async fn failed_action_is_fed_back_to_reasoner() {
        let reasoner = Scripted::new(vec![
            Some(Action::Click { target: Locator::Index { index: 9 } }),
            Some(Action::Done { answer: "ok".into() }),
        ]);
        let computer = FakeComputer { acted: AtomicUsize::new(0), fail_clicks: true };
        let agent = Agent::with_defaults(computer, reasoner, cfg(5));
        let report = agent.run("click", None).await.unwrap();
        assert_eq!(report.steps[0].result_hint, "error");
        let seen = agent.reasoner.seen_errors.lock().unwrap().clone();
        assert_eq!(seen[0], None);
        assert!(seen[1].as_deref().unwrap().contains("no element matches"));
    }

    #[tokio::test]
    async fn ungranted_scope_is_denied_without_acting() {
        let reasoner = Scripted::new(vec![
            Some(Action::NavGoto { url: "https://example.com".into() }),
            Some(Action::Done { answer: "stopped".into() }),
        ]);
        let config = AgentConfig { scopes: vec![Scope::Input], ..cfg(5) };
        let agent = Agent::with_defaults(FakeComputer::new(), reasoner, config);
        let report = agent.run("navigate", None).await.unwrap();
        assert_eq!(report.steps[0].result_hint, "denied");
        assert_eq!(agent.computer.acted.load(Ordering::SeqCst), 0);
        let seen = agent.reasoner.seen_errors.lock().unwrap().clone();
        assert!(seen[1].as_deref().unwrap().contains("BrowserNavigate"));
    }

    #[tokio::test]
    async fn reasoner_failure_propagates() {
        let agent = Agent::with_defaults(FakeComputer::new(), Scripted::new(vec![]), cfg(3));
        let err = agent.run("anything", None).await.unwrap_err();
        assert!(matches!(err, AgentError::Reasoner(_)));
    }

    #[tokio::test]
    async fn search_uses_configured_start_url() {
        let reasoner = Scripted::new(vec![Some(Action::Done { answer: "found".into() })]);
        let config = AgentConfig { start_url: Some("https://news.google.com".into()), ..cfg(3) };
        let agent = Agent::with_defaults(FakeComputer::new(), reasoner, config);
        let result = agent.search("news").await.unwrap();
        assert_eq!(result.as_str(), "found");
    }

    #[tokio::test]
    async fn disk_store_writes_png_per_step() {
        let dir = TempDir::new().unwrap();
        let store = DiskSnapshotStore::new(dir.path());
        let mut s = snap("about:blank");
        s.image_base64 = Some(B64.encode(b"\x89PNG"));
        store.save("run1", None, &s).await.unwrap();
        store.save("run1", Some(3), &s).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("run1/start.png")).unwrap(), b"\x89PNG");
        assert!(dir.path().join("run1/step_003.png").exists());

        s.image_base64 = None;
        store.save("run2", Some(0), &s).await.unwrap();
        assert!(!dir.path().join("run2").exists());
    }

    #[test]
    fn function_calls_decode_to_actions() {
        assert_eq!(
            decode_function_call("click", &json!({ "index": 4 })).unwrap(),
            Action::Click { target: Locator::Index { index: 4 } }
        );
        assert_eq!(
            decode_function_call("type_text", &json!({ "index": 1, "text": "weather", "submit": true })).unwrap(),
            Action::Type { text: "weather".into(), into: Locator::Index { index: 1 }, submit: true }
        );
        assert_eq!(
            decode_function_call("scroll", &json!({ "direction": "up", "amount": 300 })).unwrap(),
            Action::Scroll { dx: 0, dy: -300 }
        );
        assert_eq!(
            decode_function_call("wait", &json!({ "seconds": 120 })).unwrap(),
            Action::Wait { ms: 30_000 }
        );
        assert!(decode_function_call("click", &json!({})).is_err());
        assert!(decode_function_call("teleport", &json!({})).is_err());
    }

    #[test]
    fn computer_actions_map_to_coordinates() {
        assert_eq!(
            map_computer_action(ComputerAction::DoubleClick { x: 5, y: 6 }),
            Some(Action::Click { target: Locator::Coordinates { x: 5, y: 6 } })
        );
        assert_eq!(map_computer_action(ComputerAction::Screenshot), None);
    }

    #[test]
    fn observation_includes_error_and_summary() {
        let mut s = snap("https://news.google.com");
        s.title = Some("Google News".into());
        let text = s.observation(Some("timeout"));
        assert!(text.starts_with("url: https://news.google.com\ntitle: Google News\n"));
        assert!(text.contains("last action failed: timeout\n"));
        assert!(text.ends_with("(none)\n"));
    }

    #[test]
    fn instructions_end_with_goal() {
        let goal = Goal { task: "find weather".into(), start_url: None };
        let s = LlmReasoner::compose_instructions(INSTRUCTIONS, &goal);
        assert!(s.ends_with("\n\nGoal: find weather"));
        assert_eq!(LlmReasoner::compose_instructions("  ", &goal), "Goal: find weather");
    }

    #[tokio::test]
    async fn model_output_drives_reasoner_state() {
        let client = LlmClient::new(crate::llm::LlmConfig::new("http://localhost:1/v1", "sk", "gpt-4o")).unwrap();
        let reasoner = LlmReasoner::new(client);
        let mut st = reasoner.state.lock().await;

        let t = reasoner.interpret(&mut st, LlmOutput::FunctionCall {
            call_id: "c1".into(),
            name: "bogus".into(),
            arguments: Ok(json!({})),
            response_id: ResponseId("r1".into()),
        });
        assert!(t.action.is_none());
        assert!(st.rejected.is_some());
        assert!(matches!(st.pending, Some(PendingCall::Function { .. })));

        st.rejected = None;
        let t = reasoner.interpret(&mut st, LlmOutput::FunctionCall {
            call_id: "c2".into(),
            name: "click".into(),
            arguments: Err("invalid arguments for click: key must be a string".into()),
            response_id: ResponseId("r1b".into()),
        });
        assert!(t.action.is_none());
        assert!(t.plan.starts_with("rejected click"));
        assert!(st.rejected.as_deref().unwrap().contains("invalid arguments for click"));
        assert!(matches!(&st.pending, Some(PendingCall::Function { call_id }) if call_id == "c2"));

        let t = reasoner.interpret(&mut st, LlmOutput::Message {
            text: "Top stories".into(),
            response_id: ResponseId("r2".into()),
        });
        assert_eq!(t.action, Some(Action::Done { answer: "Top stories".into() }));
        assert!(st.pending.is_none());
        assert_eq!(st.previous, Some(ResponseId("r2".into())));
    }
}
