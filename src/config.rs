//! Invocation configuration.
//!
//! Flags are parsed once with clap into an immutable [`Configuration`].
//! Credentials for the model client come from the environment, optionally
//! seeded from a `.env` file by [`load_environment`].

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

pub const DEFAULT_TASK: &str = "get the google news for the last 24 hours";
pub const DEFAULT_OUTPUT_PATH: &str = "./search_browser_result.md";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Run a browser agent on a task and save its answer as Markdown
#[derive(Parser, Debug, Clone)]
#[command(name = "browser-search")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Task to perform in the browser
    #[arg(long, default_value = DEFAULT_TASK)]
    pub task: String,

    /// File path to save the result
    #[arg(long, default_value = DEFAULT_OUTPUT_PATH)]
    pub file_path: PathBuf,

    /// LLM model to use
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Maximum number of agent steps
    #[arg(long, default_value_t = 40)]
    pub max_steps: usize,

    /// Page to open before the first step
    #[arg(long)]
    pub start_url: Option<String>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// DevTools websocket of a running Chrome to attach to
    #[arg(long, env = "CHROME_WS_URL")]
    pub chrome_ws_url: Option<String>,

    /// Directory for per-step screenshots
    #[arg(long)]
    pub screenshots_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub task: String,
    pub output_path: PathBuf,
    pub model_id: String,
    pub max_steps: usize,
    pub start_url: Option<String>,
    pub headless: bool,
    pub chrome_ws_url: Option<String>,
    pub screenshots_dir: Option<PathBuf>,
}

impl Configuration {
    /// Parse the process arguments; clap exits with a usage error on bad input.
    pub fn parse() -> Self {
        Cli::parse().into()
    }

    pub fn try_from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Cli::try_parse_from(args)?.into())
    }
}

impl From<Cli> for Configuration {
    fn from(cli: Cli) -> Self {
        Self {
            task: cli.task,
            output_path: cli.file_path,
            model_id: cli.model,
            max_steps: cli.max_steps,
            start_url: cli.start_url,
            headless: !cli.headed,
            chrome_ws_url: cli.chrome_ws_url.filter(|ws| !ws.trim().is_empty()),
            screenshots_dir: cli.screenshots_dir,
        }
    }
}

/// Load `.env` into the process environment if present.
pub fn load_environment() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}
