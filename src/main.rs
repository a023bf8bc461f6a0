use anyhow::Result;
use browser_search::{config, runner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials must be in the environment before anything reads them
    config::load_environment();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = runner::parse_configuration();
    runner::run(&config).await?;
    Ok(())
}
