//! Yururi CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use yururi::config::Settings;
use yururi::conversation::Orchestrator;
use yururi::llm::XaiClient;
use yururi::memory::InMemoryStore;

#[derive(Parser)]
#[command(name = "yururi")]
#[command(about = "A Discord relay bot backed by the xAI chat API")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting yururi...");

    let settings = Arc::new(
        Settings::load().with_context(|| "failed to load configuration from environment")?,
    );
    tracing::info!(
        model = %settings.model,
        data_dir = %settings.data_dir.display(),
        guilds = settings.allowed_guild_ids.len(),
        "Configuration loaded"
    );

    let llm = Arc::new(XaiClient::new(
        settings.api_key.clone(),
        &settings.api_host,
        settings.model.clone(),
        settings.temperature,
        settings.max_tokens,
    ));
    let memory = Arc::new(InMemoryStore::new(settings.max_history));

    let orchestrator = Arc::new(Orchestrator::new(settings.clone(), llm, memory));
    orchestrator.bootstrap().await;
    tracing::info!("Memory bootstrapped from transcript logs");

    let gateway = tokio::spawn(yururi::messaging::discord::run(settings, orchestrator));

    tokio::select! {
        result = gateway => {
            result
                .with_context(|| "gateway task panicked")?
                .with_context(|| "gateway connection ended")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("yururi stopped");
    Ok(())
}
