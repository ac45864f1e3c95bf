//! Realtime augmentative-communication voice backend.

use clap::Parser;
use unmute_backend::config::Config;

#[derive(Parser, Debug)]
#[command(name = "unmute-backend", version, about = "STT/LLM/TTS turn orchestration over WebSocket")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "UNMUTE_CONFIG", default_value = "config.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config);

    unmute_backend::start_server(config).await
}
