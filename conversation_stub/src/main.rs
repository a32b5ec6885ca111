use anyhow::Result;
use clap::Parser;

use conversation_stub::{config, run_http_server, AppState, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    tracing::debug!(?cfg, "configuration loaded");

    let mut state = AppState::new(Store::demo(&cfg.token));
    state.omit_audio_length = cfg.omit_audio_length;
    run_http_server(cfg.bind, state).await
}
