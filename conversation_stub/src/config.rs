use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;

/// In-memory conversation, audio-object and broadcast service for local runs.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Address to bind (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Bearer token of the broadcast-capable demo user `me`.
    #[arg(long)]
    pub token: Option<String>,
    /// Serve audio objects without a Content-Length header.
    #[arg(long)]
    pub omit_audio_length: bool,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
}

#[derive(Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub token: String,
    pub omit_audio_length: bool,
    pub logging_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("token", &"<redacted>")
            .field("omit_audio_length", &self.omit_audio_length)
            .field("logging_enabled", &self.logging_enabled)
            .finish()
    }
}

impl Config {
    /// CLI flags win over `STUB_*` environment variables, which win over defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let bind = cli
            .bind
            .clone()
            .or_else(|| std::env::var("STUB_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:8787".into());
        let bind = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
        let token = cli
            .token
            .clone()
            .or_else(|| std::env::var("STUB_TOKEN").ok())
            .unwrap_or_else(|| "dev-token".into());
        let logging_enabled = match cli.logging {
            Some(v) => v,
            None => std::env::var("STUB_LOGGING")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        };
        Ok(Self {
            bind,
            token,
            omit_audio_length: cli.omit_audio_length,
            logging_enabled,
        })
    }
}
