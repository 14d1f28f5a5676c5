use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "aproxy", about = "Local OAuth reverse proxy for AI CLI traffic")]
pub struct Cli {
    /// Listen port (also APROXY_PORT).
    #[arg(long)]
    pub port: Option<u16>,
    /// Paid gateway base URL (also AMP_URL).
    #[arg(long)]
    pub upstream: Option<String>,
    /// Credential directory (also APROXY_DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print client configuration pointing at this proxy.
    Setup,
    /// Log in to a provider (anthropic, codex, google).
    Login {
        provider: Option<String>,
    },
}
