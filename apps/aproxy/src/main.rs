use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aproxy_common::{ProxyConfig, ProxyConfigPatch};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match &cli.command {
        Some(Command::Setup) => setup(&config),
        Some(Command::Login { provider }) => login(&config, provider.as_deref()).await,
        None => serve(config).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut patch = ProxyConfigPatch {
        data_dir: Some(default_data_dir()),
        ..Default::default()
    };

    let mut env_patch = ProxyConfigPatch::default();
    if let Ok(port) = std::env::var("APROXY_PORT") {
        env_patch.port = Some(port.parse().context("APROXY_PORT must be a port number")?);
    }
    if let Ok(upstream) = std::env::var("AMP_URL") {
        env_patch.upstream_base = Some(upstream);
    }
    if let Ok(key) = std::env::var("AMP_API_KEY") {
        env_patch.amp_api_key = Some(key);
    }
    if let Ok(dir) = std::env::var("APROXY_DATA_DIR") {
        env_patch.data_dir = Some(PathBuf::from(dir));
    }
    patch.overlay(env_patch);

    patch.overlay(ProxyConfigPatch {
        port: cli.port,
        upstream_base: cli.upstream.clone(),
        data_dir: cli.data_dir.clone(),
        ..Default::default()
    });

    Ok(patch.into_config()?)
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".aproxy"))
        .unwrap_or_else(|_| PathBuf::from(".aproxy"))
}

fn setup(config: &ProxyConfig) -> Result<ExitCode> {
    println!("Point the client at this proxy:");
    println!();
    println!("  export AMP_URL=\"http://localhost:{}\"", config.port);
    println!();
    println!("then run `aproxy login <provider>` for each subscription.");
    Ok(ExitCode::SUCCESS)
}

async fn login(config: &ProxyConfig, provider: Option<&str>) -> Result<ExitCode> {
    let name = provider.unwrap_or("anthropic");
    let Some(oauth_config) = aproxy_oauth::config_for(name) else {
        eprintln!("unknown provider: {name} (expected anthropic, codex, or google)");
        return Ok(ExitCode::FAILURE);
    };

    let store = Arc::new(
        aproxy_storage::CredentialStore::open(&config.data_dir)
            .await
            .context("open credential store")?,
    );
    let engine = Arc::new(aproxy_oauth::OauthEngine::new(store).context("oauth engine")?);
    let record = engine.login(oauth_config).await.context("login failed")?;

    println!(
        "Logged in to {name} as {}.",
        record.email.as_deref().unwrap_or("<unknown>")
    );
    Ok(ExitCode::SUCCESS)
}

async fn serve(config: ProxyConfig) -> Result<ExitCode> {
    let port = config.port;
    let state = Arc::new(
        aproxy_core::AppState::bootstrap(config)
            .await
            .context("bootstrap")?,
    );
    let background = state.start_background_tasks();

    let app = aproxy_router::build_router(state);
    let listener = tokio::net::TcpListener::bind(("localhost", port))
        .await
        .with_context(|| format!("bind localhost:{port}"))?;
    info!(port, "aproxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for task in background {
        task.abort();
    }
    info!("shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
