use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use sa_domain::config::{Config, ConfigSeverity};
use sa_gateway::api;
use sa_gateway::cli::{Cli, Command};
use sa_gateway::runtime::approval::ApprovalStore;
use sa_gateway::runtime::cancel::CancelMap;
use sa_gateway::runtime::session_lock::SessionLockMap;
use sa_gateway::runtime::tools::ToolDispatcher;
use sa_gateway::state::AppState;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{SessionStore, TranscriptStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = sa_gateway::cli::load_config()?;
            match run_server(Arc::new(config)).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "gateway exited with an error");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug")),
        )
        .init();
}

/// Start the gateway server: build `AppState` from `config` and serve the
/// HTTP surface (C13) until the process is killed.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("gateway starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let root = std::path::Path::new(&config.server.root)
        .canonicalize()
        .unwrap_or_else(|_| std::path::PathBuf::from(&config.server.root));
    tracing::info!(root = %root.display(), "server root resolved");

    let providers = Arc::new(ProviderRegistry::new(config.providers.clone()));
    tracing::info!(profiles = config.providers.len(), "provider registry ready");

    let sessions = Arc::new(
        SessionStore::new(&root.join(".eclia")).context("initializing session store")?,
    );
    let transcripts = Arc::new(
        TranscriptStore::new(&root.join(&config.sessions.path))
            .context("initializing transcript store")?,
    );
    tracing::info!("session and transcript stores ready");

    let session_locks = Arc::new(SessionLockMap::new());
    let cancel_map = Arc::new(CancelMap::new());
    let approvals = Arc::new(ApprovalStore::new(Duration::from_millis(config.approvals.timeout_ms)));

    let tools = Arc::new(
        ToolDispatcher::spawn(&config, root.clone())
            .await
            .context("spawning tool-host")?,
    );
    tracing::info!("tool dispatcher ready");

    let api_token_hash = resolve_api_token_hash(&config, &root);

    let state = AppState {
        config: config.clone(),
        providers,
        sessions,
        transcripts,
        session_locks,
        cancel_map,
        approvals,
        tools,
        api_token_hash,
        root: root.clone(),
    };

    let app = api::router(state.clone())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(2);
        }
    };

    tracing::info!(addr = %addr, "gateway listening");
    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Read the bearer token once at startup (§6): `auth.token_env` if set and
/// non-empty, else `<root>/<auth.token_file>` trimmed of surrounding
/// whitespace. Neither present disables auth (dev mode).
fn resolve_api_token_hash(config: &Config, root: &std::path::Path) -> Option<Vec<u8>> {
    if let Ok(token) = std::env::var(&config.auth.token_env) {
        if !token.is_empty() {
            tracing::info!(env_var = %config.auth.token_env, "bearer-token auth enabled (env)");
            return Some(Sha256::digest(token.as_bytes()).to_vec());
        }
    }

    let token_path = root.join(&config.auth.token_file);
    match std::fs::read_to_string(&token_path) {
        Ok(raw) if !raw.trim().is_empty() => {
            tracing::info!(path = %token_path.display(), "bearer-token auth enabled (file)");
            Some(Sha256::digest(raw.trim().as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.auth.token_env,
                path = %token_path.display(),
                "bearer-token auth DISABLED — dev mode"
            );
            None
        }
    }
}
