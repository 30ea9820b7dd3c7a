//! Resolves a `routeKey` to a running [`LlmProvider`] for one turn (§6).
//!
//! `openai-compatible:*` and `anthropic:*` profiles go through
//! [`ProviderRegistry`], which builds an HTTP client once per call (cheap).
//! `codex-oauth:*` profiles are rejected by the registry — Codex has no HTTP
//! client to build, only a child process to spawn — so this module spawns a
//! fresh [`CodexClient`] per turn and tears it down when the turn ends,
//! per §5's "one per turn, not pooled" rule.

use std::sync::Arc;

use sa_codex::{CodexClient, CodexProvider};
use sa_domain::config::{Config, ProviderKind};
use sa_domain::error::{Error, Result};
use sa_providers::{CredentialProvider, LlmProvider, NoAuth, ProviderRegistry};

/// Either a pooled HTTP adapter or a turn-scoped Codex child process.
/// Dropping the `Codex` variant's `CodexClient` after the turn shuts the
/// child down (its `Drop` impl, if any, or an explicit `shutdown()` call by
/// the caller).
pub enum TurnProvider {
    Http {
        provider: Arc<dyn LlmProvider>,
        credential: Arc<dyn CredentialProvider>,
    },
    Codex {
        provider: Arc<CodexProvider>,
        client_for_shutdown: CodexClient,
    },
}

impl TurnProvider {
    pub fn provider(&self) -> Arc<dyn LlmProvider> {
        match self {
            TurnProvider::Http { provider, .. } => provider.clone(),
            TurnProvider::Codex { provider, .. } => provider.clone() as Arc<dyn LlmProvider>,
        }
    }

    pub fn credential(&self) -> Arc<dyn CredentialProvider> {
        match self {
            TurnProvider::Http { credential, .. } => credential.clone(),
            TurnProvider::Codex { .. } => Arc::new(NoAuth),
        }
    }

    /// Release the Codex child process, if any. A no-op for HTTP adapters.
    pub async fn shutdown(self) {
        if let TurnProvider::Codex {
            client_for_shutdown,
            ..
        } = self
        {
            client_for_shutdown.shutdown().await;
        }
    }
}

/// Resolve `route_key` into a provider for exactly one turn.
pub async fn resolve_turn_provider(
    config: &Config,
    registry: &ProviderRegistry,
    route_key: Option<&str>,
) -> Result<TurnProvider> {
    let profile = registry.resolve_profile(route_key)?;

    if profile.kind != ProviderKind::CodexOauth {
        let resolved = registry.build(profile)?;
        return Ok(TurnProvider::Http {
            provider: resolved.provider,
            credential: resolved.credential,
        });
    }

    let client = CodexClient::spawn(&config.codex.binary, &config.codex.extra_args)
        .map_err(|e| Error::Provider {
            provider: profile.id.clone(),
            message: e.to_string(),
        })?;

    let provider = Arc::new(CodexProvider::new(
        profile.id.clone(),
        client.clone(),
        profile.model.clone().unwrap_or_default(),
        config.server.root.clone(),
    ));

    Ok(TurnProvider::Codex {
        provider,
        client_for_shutdown: client,
    })
}
