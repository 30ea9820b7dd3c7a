//! Provider registry (§6): resolves a client-supplied `routeKey` to a
//! configured profile and builds the matching [`LlmProvider`] adapter.
//!
//! `routeKey` grammar: `"<kind>:<id>"`, e.g. `"openai-compatible:main"`.
//! Unknown or missing route keys fall back to the first profile marked
//! `is_default` (or, lacking one, the first configured profile).

use std::collections::HashMap;
use std::sync::Arc;

use sa_domain::config::{ProviderKind, ProviderProfile};
use sa_domain::error::{Error, Result};

use crate::anthropic::AnthropicProvider;
use crate::credential::{CredentialProvider, NoAuth, StaticApiKey};
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Everything needed to talk to one resolved upstream: the adapter and the
/// credential headers to send with every request.
pub struct ResolvedProvider {
    pub provider: Arc<dyn LlmProvider>,
    pub credential: Arc<dyn CredentialProvider>,
}

pub struct ProviderRegistry {
    profiles: Vec<ProviderProfile>,
}

impl ProviderRegistry {
    pub fn new(profiles: Vec<ProviderProfile>) -> Self {
        Self { profiles }
    }

    /// Parse and resolve a `routeKey` into a profile (§6). `None` or an
    /// unparseable/unknown key falls back to the default profile.
    pub fn resolve_profile(&self, route_key: Option<&str>) -> Result<&ProviderProfile> {
        if let Some(key) = route_key {
            if let Some((kind_str, id)) = key.split_once(':') {
                if let Some(kind) = parse_kind(kind_str) {
                    if let Some(profile) = self
                        .profiles
                        .iter()
                        .find(|p| p.kind == kind && p.id == id)
                    {
                        return Ok(profile);
                    }
                }
            }
        }
        self.default_profile()
    }

    fn default_profile(&self) -> Result<&ProviderProfile> {
        self.profiles
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.profiles.first())
            .ok_or_else(|| Error::Config("no provider profiles configured".into()))
    }

    /// Build the adapter and credential provider for `profile`.
    pub fn build(&self, profile: &ProviderProfile) -> Result<ResolvedProvider> {
        let credential = credential_for(profile);
        let provider: Arc<dyn LlmProvider> = match profile.kind {
            ProviderKind::OpenaiCompatible => {
                let base_url = profile
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into());
                let model = profile.model.clone().unwrap_or_else(|| "gpt-4o".into());
                Arc::new(OpenAiCompatProvider::new(profile.id.clone(), base_url, model)?)
            }
            ProviderKind::Anthropic => {
                let base_url = profile
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".into());
                let model = profile
                    .model
                    .clone()
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".into());
                Arc::new(AnthropicProvider::new(profile.id.clone(), base_url, model, None)?)
            }
            ProviderKind::CodexOauth => {
                return Err(Error::Config(format!(
                    "profile '{}' is codex-oauth; build it via sa-codex, not the HTTP registry",
                    profile.id
                )));
            }
        };
        Ok(ResolvedProvider { provider, credential })
    }

    /// Resolve a `routeKey` straight through to a built provider.
    pub fn resolve(&self, route_key: Option<&str>) -> Result<ResolvedProvider> {
        let profile = self.resolve_profile(route_key)?;
        self.build(profile)
    }
}

fn parse_kind(s: &str) -> Option<ProviderKind> {
    match s {
        "openai-compatible" => Some(ProviderKind::OpenaiCompatible),
        "anthropic" => Some(ProviderKind::Anthropic),
        "codex-oauth" => Some(ProviderKind::CodexOauth),
        _ => None,
    }
}

/// A profile's API key is read from an environment variable named after its
/// id: `<ID_UPPERCASED_WITH_UNDERSCORES>_API_KEY`. A profile with no such
/// variable set gets [`NoAuth`] — appropriate for unauthenticated local
/// endpoints (Ollama, vLLM); a real upstream will then fail the turn with
/// `missing_credential` the first time a header is actually needed.
fn credential_for(profile: &ProviderProfile) -> Arc<dyn CredentialProvider> {
    let env_name = format!(
        "{}_API_KEY",
        profile
            .id
            .to_uppercase()
            .replace(|c: char| !c.is_ascii_alphanumeric(), "_")
    );
    match std::env::var(&env_name) {
        Ok(key) if !key.is_empty() => match profile.kind {
            ProviderKind::Anthropic => Arc::new(StaticApiKey::new(key, "x-api-key", false)),
            _ => Arc::new(StaticApiKey::new(key, "Authorization", true)),
        },
        _ => Arc::new(NoAuth),
    }
}
