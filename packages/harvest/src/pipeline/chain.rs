//! Resolution of the backend chain for a request.

use chrono::Utc;
use indexmap::IndexSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::pipeline::keys::KeyHealth;
use crate::security::KeyVault;
use crate::traits::store::BackendConfigStore;
use crate::types::{
    BackendOverride, ChainEntry, ConfigChain, ExtractContext, ForcedModel, LlmBackendConfig,
    Provider, SavedBackendConfig, Tier, UserId,
};

/// Inputs to chain resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub user_id: UserId,
    pub explicit_override: Option<&'a BackendOverride>,
    pub tier: Tier,
    pub byok_allowed: bool,
    pub custom_allowed: bool,
    pub forced: Option<&'a ForcedModel>,
}

impl<'a> ResolveRequest<'a> {
    pub fn from_context(ctx: &'a ExtractContext, explicit_override: Option<&'a BackendOverride>) -> Self {
        Self {
            user_id: ctx.user_id,
            explicit_override,
            tier: ctx.tier,
            byok_allowed: ctx.byok_allowed,
            custom_allowed: ctx.custom_models_allowed,
            forced: ctx.forced_model.as_ref(),
        }
    }
}

/// Builds the ordered candidate list for a request.
///
/// First match wins: forced model, explicit override, saved custom
/// backend, tier chain (or default chain), floor chain. Never fails; an
/// empty chain is reported downstream as "no models configured".
pub struct ConfigChainResolver {
    config: ChainConfig,
    backends: Arc<dyn BackendConfigStore>,
    vault: Arc<dyn KeyVault>,
    key_health: Option<Arc<KeyHealth>>,
}

impl ConfigChainResolver {
    pub fn new(
        config: ChainConfig,
        backends: Arc<dyn BackendConfigStore>,
        vault: Arc<dyn KeyVault>,
    ) -> Self {
        Self {
            config,
            backends,
            vault,
            key_health: None,
        }
    }

    /// Drop service keys that are suspended after rate limiting.
    pub fn with_key_health(mut self, key_health: Arc<KeyHealth>) -> Self {
        self.key_health = Some(key_health);
        self
    }

    pub async fn resolve(&self, req: &ResolveRequest<'_>) -> ConfigChain {
        if let Some(forced) = req.forced {
            debug!(provider = %forced.provider, model = %forced.model, "Using forced model");
            let config = self.service_config(&ChainEntry::new(forced.provider, &forced.model));
            if forced.provider.requires_api_key() && config.api_key.is_none() {
                warn!(provider = %forced.provider, "Forced provider has no service key configured");
            }
            return ConfigChain::pinned(config);
        }

        if let Some(chain) = self.from_override(req) {
            return chain;
        }

        if req.custom_allowed {
            if let Some(chain) = self.from_saved(req.user_id).await {
                return chain;
            }
        }

        let chain = self.service_chain(self.config.chain_for(req.tier)).await;
        if !chain.is_empty() {
            return ConfigChain::service(chain);
        }

        warn!(tier = %req.tier, "No usable tier chain; falling back to floor chain");
        let mut floor = self.service_chain(&self.config.floor_chain).await;
        if floor.is_empty() {
            floor.push(self.service_config(&ChainEntry::new(
                Provider::Ollama,
                Provider::Ollama.default_model(),
            )));
        }
        ConfigChain::service(floor)
    }

    fn from_override(&self, req: &ResolveRequest<'_>) -> Option<ConfigChain> {
        let backend = req.explicit_override?;
        let provider = backend.provider?;

        if !req.byok_allowed {
            warn!(user_id = %req.user_id, provider = %provider, "Ignoring backend override: BYOK not enabled for this plan");
            return None;
        }
        let key = backend.api_key.clone().filter(|k| !k.is_empty());
        if provider.requires_api_key() && key.is_none() {
            warn!(user_id = %req.user_id, provider = %provider, "Ignoring backend override without an API key");
            return None;
        }

        let model = backend
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| provider.default_model().to_string());
        let mut config = LlmBackendConfig::new(provider, model);
        config.api_key = key;
        config.base_url = backend.base_url.clone();

        debug!(provider = %provider, model = %config.model, "Using caller's backend override");
        Some(ConfigChain::byok(config))
    }

    async fn from_saved(&self, user_id: UserId) -> Option<ConfigChain> {
        let saved = match self.backends.saved_backend(user_id).await {
            Ok(Some(saved)) => saved,
            Ok(None) => return None,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to load saved backend");
                return None;
            }
        };
        self.decrypt_saved(saved).map(ConfigChain::byok)
    }

    fn decrypt_saved(&self, saved: SavedBackendConfig) -> Option<LlmBackendConfig> {
        let api_key = match saved.encrypted_api_key.as_deref() {
            Some(ciphertext) => match self.vault.decrypt(ciphertext) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(user_id = %saved.user_id, error = %e, "Failed to decrypt saved API key");
                    return None;
                }
            },
            None => None,
        };
        if saved.provider.requires_api_key() && api_key.is_none() {
            warn!(user_id = %saved.user_id, provider = %saved.provider, "Saved backend has no API key");
            return None;
        }

        let mut config = LlmBackendConfig::new(saved.provider, saved.model)
            .with_strict_schema_mode(saved.strict_schema_mode);
        config.api_key = api_key;
        config.base_url = saved.base_url;
        if let Some(tokens) = saved.max_output_tokens {
            config.max_output_tokens = tokens;
        }
        Some(config)
    }

    /// Pair entries with service keys, dropping unusable and duplicate ones.
    async fn service_chain(&self, entries: &[ChainEntry]) -> Vec<LlmBackendConfig> {
        let now = Utc::now();
        let mut seen = IndexSet::new();
        let mut chain = Vec::with_capacity(entries.len());

        for entry in entries {
            if !seen.insert((entry.provider, entry.model.clone())) {
                continue;
            }
            let config = self.service_config(entry);
            match &config.api_key {
                None if entry.provider.requires_api_key() => {
                    debug!(provider = %entry.provider, model = %entry.model, "Dropping chain entry without service key");
                    continue;
                }
                Some(key) => {
                    if let Some(health) = &self.key_health {
                        if health.is_suspended(key, now).await {
                            debug!(provider = %entry.provider, model = %entry.model, "Dropping chain entry with suspended key");
                            continue;
                        }
                    }
                }
                None => {}
            }
            chain.push(config);
        }

        chain
    }

    fn service_config(&self, entry: &ChainEntry) -> LlmBackendConfig {
        let mut config = LlmBackendConfig::new(entry.provider, entry.model.clone())
            .with_strict_schema_mode(entry.strict_schema_mode);
        if entry.provider.requires_api_key() {
            config.api_key = self.config.service_keys.get(&entry.provider).cloned();
        }
        config.base_url = self.config.base_urls.get(&entry.provider).cloned();
        if let Some(tokens) = entry.max_output_tokens {
            config.max_output_tokens = tokens;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyHealthConfig;
    use crate::error::SecurityError;
    use crate::security::{MockKeyVault, PlaintextVault, SecretString};
    use crate::stores::MemoryStore;
    use uuid::Uuid;

    fn chain_config() -> ChainConfig {
        ChainConfig::default()
            .with_default_chain(vec![
                ChainEntry::new(Provider::OpenAi, "gpt-4o-mini"),
                ChainEntry::new(Provider::Anthropic, "claude-3-5-haiku-latest"),
                ChainEntry::new(Provider::OpenAi, "gpt-4o-mini"),
            ])
            .with_tier_chain(
                Tier::Pro,
                vec![
                    ChainEntry::new(Provider::OpenRouter, "openai/gpt-4o"),
                    ChainEntry::new(Provider::OpenAi, "gpt-4o-mini"),
                ],
            )
            .with_service_key(Provider::OpenAi, "sk-openai")
            .with_service_key(Provider::OpenRouter, "sk-or")
    }

    fn resolver(store: Arc<MemoryStore>) -> ConfigChainResolver {
        ConfigChainResolver::new(chain_config(), store, Arc::new(PlaintextVault))
    }

    fn request(ctx: &ExtractContext) -> ResolveRequest<'_> {
        ResolveRequest::from_context(ctx, None)
    }

    fn models(chain: &ConfigChain) -> Vec<String> {
        chain.entries().iter().map(|c| c.label()).collect()
    }

    #[tokio::test]
    async fn test_forced_model_wins() {
        let resolver = resolver(Arc::new(MemoryStore::new()));
        let ctx = ExtractContext::for_tier(Uuid::new_v4(), Tier::Enterprise)
            .with_forced_model(ForcedModel::new(Provider::OpenAi, "gpt-4.1"));
        let backend = BackendOverride::new(Provider::Groq).with_api_key("gsk-user");

        let chain = resolver
            .resolve(&ResolveRequest::from_context(&ctx, Some(&backend)))
            .await;

        assert_eq!(models(&chain), vec!["openai/gpt-4.1"]);
        assert!(!chain.is_byok());
        assert_eq!(chain.first().unwrap().api_key.as_ref().unwrap().expose(), "sk-openai");
    }

    #[tokio::test]
    async fn test_override_is_single_byok_entry() {
        let resolver = resolver(Arc::new(MemoryStore::new()));
        let ctx = ExtractContext::for_tier(Uuid::new_v4(), Tier::Starter);
        let backend = BackendOverride::new(Provider::Anthropic).with_api_key("sk-ant-user");

        let chain = resolver
            .resolve(&ResolveRequest::from_context(&ctx, Some(&backend)))
            .await;

        assert!(chain.is_byok());
        assert_eq!(models(&chain), vec!["anthropic/claude-3-5-haiku-latest"]);
        assert_eq!(chain.first().unwrap().api_key.as_ref().unwrap().expose(), "sk-ant-user");
    }

    #[tokio::test]
    async fn test_override_ignored_without_byok_entitlement() {
        let resolver = resolver(Arc::new(MemoryStore::new()));
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Free);
        let backend = BackendOverride::new(Provider::Anthropic).with_api_key("sk-ant-user");

        let chain = resolver
            .resolve(&ResolveRequest::from_context(&ctx, Some(&backend)))
            .await;

        assert!(!chain.is_byok());
        assert_eq!(models(&chain), vec!["openai/gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_saved_backend_requires_custom_entitlement() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store
            .save_backend(&SavedBackendConfig {
                user_id: user,
                provider: Provider::Groq,
                model: "llama-3.3-70b-versatile".into(),
                encrypted_api_key: Some("gsk-saved".into()),
                base_url: None,
                max_output_tokens: Some(2048),
                strict_schema_mode: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let resolver = resolver(store);

        let pro = ExtractContext::for_tier(user, Tier::Pro);
        let chain = resolver.resolve(&request(&pro)).await;
        assert!(chain.is_byok());
        let config = chain.first().unwrap();
        assert_eq!(config.model, "llama-3.3-70b-versatile");
        assert_eq!(config.max_output_tokens, 2048);
        assert!(config.strict_schema_mode);

        let starter = ExtractContext::for_tier(user, Tier::Starter);
        let chain = resolver.resolve(&request(&starter)).await;
        assert!(!chain.is_byok());
    }

    #[tokio::test]
    async fn test_saved_key_decrypted_only_when_reached() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store
            .save_backend(&SavedBackendConfig {
                user_id: user,
                provider: Provider::OpenAi,
                model: "gpt-4o".into(),
                encrypted_api_key: Some("ciphertext".into()),
                base_url: None,
                max_output_tokens: None,
                strict_schema_mode: false,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut vault = MockKeyVault::new();
        vault
            .expect_decrypt()
            .times(1)
            .returning(|_| Err(SecurityError::Decrypt("bad key".into())));
        let resolver = ConfigChainResolver::new(chain_config(), store, Arc::new(vault));

        // forced model short-circuits before the saved backend
        let forced = ExtractContext::for_tier(user, Tier::Pro)
            .with_forced_model(ForcedModel::new(Provider::OpenAi, "gpt-4o-mini"));
        resolver.resolve(&request(&forced)).await;

        // decrypt failure falls through to the tier chain
        let pro = ExtractContext::for_tier(user, Tier::Pro);
        let chain = resolver.resolve(&request(&pro)).await;
        assert!(!chain.is_byok());
        assert_eq!(models(&chain), vec!["openrouter/openai/gpt-4o", "openai/gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_service_chain_drops_keyless_and_duplicates() {
        let resolver = resolver(Arc::new(MemoryStore::new()));
        let ctx = ExtractContext::for_tier(Uuid::new_v4(), Tier::Free);
        let chain = resolver.resolve(&request(&ctx)).await;
        // anthropic has no service key; the repeated openai entry is dropped
        assert_eq!(models(&chain), vec!["openai/gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn test_floor_chain_when_nothing_usable() {
        let resolver = ConfigChainResolver::new(
            ChainConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(PlaintextVault),
        );
        let ctx = ExtractContext::for_tier(Uuid::new_v4(), Tier::Free);
        let chain = resolver.resolve(&request(&ctx)).await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.first().unwrap().provider, Provider::Ollama);

        let empty_floor = ConfigChainResolver::new(
            ChainConfig::default().with_floor_chain(Vec::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(PlaintextVault),
        );
        assert!(!empty_floor.resolve(&request(&ctx)).await.is_empty());
    }

    #[tokio::test]
    async fn test_suspended_keys_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(KeyHealth::new(store.clone(), KeyHealthConfig::default()));
        health
            .record_rate_limit(Provider::OpenRouter, &SecretString::new("sk-or"), None, Utc::now())
            .await
            .unwrap();
        let resolver = resolver(store).with_key_health(health);

        let ctx = ExtractContext::for_tier(Uuid::new_v4(), Tier::Pro);
        let chain = resolver.resolve(&request(&ctx)).await;
        assert_eq!(models(&chain), vec!["openai/gpt-4o-mini"]);
    }
}
