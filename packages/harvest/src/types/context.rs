//! Per-request entitlements and billing context.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Provider, UnknownProvider, UserId};

/// Subscription tier of the requesting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// A provider/model pinned by the caller's credentials (e.g. a provisioned API key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedModel {
    pub provider: Provider,
    pub model: String,
}

impl ForcedModel {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

/// Parses `provider:model`.
impl FromStr for ForcedModel {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entry: crate::types::ChainEntry = s.parse()?;
        Ok(Self::new(entry.provider, entry.model))
    }
}

/// Feature and billing context for one request. Built once, read-only after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractContext {
    pub user_id: UserId,
    pub tier: Tier,
    pub byok_allowed: bool,
    pub custom_models_allowed: bool,
    pub premium_budget_fallback: bool,
    pub dynamic_content_allowed: bool,
    pub skip_credit_check: bool,
    pub forced_model: Option<ForcedModel>,
}

impl ExtractContext {
    /// Context with every entitlement off.
    pub fn new(user_id: UserId, tier: Tier) -> Self {
        Self {
            user_id,
            tier,
            byok_allowed: false,
            custom_models_allowed: false,
            premium_budget_fallback: false,
            dynamic_content_allowed: false,
            skip_credit_check: false,
            forced_model: None,
        }
    }

    /// Context with the entitlements the tier normally grants.
    pub fn for_tier(user_id: UserId, tier: Tier) -> Self {
        let ctx = Self::new(user_id, tier);
        match tier {
            Tier::Free => ctx,
            Tier::Starter => ctx.with_byok(true),
            Tier::Pro => ctx
                .with_byok(true)
                .with_custom_models(true)
                .with_dynamic_content(true),
            Tier::Enterprise => ctx
                .with_byok(true)
                .with_custom_models(true)
                .with_dynamic_content(true)
                .with_premium_budget_fallback(true),
        }
    }

    pub fn with_byok(mut self, allowed: bool) -> Self {
        self.byok_allowed = allowed;
        self
    }

    pub fn with_custom_models(mut self, allowed: bool) -> Self {
        self.custom_models_allowed = allowed;
        self
    }

    pub fn with_premium_budget_fallback(mut self, allowed: bool) -> Self {
        self.premium_budget_fallback = allowed;
        self
    }

    pub fn with_dynamic_content(mut self, allowed: bool) -> Self {
        self.dynamic_content_allowed = allowed;
        self
    }

    pub fn with_skip_credit_check(mut self, skip: bool) -> Self {
        self.skip_credit_check = skip;
        self
    }

    pub fn with_forced_model(mut self, forced: ForcedModel) -> Self {
        self.forced_model = Some(forced);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_tier_defaults() {
        let free = ExtractContext::for_tier(Uuid::new_v4(), Tier::Free);
        assert!(!free.byok_allowed && !free.dynamic_content_allowed);

        let pro = ExtractContext::for_tier(Uuid::new_v4(), Tier::Pro);
        assert!(pro.custom_models_allowed && pro.dynamic_content_allowed);
        assert!(!pro.premium_budget_fallback);

        let ent = ExtractContext::for_tier(Uuid::new_v4(), Tier::Enterprise);
        assert!(ent.premium_budget_fallback);
    }

    #[test]
    fn test_forced_model_parse() {
        let forced: ForcedModel = "groq:llama-3.3-70b".parse().unwrap();
        assert_eq!(forced.provider, Provider::Groq);
        assert_eq!(forced.model, "llama-3.3-70b");
    }
}
