//! Service key health: temporary suspension after rate limiting.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::KeyHealthConfig;
use crate::error::StoreResult;
use crate::security::SecretString;
use crate::traits::store::KeyHealthStore;
use crate::types::{KeySuspension, Provider};

/// Tracks which service keys are cooling down.
///
/// Keys are identified by fingerprint only. Consecutive rate limits double
/// the suspension, up to the configured cap; a provider `Retry-After` hint
/// takes precedence.
pub struct KeyHealth {
    store: Arc<dyn KeyHealthStore>,
    config: KeyHealthConfig,
}

impl KeyHealth {
    pub fn new(store: Arc<dyn KeyHealthStore>, config: KeyHealthConfig) -> Self {
        Self { store, config }
    }

    /// Backoff for the given strike count (1-based).
    pub fn backoff_for(&self, strikes: u32) -> Duration {
        let exponent = strikes.saturating_sub(1).min(16);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }

    /// Whether the key is currently suspended. Store failures count as healthy.
    pub async fn is_suspended(&self, key: &SecretString, now: DateTime<Utc>) -> bool {
        match self.store.suspension(&key.fingerprint()).await {
            Ok(Some(suspension)) => suspension.is_active(now),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Key health lookup failed; treating key as healthy");
                false
            }
        }
    }

    /// Suspend a key after a rate-limit response.
    pub async fn record_rate_limit(
        &self,
        provider: Provider,
        key: &SecretString,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> StoreResult<KeySuspension> {
        let fingerprint = key.fingerprint();
        let strikes = self
            .store
            .suspension(&fingerprint)
            .await?
            .map(|s| s.strikes.saturating_add(1))
            .unwrap_or(1);

        let backoff = retry_after
            .unwrap_or_else(|| self.backoff_for(strikes))
            .min(self.config.max_backoff);
        let until = now
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(30));

        let suspension = KeySuspension {
            fingerprint,
            provider,
            suspended_until: until,
            strikes,
            reason: "rate limited".to_string(),
        };
        self.store.put_suspension(&suspension).await?;

        info!(
            provider = %provider,
            strikes,
            backoff_secs = backoff.as_secs(),
            "Suspended service key"
        );
        Ok(suspension)
    }

    /// Clear any suspension after the key worked again.
    pub async fn record_success(&self, key: &SecretString) {
        let fingerprint = key.fingerprint();
        match self.store.suspension(&fingerprint).await {
            Ok(Some(_)) => {
                if let Err(e) = self.store.clear_suspension(&fingerprint).await {
                    warn!(error = %e, "Failed to clear key suspension");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Key health lookup failed"),
        }
    }
}
