//! Rate-limited fetcher wrapper.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::FetchResult;
use crate::traits::fetcher::ContentFetcher;
use crate::types::{FetchMode, FetchOptions, FetchedPage};

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Wraps a fetcher with a global request quota.
pub struct RateLimitedFetcher<F: ContentFetcher> {
    inner: F,
    limiter: Arc<DefaultRateLimiter>,
}

impl<F: ContentFetcher> RateLimitedFetcher<F> {
    pub fn new(fetcher: F, requests_per_second: NonZeroU32) -> Self {
        Self::with_quota(fetcher, Quota::per_second(requests_per_second))
    }

    pub fn with_burst(fetcher: F, requests_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self::with_quota(
            fetcher,
            Quota::per_second(requests_per_second).allow_burst(burst),
        )
    }

    pub fn with_quota(fetcher: F, quota: Quota) -> Self {
        Self {
            inner: fetcher,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[async_trait]
impl<F: ContentFetcher> ContentFetcher for RateLimitedFetcher<F> {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        self.limiter.until_ready().await;
        self.inner.fetch(url, mode, opts).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::fetcher::MockContentFetcher;
    use crate::types::Tier;
    use nonzero_ext::nonzero;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_limits_request_rate() {
        let mut inner = MockContentFetcher::new();
        inner
            .expect_fetch()
            .times(3)
            .returning(|url, mode, _| Ok(FetchedPage::new("ok", url, mode)));

        let fetcher = RateLimitedFetcher::new(inner, nonzero!(10u32));
        let opts = FetchOptions::new(Uuid::new_v4(), Tier::Free);

        let start = Instant::now();
        for _ in 0..3 {
            fetcher
                .fetch("https://example.com", FetchMode::Static, &opts)
                .await
                .unwrap();
        }
        // first request is free, the next two wait ~100ms each
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
