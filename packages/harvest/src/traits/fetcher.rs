//! Page fetching.

use async_trait::async_trait;

use crate::error::FetchResult;
use crate::types::{FetchMode, FetchOptions, FetchedPage};

/// Retrieves a page in a given mode.
///
/// Static fetchers are expected to run a protection detector before
/// reporting a non-success status, so a challenge page surfaces as
/// [`FetchError::BotProtection`](crate::error::FetchError::BotProtection)
/// rather than a plain status error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage>;

    /// Fetcher name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: ContentFetcher + ?Sized> ContentFetcher for std::sync::Arc<T> {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        (**self).fetch(url, mode, opts).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
