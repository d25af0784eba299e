//! SSRF guard for fetchers.

use async_trait::async_trait;

use crate::error::{FetchError, FetchResult};
use crate::security::UrlValidator;
use crate::traits::fetcher::ContentFetcher;
use crate::types::{FetchMode, FetchOptions, FetchedPage};

/// Validates URLs before fetching and the final URL after redirects.
pub struct ValidatedFetcher<F: ContentFetcher> {
    inner: F,
    validator: UrlValidator,
}

impl<F: ContentFetcher> ValidatedFetcher<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            inner: fetcher,
            validator: UrlValidator::new(),
        }
    }

    pub fn with_validator(fetcher: F, validator: UrlValidator) -> Self {
        Self {
            inner: fetcher,
            validator,
        }
    }
}

#[async_trait]
impl<F: ContentFetcher> ContentFetcher for ValidatedFetcher<F> {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        self.validator.validate_with_dns(url).await?;

        let page = self.inner.fetch(url, mode, opts).await?;

        if page.final_url != url {
            self.validator
                .validate(&page.final_url)
                .map_err(FetchError::Security)?;
        }
        Ok(page)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
