//! Static-to-dynamic fetch escalation.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::error::{ConfigError, ExtractError, FetchError};
use crate::traits::cleaner::ContentCleaner;
use crate::traits::fetcher::ContentFetcher;
use crate::types::{
    ContentStage, EscalationTrigger, ExtractContext, FetchMode, FetchOptions, FetchedPage, JobId,
};

/// A page that passed every content check.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub page: FetchedPage,
    /// Cleaned text handed to the model
    pub cleaned: String,
    pub used_dynamic: bool,
    /// Escalations performed (0 or 1)
    pub retry_count: u32,
    pub fetch_duration: Duration,
}

/// Escalation state. The only transition is `Static -> Dynamic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationState {
    Static,
    Dynamic,
}

impl EscalationState {
    fn mode(self) -> FetchMode {
        match self {
            Self::Static => FetchMode::Static,
            Self::Dynamic => FetchMode::Dynamic,
        }
    }
}

/// What one fetch in the loop produced.
enum Step {
    Done(FetchedPage, String),
    Escalate(EscalationTrigger),
}

/// Fetches and cleans a page, upgrading to browser rendering at most once.
///
/// The static fetcher reports protection pages as
/// [`FetchError::BotProtection`]; that, or too little content before or
/// after cleaning, triggers a single retry through the dynamic fetcher when
/// the caller is entitled and a renderer is configured. Anything that goes
/// wrong in the dynamic state is terminal.
pub struct FetchEscalation {
    static_fetcher: Arc<dyn ContentFetcher>,
    dynamic_fetcher: Option<Arc<dyn ContentFetcher>>,
    cleaner: Arc<dyn ContentCleaner>,
    config: FetchConfig,
}

impl FetchEscalation {
    pub fn new(
        static_fetcher: Arc<dyn ContentFetcher>,
        cleaner: Arc<dyn ContentCleaner>,
        config: FetchConfig,
    ) -> Self {
        Self {
            static_fetcher,
            dynamic_fetcher: None,
            cleaner,
            config,
        }
    }

    pub fn with_dynamic_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.dynamic_fetcher = Some(fetcher);
        self
    }

    pub fn has_renderer(&self) -> bool {
        self.dynamic_fetcher.is_some()
    }

    pub async fn fetch(
        &self,
        url: &str,
        ctx: &ExtractContext,
        job_id: Option<JobId>,
        cancel: &CancellationToken,
    ) -> Result<FetchedContent, ExtractError> {
        let started = Instant::now();
        let mut state = EscalationState::Static;
        let mut retry_count = 0;

        loop {
            match self.step(state, url, ctx, job_id, cancel).await? {
                Step::Done(page, cleaned) => {
                    return Ok(FetchedContent {
                        page,
                        cleaned,
                        used_dynamic: state == EscalationState::Dynamic,
                        retry_count,
                        fetch_duration: started.elapsed(),
                    });
                }
                Step::Escalate(trigger) => match state {
                    EscalationState::Static => {
                        self.check_escalation(&trigger, ctx)?;
                        info!(url = %url, trigger = %trigger, "Escalating to dynamic fetch");
                        state = EscalationState::Dynamic;
                        retry_count += 1;
                    }
                    EscalationState::Dynamic => {
                        warn!(url = %url, trigger = %trigger, "Dynamic fetch did not help");
                        return Err(ExtractError::from_trigger(trigger));
                    }
                },
            }
        }
    }

    fn check_escalation(
        &self,
        trigger: &EscalationTrigger,
        ctx: &ExtractContext,
    ) -> Result<(), ExtractError> {
        if !ctx.dynamic_content_allowed {
            return Err(ConfigError::DynamicFetchNotEntitled {
                trigger: trigger.clone(),
            }
            .into());
        }
        if self.dynamic_fetcher.is_none() {
            return Err(ConfigError::DynamicFetchUnavailable {
                trigger: trigger.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn step(
        &self,
        state: EscalationState,
        url: &str,
        ctx: &ExtractContext,
        job_id: Option<JobId>,
        cancel: &CancellationToken,
    ) -> Result<Step, ExtractError> {
        let (fetcher, timeout) = match state {
            EscalationState::Static => (&self.static_fetcher, self.config.static_timeout),
            EscalationState::Dynamic => match &self.dynamic_fetcher {
                Some(fetcher) => (fetcher, self.config.dynamic_timeout),
                None => {
                    return Err(FetchError::UnsupportedMode {
                        fetcher: self.static_fetcher.name().to_string(),
                        mode: FetchMode::Dynamic,
                    }
                    .into())
                }
            },
        };

        let mode = state.mode();
        let opts = FetchOptions::new(ctx.user_id, ctx.tier)
            .with_job_id(job_id)
            .with_timeout(timeout);

        debug!(url = %url, mode = %mode, fetcher = fetcher.name(), "Fetching page");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
            result = tokio::time::timeout(timeout, fetcher.fetch(url, mode, &opts)) => result,
        };

        let page = match result {
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                }
                .into())
            }
            Ok(Err(FetchError::BotProtection {
                signal,
                message,
                suggest_dynamic,
            })) => {
                if !suggest_dynamic {
                    return Err(ExtractError::BotProtection { signal, message });
                }
                return Ok(Step::Escalate(EscalationTrigger::BotProtection { signal, message }));
            }
            Ok(Err(FetchError::Cancelled)) => return Err(ExtractError::Cancelled),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(page)) => page,
        };

        if page.html.len() < self.config.min_raw_bytes {
            return Ok(Step::Escalate(EscalationTrigger::InsufficientContent {
                stage: ContentStage::Raw,
                chars: page.html.len(),
                required: self.config.min_raw_bytes,
            }));
        }

        let cleaned = self.cleaner.clean(&page.html);
        let chars = cleaned.chars().count();
        if chars < self.config.min_cleaned_chars {
            return Ok(Step::Escalate(EscalationTrigger::InsufficientContent {
                stage: ContentStage::Cleaned,
                chars,
                required: self.config.min_cleaned_chars,
            }));
        }

        Ok(Step::Done(page, cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::CleanerChain;
    use crate::error::ErrorCategory;
    use crate::traits::fetcher::MockContentFetcher;
    use crate::types::Tier;
    use uuid::Uuid;

    const GOOD_PAGE: &str = "<html><body><p>Plenty of readable text lives on this page.</p></body></html>";

    fn config() -> FetchConfig {
        FetchConfig {
            min_raw_bytes: 20,
            min_cleaned_chars: 20,
            ..Default::default()
        }
    }

    fn ctx(dynamic: bool) -> ExtractContext {
        ExtractContext::new(Uuid::new_v4(), Tier::Pro).with_dynamic_content(dynamic)
    }

    fn ok_page(html: &'static str) -> MockContentFetcher {
        let mut fetcher = MockContentFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(move |url, mode, _| Ok(FetchedPage::new(html, url, mode)));
        fetcher.expect_name().return_const("mock".to_string());
        fetcher
    }

    fn blocked(suggest_dynamic: bool) -> MockContentFetcher {
        let mut fetcher = MockContentFetcher::new();
        fetcher.expect_fetch().times(1).returning(move |_, _, _| {
            Err(FetchError::BotProtection {
                signal: "cloudflare".into(),
                message: "blocked".into(),
                suggest_dynamic,
            })
        });
        fetcher.expect_name().return_const("mock".to_string());
        fetcher
    }

    fn escalation(static_fetcher: MockContentFetcher) -> FetchEscalation {
        FetchEscalation::new(
            Arc::new(static_fetcher),
            Arc::new(CleanerChain::standard()),
            config(),
        )
    }

    #[tokio::test]
    async fn test_static_success_does_not_escalate() {
        let content = escalation(ok_page(GOOD_PAGE))
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!content.used_dynamic);
        assert_eq!(content.retry_count, 0);
        assert!(content.cleaned.contains("readable text"));
    }

    #[tokio::test]
    async fn test_bot_protection_escalates_once() {
        let content = escalation(blocked(true))
            .with_dynamic_fetcher(Arc::new(ok_page(GOOD_PAGE)))
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(content.used_dynamic);
        assert_eq!(content.retry_count, 1);
        assert_eq!(content.page.mode, FetchMode::Dynamic);
    }

    #[tokio::test]
    async fn test_not_entitled_is_config_error() {
        let mut dynamic = MockContentFetcher::new();
        dynamic.expect_fetch().never();

        let err = escalation(blocked(true))
            .with_dynamic_fetcher(Arc::new(dynamic))
            .fetch("https://example.com", &ctx(false), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Config(ConfigError::DynamicFetchNotEntitled { .. })
        ));
        assert!(!err.should_fallback());
    }

    #[tokio::test]
    async fn test_no_renderer_is_config_error() {
        let err = escalation(ok_page("<p>tiny</p>"))
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Config(ConfigError::DynamicFetchUnavailable {
                trigger: EscalationTrigger::InsufficientContent {
                    stage: ContentStage::Raw,
                    ..
                }
            })
        ));
    }

    #[tokio::test]
    async fn test_protection_without_browser_recourse_is_terminal() {
        let mut dynamic = MockContentFetcher::new();
        dynamic.expect_fetch().never();

        let err = escalation(blocked(false))
            .with_dynamic_fetcher(Arc::new(dynamic))
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BotProtection);
    }

    #[tokio::test]
    async fn test_escalates_at_most_once() {
        // enough raw bytes, but almost nothing survives cleaning
        let thin = "<html><script>var a = 1; var b = 2;</script><p>Hi</p></html>";
        let err = escalation(ok_page(thin))
            .with_dynamic_fetcher(Arc::new(ok_page(thin)))
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::InsufficientContent {
                stage: ContentStage::Cleaned,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_plain_fetch_error_is_terminal() {
        let mut fetcher = MockContentFetcher::new();
        fetcher.expect_fetch().times(1).returning(|url, _, _| {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        });
        fetcher.expect_name().return_const("mock".to_string());

        let err = escalation(fetcher)
            .fetch("https://example.com", &ctx(true), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fetch);
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch_completes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut fetcher = MockContentFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|url, mode, _| Ok(FetchedPage::new(GOOD_PAGE, url, mode)));
        fetcher.expect_name().return_const("mock".to_string());

        let err = escalation(fetcher)
            .fetch("https://example.com", &ctx(true), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Cancelled));
    }
}
