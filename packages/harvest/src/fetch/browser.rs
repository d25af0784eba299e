//! Dynamic fetcher backed by a browser-rendering service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult};
use crate::fetch::session::{SessionKey, SessionStore};
use crate::security::SecretString;
use crate::traits::detector::ProtectionDetector;
use crate::traits::fetcher::ContentFetcher;
use crate::types::{FetchMode, FetchOptions, FetchedPage, JobId, Tier, UserId};

/// Renders pages in a remote headless browser.
///
/// Talks to a JSON render endpoint (`POST {base}/render`). Sessions are
/// pinned per (user, tier, job) through a [`SessionStore`], and the
/// identity triple is forwarded for billing attribution. Session lifecycle
/// and captcha solving are the service's concern.
pub struct BrowserFetcher {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    sessions: Arc<SessionStore>,
    detector: Option<Arc<dyn ProtectionDetector>>,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    user_id: UserId,
    tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<JobId>,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct RenderResponse {
    success: bool,
    html: Option<String>,
    final_url: Option<String>,
    status_code: Option<u16>,
    session_id: Option<String>,
    error: Option<String>,
}

impl BrowserFetcher {
    pub fn new(base_url: impl Into<String>) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            sessions: Arc::new(SessionStore::default()),
            detector: None,
        })
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Share a session store with other fetchers.
    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Check rendered pages for protection that survived the browser.
    pub fn with_detector(mut self, detector: Arc<dyn ProtectionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}

#[async_trait]
impl ContentFetcher for BrowserFetcher {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        if mode != FetchMode::Dynamic {
            return Err(FetchError::UnsupportedMode {
                fetcher: self.name().to_string(),
                mode,
            });
        }

        let key = SessionKey::new(opts.user_id, opts.tier, opts.job_id);
        let session_id = self.sessions.session_for(&key);
        let request = RenderRequest {
            url,
            session_id: session_id.clone(),
            user_id: opts.user_id,
            tier: opts.tier,
            job_id: opts.job_id,
            timeout_ms: opts.timeout.as_millis() as u64,
        };

        debug!(url = %url, session = ?session_id, "Rendering page");
        let mut builder = self
            .client
            .post(format!("{}/render", self.base_url))
            .timeout(opts.timeout + Duration::from_secs(5))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Renderer(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if session_id.is_some() {
                self.sessions.invalidate(&key);
            }
            return Err(FetchError::Renderer(format!("HTTP {status}: {body}")));
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Renderer(format!("invalid response: {e}")))?;

        if !rendered.success {
            self.sessions.invalidate(&key);
            return Err(FetchError::Renderer(
                rendered.error.unwrap_or_else(|| "render failed".to_string()),
            ));
        }

        if let Some(id) = rendered.session_id {
            self.sessions.record(key, id);
        }

        let html = rendered.html.unwrap_or_default();
        let status = rendered.status_code.unwrap_or(200);

        if let Some(detector) = &self.detector {
            let detection = detector.detect(status, &Default::default(), &html);
            if detection.detected {
                warn!(url = %url, signal = %detection.signal, "Protection persisted after rendering");
                return Err(FetchError::BotProtection {
                    signal: detection.signal,
                    message: detection.user_message,
                    suggest_dynamic: false,
                });
            }
        }

        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        Ok(FetchedPage {
            html,
            final_url: rendered.final_url.unwrap_or_else(|| url.to_string()),
            status,
            headers: Default::default(),
            mode,
        })
    }

    fn name(&self) -> &str {
        "browser"
    }
}
