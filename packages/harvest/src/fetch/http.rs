//! Static HTTP fetcher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::error::{FetchError, FetchResult};
use crate::fetch::HeuristicDetector;
use crate::traits::detector::ProtectionDetector;
use crate::traits::fetcher::ContentFetcher;
use crate::types::{FetchMode, FetchOptions, FetchedPage};

/// Fetches pages over plain HTTP without running JavaScript.
///
/// The protection detector runs before the status check, so a challenge
/// page served with 403/503 surfaces as bot protection instead of a plain
/// status error. Bodies are read in chunks and cut off at
/// `max_body_bytes`.
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    detector: Arc<dyn ProtectionDetector>,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new() -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        Ok(Self {
            client,
            user_agent: concat!("Mozilla/5.0 (compatible; harvest/", env!("CARGO_PKG_VERSION"), ")")
                .to_string(),
            detector: Arc::new(HeuristicDetector),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProtectionDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        if mode != FetchMode::Static {
            return Err(FetchError::UnsupportedMode {
                fetcher: self.name().to_string(),
                mode,
            });
        }
        url::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;

        debug!(url = %url, "HTTP fetch starting");
        let mut response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .timeout(opts.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport(url, e))?
        {
            if !append_capped(&mut body, &chunk, self.max_body_bytes) {
                truncated = true;
                break;
            }
        }
        if truncated {
            warn!(url = %url, limit = self.max_body_bytes, "Response body truncated");
        }
        let html = String::from_utf8_lossy(&body).into_owned();

        let detection = self.detector.detect(status.as_u16(), &headers, &html);
        if detection.detected {
            warn!(url = %url, status = status.as_u16(), signal = %detection.signal, "Bot protection detected");
            return Err(FetchError::BotProtection {
                signal: detection.signal,
                message: detection.user_message,
                suggest_dynamic: detection.suggest_dynamic,
            });
        }

        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(url = %url, final_url = %final_url, bytes = html.len(), "HTTP fetch complete");
        Ok(FetchedPage {
            html,
            final_url,
            status: status.as_u16(),
            headers,
            mode,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Append `chunk` without letting `body` grow past `cap`. Returns false
/// once the cap is hit.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(body.len());
    if chunk.len() > room {
        body.extend_from_slice(&chunk[..room]);
        return false;
    }
    body.extend_from_slice(chunk);
    true
}

fn classify_transport(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Http(Box::new(e))
    }
}
