//! Fetch-side types shared by fetchers, detectors and the escalation process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::types::{JobId, Tier, UserId};

/// How a page is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Plain HTTP, no JavaScript
    Static,
    /// Browser-rendered through the rendering service
    Dynamic,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        })
    }
}

/// Per-fetch options. The (user, tier, job) triple keys rendering sessions.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub user_id: UserId,
    pub tier: Tier,
    pub job_id: Option<JobId>,
    pub timeout: Duration,
}

impl FetchOptions {
    pub fn new(user_id: UserId, tier: Tier) -> Self {
        Self {
            user_id,
            tier,
            job_id: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_job_id(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    /// URL after redirects
    pub final_url: String,
    pub status: u16,
    /// Lowercased response headers
    pub headers: HashMap<String, String>,
    pub mode: FetchMode,
}

impl FetchedPage {
    pub fn new(html: impl Into<String>, final_url: impl Into<String>, mode: FetchMode) -> Self {
        Self {
            html: html.into(),
            final_url: final_url.into(),
            status: 200,
            headers: HashMap::new(),
            mode,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Result of running a protection detector over a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub detected: bool,
    /// Whether a real browser is likely to get through
    pub suggest_dynamic: bool,
    pub signal: String,
    pub user_message: String,
}

impl Detection {
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn blocked(
        signal: impl Into<String>,
        suggest_dynamic: bool,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            detected: true,
            suggest_dynamic,
            signal: signal.into(),
            user_message: user_message.into(),
        }
    }
}

/// Point at which content volume was measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStage {
    Raw,
    Cleaned,
}

impl fmt::Display for ContentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Raw => "fetch",
            Self::Cleaned => "cleaning",
        })
    }
}

/// Why a static fetch wants to escalate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationTrigger {
    BotProtection {
        signal: String,
        message: String,
    },
    InsufficientContent {
        stage: ContentStage,
        chars: usize,
        required: usize,
    },
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BotProtection { signal, .. } => write!(f, "bot protection: {signal}"),
            Self::InsufficientContent {
                stage,
                chars,
                required,
            } => write!(
                f,
                "insufficient content after {stage}: {chars} of {required} chars"
            ),
        }
    }
}
