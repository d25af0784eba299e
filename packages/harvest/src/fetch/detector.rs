//! Heuristic anti-bot detection.

use std::collections::HashMap;

use crate::traits::detector::ProtectionDetector;
use crate::types::Detection;

/// Bodies larger than this are real pages unless the status says otherwise.
const CHALLENGE_PAGE_MAX_BYTES: usize = 20_000;

struct BodyMarker {
    needle: &'static str,
    signal: &'static str,
    suggest_dynamic: bool,
}

const BODY_MARKERS: &[BodyMarker] = &[
    BodyMarker {
        needle: "cf-browser-verification",
        signal: "cloudflare_challenge",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "challenge-platform",
        signal: "cloudflare_challenge",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "just a moment...",
        signal: "cloudflare_challenge",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "attention required! | cloudflare",
        signal: "cloudflare_block",
        suggest_dynamic: false,
    },
    BodyMarker {
        needle: "captcha-delivery.com",
        signal: "datadome",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "px-captcha",
        signal: "perimeterx",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "_incapsula_resource",
        signal: "incapsula",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "g-recaptcha",
        signal: "captcha",
        suggest_dynamic: false,
    },
    BodyMarker {
        needle: "h-captcha",
        signal: "captcha",
        suggest_dynamic: false,
    },
    BodyMarker {
        needle: "please enable javascript",
        signal: "javascript_required",
        suggest_dynamic: true,
    },
    BodyMarker {
        needle: "you need to enable javascript",
        signal: "javascript_required",
        suggest_dynamic: true,
    },
];

/// Detects common anti-bot systems from status, headers and body markers.
///
/// Body markers only count on small pages or error statuses, so a normal
/// page that embeds a captcha widget is not flagged.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub fn new() -> Self {
        Self
    }

    fn message(signal: &str, suggest_dynamic: bool) -> String {
        if suggest_dynamic {
            format!("The site is protected by an anti-bot check ({signal}) that requires browser rendering.")
        } else {
            format!("The site blocked automated access ({signal}).")
        }
    }
}

impl ProtectionDetector for HeuristicDetector {
    fn detect(&self, status: u16, headers: &HashMap<String, String>, body: &str) -> Detection {
        let header = |name: &str| headers.get(name).map(|v| v.to_ascii_lowercase());

        if header("cf-mitigated").as_deref() == Some("challenge") {
            return Detection::blocked(
                "cloudflare_challenge",
                true,
                Self::message("cloudflare_challenge", true),
            );
        }

        let server = header("server").unwrap_or_default();
        if matches!(status, 403 | 503) && server.contains("cloudflare") {
            return Detection::blocked(
                "cloudflare_challenge",
                true,
                Self::message("cloudflare_challenge", true),
            );
        }
        if status == 403 && server.contains("akamaighost") {
            return Detection::blocked("akamai", true, Self::message("akamai", true));
        }
        if header("x-datadome").is_some() && status >= 400 {
            return Detection::blocked("datadome", true, Self::message("datadome", true));
        }

        if status >= 400 || body.len() <= CHALLENGE_PAGE_MAX_BYTES {
            let lower = body.to_ascii_lowercase();
            if let Some(marker) = BODY_MARKERS.iter().find(|m| lower.contains(m.needle)) {
                return Detection::blocked(
                    marker.signal,
                    marker.suggest_dynamic,
                    Self::message(marker.signal, marker.suggest_dynamic),
                );
            }
        }

        if status == 429 {
            return Detection::blocked("rate_limited", false, Self::message("rate_limited", false));
        }

        Detection::clear()
    }
}
