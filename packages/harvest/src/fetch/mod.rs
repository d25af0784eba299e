//! Reference fetchers and the protection detector.
//!
//! - `HttpFetcher`: static fetch over reqwest, runs the detector
//! - `BrowserFetcher`: dynamic fetch through a rendering service
//! - `ValidatedFetcher`: SSRF guard around any fetcher
//! - `RateLimitedFetcher`: governor quota around any fetcher

mod browser;
mod detector;
mod http;
mod rate_limited;
mod session;
mod validated;

pub use browser::BrowserFetcher;
pub use detector::HeuristicDetector;
pub use http::HttpFetcher;
pub use rate_limited::RateLimitedFetcher;
pub use session::{RenderSession, SessionKey, SessionStore};
pub use validated::ValidatedFetcher;
