//! Anti-bot protection detection.

use std::collections::HashMap;

use crate::types::Detection;

/// Inspects a response for signs of an anti-bot challenge.
pub trait ProtectionDetector: Send + Sync {
    /// `headers` keys are lowercase.
    fn detect(&self, status: u16, headers: &HashMap<String, String>, body: &str) -> Detection;
}
