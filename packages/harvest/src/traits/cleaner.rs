//! Content cleaning.

/// Turns fetched HTML into text suitable for a prompt. Cleaners compose
/// through [`CleanerChain`](crate::clean::CleanerChain).
pub trait ContentCleaner: Send + Sync {
    fn clean(&self, html: &str) -> String;

    fn name(&self) -> &str;
}
