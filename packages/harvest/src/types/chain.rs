//! The ordered list of backends one request may try.

use std::sync::Arc;

use crate::types::LlmBackendConfig;

/// Candidates for one request, consumed front to back.
///
/// The backing list never changes after construction; progress is tracked
/// by a separate position so "already tried" and "not yet tried" are
/// always distinguishable. A BYOK chain holds exactly one entry.
#[derive(Debug, Clone)]
pub struct ConfigChain {
    entries: Arc<[LlmBackendConfig]>,
    is_byok: bool,
    position: usize,
}

impl ConfigChain {
    /// A chain with nothing to try.
    pub fn empty() -> Self {
        Self::service(Vec::new())
    }

    /// A chain backed by service keys.
    pub fn service(entries: Vec<LlmBackendConfig>) -> Self {
        Self {
            entries: entries.into(),
            is_byok: false,
            position: 0,
        }
    }

    /// A single-entry chain using the caller's own backend.
    pub fn byok(entry: LlmBackendConfig) -> Self {
        Self {
            entries: Arc::from(vec![entry]),
            is_byok: true,
            position: 0,
        }
    }

    /// A single-entry chain on a service key that must not fall back.
    pub fn pinned(entry: LlmBackendConfig) -> Self {
        Self::service(vec![entry])
    }

    pub fn is_byok(&self) -> bool {
        self.is_byok
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LlmBackendConfig] {
        &self.entries
    }

    pub fn first(&self) -> Option<&LlmBackendConfig> {
        self.entries.first()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Entries already handed out.
    pub fn consumed(&self) -> &[LlmBackendConfig] {
        &self.entries[..self.position]
    }

    /// Entries not yet handed out.
    pub fn remaining(&self) -> &[LlmBackendConfig] {
        &self.entries[self.position..]
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.entries.len()
    }
}

impl Iterator for ConfigChain {
    type Item = LlmBackendConfig;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.position)?.clone();
        self.position += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining().len();
        (n, Some(n))
    }
}

impl ExactSizeIterator for ConfigChain {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    fn entry(model: &str) -> LlmBackendConfig {
        LlmBackendConfig::new(Provider::OpenAi, model)
    }

    #[test]
    fn test_chain_consumes_in_order_once() {
        let mut chain = ConfigChain::service(vec![entry("a"), entry("b")]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.next().map(|c| c.model), Some("a".to_string()));
        assert_eq!(chain.consumed().len(), 1);
        assert_eq!(chain.remaining()[0].model, "b");
        assert_eq!(chain.next().map(|c| c.model), Some("b".to_string()));
        assert!(chain.next().is_none());
        assert!(chain.is_exhausted());
        // the backing list is untouched
        assert_eq!(chain.entries().len(), 2);
    }

    #[test]
    fn test_byok_chain_has_one_entry() {
        let chain = ConfigChain::byok(entry("mine"));
        assert!(chain.is_byok());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_clone_keeps_position_independent() {
        let mut chain = ConfigChain::service(vec![entry("a"), entry("b")]);
        let snapshot = chain.clone();
        chain.next();
        assert_eq!(snapshot.position(), 0);
        assert_eq!(chain.position(), 1);
    }
}
