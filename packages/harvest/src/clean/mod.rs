//! Reference content cleaners.

mod html;

pub use html::{HtmlToMarkdown, WhitespaceNormalizer};

use crate::traits::cleaner::ContentCleaner;

/// Runs cleaners in sequence, feeding each the previous output.
#[derive(Default)]
pub struct CleanerChain {
    cleaners: Vec<Box<dyn ContentCleaner>>,
}

impl CleanerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTML to markdown, then whitespace normalization.
    pub fn standard() -> Self {
        Self::new()
            .then(HtmlToMarkdown::new())
            .then(WhitespaceNormalizer)
    }

    pub fn then(mut self, cleaner: impl ContentCleaner + 'static) -> Self {
        self.cleaners.push(Box::new(cleaner));
        self
    }

    pub fn len(&self) -> usize {
        self.cleaners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleaners.is_empty()
    }
}

impl ContentCleaner for CleanerChain {
    fn clean(&self, html: &str) -> String {
        self.cleaners
            .iter()
            .fold(html.to_string(), |text, cleaner| cleaner.clean(&text))
    }

    fn name(&self) -> &str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl ContentCleaner for Upper {
        fn clean(&self, html: &str) -> String {
            html.to_uppercase()
        }

        fn name(&self) -> &str {
            "upper"
        }
    }

    #[test]
    fn test_chain_applies_in_order() {
        let chain = CleanerChain::new().then(HtmlToMarkdown::new()).then(Upper);
        assert_eq!(chain.clean("<p>hello</p>"), "HELLO");
    }

    #[test]
    fn test_empty_chain_is_identity() {
        assert_eq!(CleanerChain::new().clean("<b>x</b>"), "<b>x</b>");
    }

    #[test]
    fn test_standard_chain() {
        let html = "<html><head><title>T</title><script>var x = 1;</script></head>\
                    <body><h1>Pricing</h1>\n\n\n\n<p>Plans   start at   $10.</p></body></html>";
        let text = CleanerChain::standard().clean(html);
        assert!(text.contains("# Pricing"));
        assert!(text.contains("Plans start at $10."));
        assert!(!text.contains("var x"));
    }
}
