//! Regex-based HTML to markdown conversion.

use lazy_static::lazy_static;
use regex::Regex;

use crate::traits::cleaner::ContentCleaner;

lazy_static! {
    static ref DROP_BLOCKS: Regex =
        Regex::new(r"(?is)<(script|style|noscript|svg|template|head)\b[^>]*>.*?</(script|style|noscript|svg|template|head)\s*>").unwrap();
    static ref COMMENTS: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    static ref H1: Regex = Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap();
    static ref H2: Regex = Regex::new(r"(?is)<h2[^>]*>(.*?)</h2>").unwrap();
    static ref H3: Regex = Regex::new(r"(?is)<h[3-6][^>]*>(.*?)</h[3-6]>").unwrap();
    static ref PARAGRAPH: Regex = Regex::new(r"(?is)<p[^>]*>(.*?)</p>").unwrap();
    static ref BREAK: Regex = Regex::new(r"(?i)<br\s*/?>").unwrap();
    static ref LINK: Regex =
        Regex::new(r#"(?is)<a[^>]*href=["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap();
    static ref LIST_ITEM: Regex = Regex::new(r"(?is)<li[^>]*>(.*?)</li>").unwrap();
    static ref TABLE_CELL: Regex = Regex::new(r"(?is)</t[dh]>").unwrap();
    static ref TABLE_ROW: Regex = Regex::new(r"(?is)</tr>").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref MULTI_NEWLINE: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref INLINE_SPACE: Regex = Regex::new(r"[ \t\u{a0}]+").unwrap();
}

/// Converts HTML to lightweight markdown.
///
/// Keeps headings, paragraphs, links, list items and table structure;
/// drops scripts, styles and every other tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlToMarkdown {
    keep_links: bool,
}

impl HtmlToMarkdown {
    pub fn new() -> Self {
        Self { keep_links: true }
    }

    /// Render links as plain text instead of `[text](href)`.
    pub fn without_links(mut self) -> Self {
        self.keep_links = false;
        self
    }
}

impl ContentCleaner for HtmlToMarkdown {
    fn clean(&self, html: &str) -> String {
        let text = DROP_BLOCKS.replace_all(html, "");
        let text = COMMENTS.replace_all(&text, "");

        let text = H1.replace_all(&text, "\n# $1\n");
        let text = H2.replace_all(&text, "\n## $1\n");
        let text = H3.replace_all(&text, "\n### $1\n");

        let text = PARAGRAPH.replace_all(&text, "$1\n\n");
        let text = BREAK.replace_all(&text, "\n");

        let text = if self.keep_links {
            LINK.replace_all(&text, "[$2]($1)")
        } else {
            LINK.replace_all(&text, "$2")
        };

        let text = LIST_ITEM.replace_all(&text, "- $1\n");
        let text = TABLE_CELL.replace_all(&text, " | ");
        let text = TABLE_ROW.replace_all(&text, "\n");

        let text = TAG.replace_all(&text, "");
        let text = MULTI_NEWLINE.replace_all(&text, "\n\n");

        decode_entities(&text).trim().to_string()
    }

    fn name(&self) -> &str {
        "html_to_markdown"
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Collapses runs of inline whitespace and blank lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceNormalizer;

impl ContentCleaner for WhitespaceNormalizer {
    fn clean(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut blank_run = 0;

        for line in text.lines() {
            let line = INLINE_SPACE.replace_all(line.trim(), " ");
            if line.is_empty() {
                blank_run += 1;
                if blank_run > 1 {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            out.push_str(&line);
            out.push('\n');
        }

        out.trim().to_string()
    }

    fn name(&self) -> &str {
        "whitespace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_links_and_lists() {
        let html = r#"<h2>Team</h2><ul><li>Ada</li><li><a href="/grace">Grace</a></li></ul>"#;
        let md = HtmlToMarkdown::new().clean(html);
        assert!(md.contains("## Team"));
        assert!(md.contains("- Ada"));
        assert!(md.contains("- [Grace](/grace)"));
    }

    #[test]
    fn test_without_links_keeps_text() {
        let md = HtmlToMarkdown::new()
            .without_links()
            .clean(r#"<a href="https://x.test">Docs</a>"#);
        assert_eq!(md, "Docs");
    }

    #[test]
    fn test_drops_scripts_styles_comments() {
        let html = "<style>p{}</style><!-- hidden --><SCRIPT>alert(1)</SCRIPT><p>visible</p>";
        assert_eq!(HtmlToMarkdown::new().clean(html), "visible");
    }

    #[test]
    fn test_entities_decoded_once() {
        let md = HtmlToMarkdown::new().clean("<p>Fish &amp; Chips &amp;lt;</p>");
        assert_eq!(md, "Fish & Chips &lt;");
    }

    #[test]
    fn test_table_cells_separated() {
        let md = HtmlToMarkdown::new()
            .clean("<table><tr><td>Plan</td><td>$5</td></tr><tr><td>Pro</td><td>$9</td></tr></table>");
        assert!(md.contains("Plan | $5 |"));
        assert!(md.contains("Pro | $9 |"));
    }

    #[test]
    fn test_whitespace_normalizer() {
        let text = "  a   b \t c  \n\n\n\n  d  ";
        assert_eq!(WhitespaceNormalizer.clean(text), "a b c\n\nd");
    }
}
