//! Plain-text summary extraction.
//!
//! Turns either content type into a short, length-bounded teaser: markup and
//! syntax stripped, entities decoded, whitespace collapsed, truncated at a
//! word/sentence boundary. The contract is best-effort and total: whatever
//! happens internally, the caller gets a string no longer than requested.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Node};
use serde::Deserialize;
use tracing::warn;

use crate::detect::{self, ContentType};

/// Which extraction strategy to use; `Auto` runs the detector first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Auto,
    Markdown,
    HtmlSource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryOptions {
    /// Keep single line breaks instead of flattening everything to one line.
    pub preserve_line_breaks: bool,
    pub remove_code_blocks: bool,
    /// Drop link text entirely instead of keeping it inline.
    pub remove_link_texts: bool,
    pub smart_truncation: bool,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            preserve_line_breaks: false,
            remove_code_blocks: true,
            remove_link_texts: false,
            smart_truncation: true,
        }
    }
}

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`\n]+`").unwrap());
static IMAGE_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static LINK_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static HEADING_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s*").unwrap());
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*_]{1,2}([^*_\n]+)[*_]{1,2}").unwrap());
static STRIKETHROUGH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~([^~\n]+)~~").unwrap());
static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*+]\s+").unwrap());
static ORDERED_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\d+\.\s+").unwrap());
static BLOCKQUOTE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*>\s*").unwrap());
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[-*_]{3,}\s*$").unwrap());
static LEADING_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\w\x{4e00}-\x{9fff}]+").unwrap());

/// Extract a bounded plain-text summary from Markdown or HTML source.
///
/// Never fails: an internal panic degrades to the crudest strip-and-cut
/// transform, and the result is always at most `max_length` characters.
pub fn extract_summary(
    content: &str,
    source: SummarySource,
    max_length: usize,
    options: &SummaryOptions,
) -> String {
    if content.trim().is_empty() {
        return String::new();
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        extract_inner(content, source, max_length, options)
    }));
    match result {
        Ok(summary) => summary,
        Err(_) => {
            warn!("summary extraction panicked, using crude fallback");
            fallback_extraction(content, max_length)
        }
    }
}

fn extract_inner(
    content: &str,
    source: SummarySource,
    max_length: usize,
    options: &SummaryOptions,
) -> String {
    let content_type = match source {
        SummarySource::Markdown => ContentType::Markdown,
        SummarySource::HtmlSource => ContentType::HtmlSource,
        SummarySource::Auto => detect::analyze(content).content_type,
    };

    let text = match content_type {
        ContentType::HtmlSource => extract_from_html(content, options),
        ContentType::Markdown => extract_from_markdown(content, options),
    };

    let processed = process_extracted(&text, max_length, options);
    final_cleanup(&processed, max_length)
}

/// Structural extraction: walk the parsed DOM and take text content, skipping
/// scripts, styles, hidden elements, and (optionally) code regions.
fn extract_from_html(html: &str, options: &SummaryOptions) -> String {
    let doc = Html::parse_fragment(html);
    let mut text = String::new();
    collect_text(doc.tree.root(), options, &mut text);
    text
}

fn collect_text(
    node: ego_tree::NodeRef<'_, Node>,
    options: &SummaryOptions,
    out: &mut String,
) {
    for child in node.children() {
        match child.value() {
            Node::Text(t) => {
                out.push_str(&t.text);
                out.push(' ');
            }
            Node::Element(el) => {
                let name = el.name();
                if matches!(name, "script" | "style" | "noscript") {
                    continue;
                }
                if options.remove_code_blocks && matches!(name, "pre" | "code") {
                    continue;
                }
                if is_hidden(el) {
                    continue;
                }
                collect_text(child, options, out);
            }
            _ => {}
        }
    }
}

fn is_hidden(el: &scraper::node::Element) -> bool {
    if el.attr("hidden").is_some() {
        return true;
    }
    if el
        .attr("class")
        .is_some_and(|c| c.split_whitespace().any(|c| c == "hidden"))
    {
        return true;
    }
    el.attr("style").is_some_and(|s| {
        s.replace(' ', "").to_ascii_lowercase().contains("display:none")
    })
}

fn extract_from_markdown(markdown: &str, options: &SummaryOptions) -> String {
    // Markdown can embed raw HTML; drop the tags but keep their text.
    let mut text = TAG.replace_all(markdown, " ").into_owned();
    text = remove_markdown_syntax(&text, options);
    decode_entities(&text)
}

fn remove_markdown_syntax(text: &str, options: &SummaryOptions) -> String {
    let mut text = text.to_string();
    if options.remove_code_blocks {
        text = FENCED_CODE.replace_all(&text, " ").into_owned();
        text = INLINE_CODE.replace_all(&text, " ").into_owned();
    }
    text = IMAGE_SYNTAX.replace_all(&text, "$1").into_owned();
    if options.remove_link_texts {
        text = LINK_SYNTAX.replace_all(&text, "").into_owned();
    } else {
        text = LINK_SYNTAX.replace_all(&text, "$1").into_owned();
    }
    text = HEADING_MARKER.replace_all(&text, "").into_owned();
    text = EMPHASIS.replace_all(&text, "$1").into_owned();
    text = STRIKETHROUGH.replace_all(&text, "$1").into_owned();
    text = LIST_MARKER.replace_all(&text, "").into_owned();
    text = ORDERED_MARKER.replace_all(&text, "").into_owned();
    text = BLOCKQUOTE_MARKER.replace_all(&text, "").into_owned();
    text = HORIZONTAL_RULE.replace_all(&text, " ").into_owned();
    text
}

/// Decode HTML entities, keeping the original text when decoding fails on a
/// stray ampersand or malformed sequence.
fn decode_entities(text: &str) -> String {
    htmlescape::decode_html(text).unwrap_or_else(|_| text.to_string())
}

fn process_extracted(text: &str, max_length: usize, options: &SummaryOptions) -> String {
    let text = normalize_whitespace(text, options.preserve_line_breaks);
    truncate(&text, max_length, options.smart_truncation)
}

fn normalize_whitespace(text: &str, preserve_line_breaks: bool) -> String {
    if !preserve_line_breaks {
        return text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Character-counted truncation. Smart mode backs off from 80% of the target
/// to the nearest word or sentence boundary before appending an ellipsis.
fn truncate(text: &str, max_length: usize, smart: bool) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_length {
        return text.to_string();
    }
    if max_length <= 3 {
        return chars[..max_length].iter().collect();
    }

    let cut = max_length - 3;
    if smart {
        const BREAK_POINTS: &[char] = &[
            ' ', '。', '，', '！', '？', '.', ',', '!', '?', ';', ':',
        ];
        let floor = (cut as f64 * 0.8) as usize;
        for i in (floor..cut).rev() {
            if BREAK_POINTS.contains(&chars[i]) {
                let head: String = chars[..i].iter().collect();
                return format!("{}...", head.trim_end());
            }
        }
    }
    let head: String = chars[..cut].iter().collect();
    format!("{head}...")
}

fn final_cleanup(text: &str, max_length: usize) -> String {
    let mut text = text.trim().to_string();
    text = LEADING_PUNCTUATION.replace(&text, "").into_owned();
    let count = text.chars().count();
    if count > max_length {
        let cut = max_length.saturating_sub(3);
        let head: String = text.chars().take(cut).collect();
        text = format!("{head}...");
    }
    text
}

/// Crudest possible transform, used when everything else went wrong.
fn fallback_extraction(content: &str, max_length: usize) -> String {
    let text = TAG.replace_all(content, " ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() > max_length {
        let cut = max_length.saturating_sub(3);
        let head: String = text.chars().take(cut).collect();
        format!("{head}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(content: &str, source: SummarySource, max: usize) -> String {
        extract_summary(content, source, max, &SummaryOptions::default())
    }

    #[test]
    fn script_content_is_excluded() {
        let out = extract(
            "<script>alert(1)</script><p>Hello world</p>",
            SummarySource::HtmlSource,
            20,
        );
        assert!(!out.contains("alert"));
        assert!(out.starts_with("Hello world"));
    }

    #[test]
    fn markdown_syntax_is_stripped() {
        let out = extract(
            "# Title\n\nSome **bold** text with a [link](https://example.com) and `code`.",
            SummarySource::Markdown,
            200,
        );
        assert!(out.contains("Title"));
        assert!(out.contains("bold"));
        assert!(out.contains("link"));
        assert!(!out.contains("**"));
        assert!(!out.contains("]("));
        assert!(!out.contains('`'));
    }

    #[test]
    fn image_becomes_alt_text() {
        let out = extract("![a diagram](/img/d.png) explains it", SummarySource::Markdown, 100);
        assert!(out.starts_with("a diagram"));
        assert!(!out.contains("/img/d.png"));
    }

    #[test]
    fn length_bound_holds() {
        let long = "word ".repeat(200);
        for max in [4usize, 10, 50, 150] {
            let out = extract(&long, SummarySource::Markdown, max);
            assert!(
                out.chars().count() <= max,
                "len {} exceeded max {}",
                out.chars().count(),
                max
            );
        }
    }

    #[test]
    fn smart_truncation_ends_cleanly() {
        let text = "The quick brown fox jumps over the lazy dog and keeps on running far away.";
        let out = extract(text, SummarySource::Markdown, 30);
        assert!(out.ends_with("..."));
        // The cut lands on a word boundary, so no split fragment remains.
        let body = out.trim_end_matches("...");
        assert!(text.contains(body.trim_end()));
        assert!(!body.ends_with(char::is_whitespace));
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = extract(
            "# Heading\n\nA paragraph that is fairly long and will be truncated somewhere sensible.",
            SummarySource::Markdown,
            40,
        );
        let second = extract(&first, SummarySource::Markdown, 40);
        assert_eq!(first, second);
    }

    #[test]
    fn preserve_line_breaks_keeps_single_newlines() {
        let content = "First line.\n\nSecond line.";
        let options = SummaryOptions {
            preserve_line_breaks: true,
            ..SummaryOptions::default()
        };
        let out = extract_summary(content, SummarySource::Markdown, 100, &options);
        assert_eq!(out, "First line.\nSecond line.");

        let flat = extract_summary(content, SummarySource::Markdown, 100, &SummaryOptions::default());
        assert!(!flat.contains('\n'));
    }

    #[test]
    fn remove_link_texts_drops_linked_words() {
        let options = SummaryOptions {
            remove_link_texts: true,
            ..SummaryOptions::default()
        };
        let out = extract_summary(
            "Read [the docs](https://example.com) now",
            SummarySource::Markdown,
            100,
            &options,
        );
        assert_eq!(out, "Read now");
    }

    #[test]
    fn hidden_elements_are_skipped() {
        let out = extract(
            "<div style=\"display: none\">secret</div><p class=\"hidden\">also secret</p><p>visible</p>",
            SummarySource::HtmlSource,
            50,
        );
        assert!(!out.contains("secret"));
        assert!(out.contains("visible"));
    }

    #[test]
    fn code_blocks_are_removed_by_default() {
        let out = extract(
            "Intro text\n\n```rust\nfn hidden() {}\n```\n\nmore prose",
            SummarySource::Markdown,
            100,
        );
        assert!(!out.contains("hidden"));
        assert!(out.contains("Intro text"));
        assert!(out.contains("more prose"));
    }

    #[test]
    fn entities_are_decoded() {
        let out = extract("Fish &amp; chips &quot;today&quot;", SummarySource::Markdown, 100);
        assert!(out.contains("Fish & chips \"today\""));
    }

    #[test]
    fn auto_detection_routes_html() {
        let out = extract(
            "<table><tr><td>cell text</td></tr></table><p>after table</p>",
            SummarySource::Auto,
            60,
        );
        assert!(out.contains("cell text"));
        assert!(!out.contains("<td>"));
    }

    #[test]
    fn empty_input_gives_empty_summary() {
        assert_eq!(extract("", SummarySource::Auto, 100), "");
    }

    #[test]
    fn leading_punctuation_is_stripped() {
        let out = extract("...! starts oddly but continues fine", SummarySource::Markdown, 100);
        assert!(out.starts_with("starts oddly"));
    }
}
