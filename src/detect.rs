//! Content type detection.
//!
//! Stored content arrives as an untyped string that is either Markdown source or
//! pasted HTML source. Classification happens at render time: the detector counts
//! HTML and Markdown surface features and picks a type with a confidence score.
//! Uncertainty is never an error, only a lower confidence.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::debug;

/// How a content string should be treated by the rendering pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Markdown,
    HtmlSource,
}

/// Diagnostic feature breakdown behind a classification. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Features {
    pub html_tag_count: usize,
    pub inline_style_count: usize,
    pub complex_structure_count: usize,
    pub markdown_pattern_count: usize,
    pub html_density: f64,
    pub content_length: usize,
    pub has_css_classes: bool,
    pub has_ids: bool,
    pub has_data_attributes: bool,
    pub has_table_structure: bool,
    pub has_form_elements: bool,
    pub has_media_elements: bool,
    pub has_semantic_elements: bool,
    pub reason: &'static str,
}

/// Result of [`analyze`]: type, confidence in `0..=1`, and the raw signals.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub content_type: ContentType,
    pub confidence: f64,
    pub features: Features,
}

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*/?>").unwrap());

static INLINE_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r#"style\s*=\s*(['"])[^'"]*['"]|style\s*=\s*[^'"\s>][^\s>]*"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static COMPLEX_STRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(
        r"<(div|span|section|article|header|footer|aside|nav|main|figure|figcaption|details|summary)[^>]*>",
    )
    .case_insensitive(true)
    .build()
    .unwrap()
});

static CSS_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class\s*=\s*['"][^'"]*['"]"#).unwrap());
static ID_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"id\s*=\s*['"][^'"]*['"]"#).unwrap());
static DATA_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data-[a-zA-Z0-9-]+\s*=").unwrap());
static TABLE_STRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<table[^>]*>[\s\S]*</table>")
        .case_insensitive(true)
        .build()
        .unwrap()
});
static FORM_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<(form|input|select|textarea|button)[^>]*>")
        .case_insensitive(true)
        .build()
        .unwrap()
});
static MEDIA_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<(img|video|audio|canvas|svg)[^>]*>")
        .case_insensitive(true)
        .build()
        .unwrap()
});
static SEMANTIC_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<(article|section|nav|header|footer|aside|main)[^>]*>")
        .case_insensitive(true)
        .build()
        .unwrap()
});

static MD_HEADERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+[^\n]+$").unwrap());
static MD_CODE_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static MD_LINKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]\([^)]+\)").unwrap());
static MD_EMPHASIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*\*|__)[^*_\n]+(\*\*|__)|(\*|_)[^*_\n]+(\*|_)").unwrap()
});
static MD_UNORDERED_LISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*+]\s+").unwrap());
static MD_ORDERED_LISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+\.\s+").unwrap());
static MD_BLOCKQUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*>\s+").unwrap());
static MD_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\n]+`").unwrap());
static MD_INLINE_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[^$\n]+?\$").unwrap());
static MD_DISPLAY_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$[^$]+?\$\$").unwrap());

/// Classify a content string as Markdown or HTML source.
///
/// Empty input is not an error: it classifies as Markdown with full confidence,
/// which is the safe default for the rendering path.
pub fn analyze(content: &str) -> Detection {
    if content.trim().is_empty() {
        return Detection {
            content_type: ContentType::Markdown,
            confidence: 1.0,
            features: Features {
                reason: "empty_or_invalid_input",
                ..Features::default()
            },
        };
    }

    let features = collect_features(content);
    let detection = classify(features);
    debug!(
        content_type = ?detection.content_type,
        confidence = detection.confidence,
        reason = detection.features.reason,
        "content classified"
    );
    detection
}

fn collect_features(content: &str) -> Features {
    Features {
        html_tag_count: HTML_TAG.find_iter(content).count(),
        inline_style_count: INLINE_STYLE.find_iter(content).count(),
        complex_structure_count: COMPLEX_STRUCTURE.find_iter(content).count(),
        markdown_pattern_count: count_markdown_patterns(content),
        html_density: {
            let tags = HTML_TAG.find_iter(content).count() as f64;
            tags / (content.len() as f64 / 100.0).max(1.0)
        },
        content_length: content.len(),
        has_css_classes: CSS_CLASS.is_match(content),
        has_ids: ID_ATTR.is_match(content),
        has_data_attributes: DATA_ATTR.is_match(content),
        has_table_structure: TABLE_STRUCTURE.is_match(content),
        has_form_elements: FORM_ELEMENTS.is_match(content),
        has_media_elements: MEDIA_ELEMENTS.is_match(content),
        has_semantic_elements: SEMANTIC_ELEMENTS.is_match(content),
        reason: "",
    }
}

fn count_markdown_patterns(content: &str) -> usize {
    MD_HEADERS.find_iter(content).count()
        + MD_CODE_BLOCKS.find_iter(content).count()
        + MD_LINKS.find_iter(content).count()
        + MD_EMPHASIS.find_iter(content).count()
        + MD_UNORDERED_LISTS.find_iter(content).count()
        + MD_ORDERED_LISTS.find_iter(content).count()
        + MD_BLOCKQUOTES.find_iter(content).count()
        + MD_INLINE_CODE.find_iter(content).count()
        + MD_INLINE_MATH.find_iter(content).count()
        + MD_DISPLAY_MATH.find_iter(content).count()
}

fn classify(mut features: Features) -> Detection {
    let html_score = html_feature_score(&features);
    let markdown_score = markdown_feature_score(&features);

    if has_strong_html_indicators(&features) {
        features.reason = "strong_html_features";
        return Detection {
            content_type: ContentType::HtmlSource,
            confidence: (0.7 + html_score * 0.25).min(0.95),
            features,
        };
    }

    if html_score > markdown_score && features.html_tag_count > 3 {
        features.reason = "moderate_html_features";
        return Detection {
            content_type: ContentType::HtmlSource,
            confidence: (0.6 + html_score * 0.2).min(0.8),
            features,
        };
    }

    features.reason = "markdown_or_mixed_content";
    Detection {
        content_type: ContentType::Markdown,
        confidence: (0.75 + markdown_score * 0.05).min(0.95),
        features,
    }
}

fn has_strong_html_indicators(f: &Features) -> bool {
    // Inline styles together with complex layout structure.
    if f.inline_style_count > 0 && f.complex_structure_count > 2 {
        return true;
    }
    // Classes/ids combined with more than one tag per 50 bytes of content.
    if (f.has_css_classes || f.has_ids) && f.html_tag_count * 50 > f.content_length {
        return true;
    }
    if f.has_table_structure || f.has_form_elements || f.has_media_elements {
        return true;
    }
    if f.has_semantic_elements && f.markdown_pattern_count < 3 {
        return true;
    }
    false
}

fn html_feature_score(f: &Features) -> f64 {
    let mut score = 0.0;
    score += (f.inline_style_count as f64 * 0.3).min(2.0);
    score += (f.complex_structure_count as f64 * 0.2).min(1.5);
    score += (f.html_density * 0.1).min(1.0);
    for present in [
        f.has_css_classes,
        f.has_ids,
        f.has_data_attributes,
        f.has_table_structure,
        f.has_form_elements,
        f.has_media_elements,
        f.has_semantic_elements,
    ] {
        if present {
            score += 0.3;
        }
    }
    score.min(5.0)
}

fn markdown_feature_score(f: &Features) -> f64 {
    (f.markdown_pattern_count as f64 * 0.2).min(3.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prose_is_markdown() {
        let d = analyze("Just a short paragraph about nothing in particular.");
        assert_eq!(d.content_type, ContentType::Markdown);
        assert!(d.confidence >= 0.75);
    }

    #[test]
    fn markdown_document_is_markdown() {
        let d = analyze("# Title\n\nSome **bold** text, a [link](https://example.com),\n\n- one\n- two\n\n```rust\nfn main() {}\n```\n");
        assert_eq!(d.content_type, ContentType::Markdown);
        assert!(d.features.markdown_pattern_count >= 4);
    }

    #[test]
    fn table_markup_is_html_source() {
        let d = analyze("<table><tr><td>cell</td></tr></table>");
        assert_eq!(d.content_type, ContentType::HtmlSource);
        assert_eq!(d.features.reason, "strong_html_features");
    }

    #[test]
    fn short_classed_markup_is_html_source() {
        // 2 tags in under 100 bytes clears the one-per-50 density bar.
        let d = analyze("<p class=\"note\">short styled note</p>");
        assert_eq!(d.content_type, ContentType::HtmlSource);
        assert_eq!(d.features.reason, "strong_html_features");
    }

    #[test]
    fn media_elements_are_html_source() {
        let d = analyze("Look: <img src=\"/a.png\" alt=\"a\"> and more text here");
        assert_eq!(d.content_type, ContentType::HtmlSource);
    }

    #[test]
    fn styled_layout_is_html_source() {
        let html = r#"<div style="color:red"><div class="row"><span style="font-weight:bold">x</span><div>y</div></div></div>"#;
        let d = analyze(html);
        assert_eq!(d.content_type, ContentType::HtmlSource);
        assert!(d.confidence >= 0.7 && d.confidence <= 0.95);
    }

    #[test]
    fn empty_input_is_markdown_with_full_confidence() {
        let d = analyze("");
        assert_eq!(d.content_type, ContentType::Markdown);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.features.reason, "empty_or_invalid_input");
    }

    #[test]
    fn math_heavy_prose_stays_markdown() {
        let d = analyze("When $E=mc^2$ holds, we also have $$\\int_0^1 x\\,dx = \\frac{1}{2}$$ in context.");
        assert_eq!(d.content_type, ContentType::Markdown);
    }
}
