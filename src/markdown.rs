//! Markdown rendering pipeline.
//!
//! One configurable pipeline: pulldown-cmark with raw-HTML pass-through and
//! typographic substitution, KaTeX for `$...$` / `$$...$$` (plus `\(...\)` /
//! `\[...\]` when enabled), syntect for fenced code, and custom rendering for
//! images (lazy/responsive), tables (scroll wrapper) and headings (slugged
//! anchors). Every failure degrades: a bad formula becomes an error span, a bad
//! or unknown code block becomes an escaped `<pre>`, and a pipeline-level
//! failure wraps the escaped original input, so the caller always gets HTML back.

use std::borrow::Cow;
use std::sync::LazyLock;

use pulldown_cmark::{
    html, CodeBlockKind, CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd,
    TextMergeStream,
};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::highlight::{self, CodeHighlighter};

/// Which math delimiter styles the pipeline recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathDelimiters {
    /// `$...$` and `$$...$$` only.
    Dollars,
    /// Dollars plus `\(...\)` and `\[...\]`, normalized before parsing.
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub theme: String,
    pub math_delimiters: MathDelimiters,
    pub enable_anchors: bool,
    pub enable_math: bool,
    pub enable_highlight: bool,
    /// Content-sniffing for untagged fences. Off by default; it is a fallback
    /// heuristic, not part of the hot path.
    pub infer_languages: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            theme: "github-light".to_string(),
            math_delimiters: MathDelimiters::Dollars,
            enable_anchors: true,
            enable_math: true,
            enable_highlight: true,
            infer_languages: false,
        }
    }
}

#[derive(Debug, Error)]
enum PipelineError {
    #[error("math renderer configuration failed: {0}")]
    MathOpts(String),
}

/// Render Markdown to a standalone HTML fragment. Never fails: the worst case
/// is an error wrapper containing the escaped original input.
pub fn render_markdown(markdown: &str, options: &RenderOptions) -> String {
    if markdown.trim().is_empty() {
        return String::new();
    }
    match try_render(markdown, options) {
        Ok(html) => html,
        Err(e) => {
            error!("markdown pipeline failed, emitting escaped fallback: {e}");
            error_wrapper(markdown)
        }
    }
}

fn error_wrapper(source: &str) -> String {
    format!(
        "<div class=\"markdown-error\"><p>Markdown rendering failed</p><pre>{}</pre></div>",
        htmlescape::encode_minimal(source)
    )
}

struct MathRenderer {
    inline: katex::Opts,
    display: katex::Opts,
}

impl MathRenderer {
    fn new() -> Result<Self, PipelineError> {
        let build = |display_mode: bool| {
            katex::Opts::builder()
                .display_mode(display_mode)
                .throw_on_error(false)
                .error_color(String::from("#cc0000"))
                .build()
                .map_err(|e| PipelineError::MathOpts(e.to_string()))
        };
        Ok(Self {
            inline: build(false)?,
            display: build(true)?,
        })
    }

    /// Render one formula. A malformed formula yields a visibly marked error
    /// fragment; it never aborts the surrounding document.
    fn render(&self, source: &str, display_mode: bool) -> String {
        let opts = if display_mode { &self.display } else { &self.inline };
        match katex::render_with_opts(source, opts) {
            Ok(html) => html,
            Err(e) => {
                warn!("math formula failed to render: {e}");
                math_error_fragment(source, display_mode, &e.to_string())
            }
        }
    }
}

/// Attribute escape that keeps URLs readable. `encode_attribute` hex-encodes
/// every non-alphanumeric character, so it is reserved for free-text values;
/// here only the characters that can break out of a double-quoted attribute
/// are replaced.
pub(crate) fn encode_attr(value: &str) -> String {
    htmlescape::encode_minimal(value).replace('"', "&quot;")
}

fn math_error_fragment(source: &str, display_mode: bool, message: &str) -> String {
    let title = htmlescape::encode_attribute(message);
    let body = htmlescape::encode_minimal(source);
    if display_mode {
        format!("<div class=\"math-error\" title=\"{title}\">$${body}$$</div>")
    } else {
        format!("<span class=\"math-error\" title=\"{title}\">${body}$</span>")
    }
}

struct HeadingCapture<'a> {
    level: HeadingLevel,
    events: Vec<Event<'a>>,
    text: String,
}

fn try_render(markdown: &str, options: &RenderOptions) -> Result<String, PipelineError> {
    let source: Cow<'_, str> = if options.math_delimiters == MathDelimiters::All {
        Cow::Owned(normalize_latex_delimiters(markdown))
    } else {
        Cow::Borrowed(markdown)
    };

    let mut parser_options = Options::empty();
    parser_options.insert(Options::ENABLE_TABLES);
    parser_options.insert(Options::ENABLE_STRIKETHROUGH);
    parser_options.insert(Options::ENABLE_SMART_PUNCTUATION);
    if options.enable_math {
        parser_options.insert(Options::ENABLE_MATH);
    }

    let math = if options.enable_math {
        Some(MathRenderer::new()?)
    } else {
        None
    };
    let highlighter = if options.enable_highlight {
        highlight::shared()
    } else {
        None
    };

    let parser = Parser::new_ext(&source, parser_options);

    let mut events: Vec<Event> = Vec::new();
    let mut heading: Option<HeadingCapture> = None;
    let mut in_code_block = false;
    let mut in_link = false;
    let mut code_language = String::new();
    let mut code_buffer = String::new();
    let mut image: Option<(String, String, String)> = None; // (src, title, alt)

    for event in TextMergeStream::new(parser) {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                in_code_block = true;
                code_buffer.clear();
                code_language = match kind {
                    CodeBlockKind::Fenced(info) => {
                        info.split_whitespace().next().unwrap_or("").to_string()
                    }
                    CodeBlockKind::Indented => String::new(),
                };
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                let fragment = render_code_block(
                    &code_buffer,
                    &code_language,
                    highlighter.as_deref(),
                    options,
                );
                push(&mut events, &mut heading, Event::Html(owned(fragment)));
            }
            Event::Text(text) if in_code_block => {
                code_buffer.push_str(&text);
            }
            Event::Start(Tag::Image {
                dest_url, title, ..
            }) => {
                image = Some((dest_url.to_string(), title.to_string(), String::new()));
            }
            Event::Text(text) if image.is_some() => {
                if let Some((_, _, alt)) = image.as_mut() {
                    alt.push_str(&text);
                }
            }
            Event::End(TagEnd::Image) => {
                if let Some((src, title, alt)) = image.take() {
                    push(
                        &mut events,
                        &mut heading,
                        Event::Html(owned(image_fragment(&src, &title, &alt))),
                    );
                }
            }
            Event::Start(Tag::Heading { level, .. }) if options.enable_anchors => {
                heading = Some(HeadingCapture {
                    level,
                    events: Vec::new(),
                    text: String::new(),
                });
            }
            Event::End(TagEnd::Heading(_)) if heading.is_some() => {
                if let Some(capture) = heading.take() {
                    events.push(Event::Html(owned(heading_fragment(capture))));
                }
            }
            Event::InlineMath(formula) => {
                let fragment = match &math {
                    Some(renderer) => renderer.render(&formula, false),
                    None => format!("${formula}$"),
                };
                push(&mut events, &mut heading, Event::Html(owned(fragment)));
            }
            Event::DisplayMath(formula) => {
                let fragment = match &math {
                    Some(renderer) => renderer.render(&formula, true),
                    None => format!("$${formula}$$"),
                };
                push(&mut events, &mut heading, Event::Html(owned(fragment)));
            }
            Event::Start(Tag::Table(_)) => {
                events.push(Event::Html(CowStr::Borrowed(
                    "<div class=\"markdown-table-wrapper\">",
                )));
                events.push(event);
            }
            Event::End(TagEnd::Table) => {
                events.push(event);
                events.push(Event::Html(CowStr::Borrowed("</div>")));
            }
            Event::Start(Tag::Link { .. }) if image.is_none() => {
                in_link = true;
                push(&mut events, &mut heading, event);
            }
            Event::End(TagEnd::Link) if image.is_none() => {
                in_link = false;
                push(&mut events, &mut heading, event);
            }
            Event::Text(text) if !in_link => match linkify(&text) {
                Some(linked) => {
                    for ev in linked {
                        push(&mut events, &mut heading, ev);
                    }
                }
                None => push(&mut events, &mut heading, Event::Text(text)),
            },
            Event::Code(code) if image.is_some() => {
                if let Some((_, _, alt)) = image.as_mut() {
                    alt.push_str(&code);
                }
            }
            // Other inline markup inside alt text is flattened away.
            other => {
                if image.is_none() {
                    push(&mut events, &mut heading, other);
                }
            }
        }
    }

    let mut out = String::new();
    html::push_html(&mut out, events.into_iter());
    Ok(out)
}

fn owned(s: String) -> CowStr<'static> {
    CowStr::Boxed(s.into_boxed_str())
}

/// Route an event either into the heading being captured or the output stream.
fn push<'a>(
    events: &mut Vec<Event<'a>>,
    heading: &mut Option<HeadingCapture<'a>>,
    event: Event<'a>,
) {
    match heading {
        Some(capture) => {
            match &event {
                Event::Text(t) => capture.text.push_str(t),
                Event::Code(t) => capture.text.push_str(t),
                _ => {}
            }
            capture.events.push(event);
        }
        None => events.push(event),
    }
}

fn render_code_block(
    code: &str,
    tag: &str,
    handle: Option<&CodeHighlighter>,
    options: &RenderOptions,
) -> String {
    let Some(handle) = handle else {
        return fallback_code_block(code, tag);
    };
    let language = match handle.resolve_language(tag) {
        Some(language) => language,
        None if tag.is_empty() && options.infer_languages => highlight::infer_language(code),
        None if tag.is_empty() => "text",
        None => return fallback_code_block(code, tag),
    };
    match handle.highlight(code, language, &options.theme) {
        Ok(html) => html,
        Err(e) => {
            warn!("highlighting failed for language {language}: {e}");
            fallback_code_block(code, tag)
        }
    }
}

fn fallback_code_block(code: &str, tag: &str) -> String {
    let language = if tag.is_empty() { "text" } else { tag };
    format!(
        "<pre><code class=\"language-{}\">{}</code></pre>\n",
        htmlescape::encode_attribute(language),
        htmlescape::encode_minimal(code)
    )
}

fn image_fragment(src: &str, title: &str, alt: &str) -> String {
    let mut img = format!(
        "<img src=\"{}\" alt=\"{}\"",
        encode_attr(src),
        encode_attr(alt)
    );
    if !title.is_empty() {
        img.push_str(&format!(" title=\"{}\"", encode_attr(title)));
    }
    img.push_str(" loading=\"lazy\" class=\"markdown-image\">");
    img
}

fn heading_fragment(capture: HeadingCapture<'_>) -> String {
    let level = heading_number(capture.level);
    let slug = slugify(&capture.text);
    let mut inner = String::new();
    html::push_html(&mut inner, capture.events.into_iter());
    format!(
        "<h{level} id=\"{slug}\"><a class=\"header-anchor\" href=\"#{slug}\">#</a>{inner}</h{level}>\n"
    )
}

fn heading_number(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Deterministic, URL-safe anchor slugs. Alphanumerics (including CJK) are
/// kept lowercase, runs of everything else collapse to one hyphen.
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap());

/// Wrap bare URLs in prose into anchors. Returns `None` when the text carries
/// no URL so the original borrowed event can pass through untouched.
fn linkify(text: &str) -> Option<Vec<Event<'static>>> {
    if !text.contains("http") || !BARE_URL.is_match(text) {
        return None;
    }
    let mut out = Vec::new();
    let mut last = 0;
    for m in BARE_URL.find_iter(text) {
        if m.start() > last {
            out.push(Event::Text(owned(text[last..m.start()].to_string())));
        }
        let url = m.as_str();
        out.push(Event::Html(owned(format!(
            "<a href=\"{}\">{}</a>",
            encode_attr(url),
            htmlescape::encode_minimal(url)
        ))));
        last = m.end();
    }
    if last < text.len() {
        out.push(Event::Text(owned(text[last..].to_string())));
    }
    Some(out)
}

/// Rewrite `\(...\)` and `\[...\]` delimiters into dollar form so the parser's
/// math events pick them up. Unterminated delimiters pass through unchanged.
fn normalize_latex_delimiters(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        if let Some((open, close, display_mode)) = delimiter_at(input, i) {
            let content_start = i + open.len();
            if let Some(close_at) = input[content_start..].find(close) {
                let content_end = content_start + close_at;
                let content = &input[content_start..content_end];
                if display_mode || content.contains('\n') {
                    out.push_str("$$");
                    out.push_str(content);
                    out.push_str("$$");
                } else {
                    out.push('$');
                    out.push_str(content);
                    out.push('$');
                }
                i = content_end + close.len();
                continue;
            }
        }

        if let Some(ch) = input[i..].chars().next() {
            out.push(ch);
            i += ch.len_utf8();
        } else {
            break;
        }
    }

    out
}

fn delimiter_at(input: &str, index: usize) -> Option<(&'static str, &'static str, bool)> {
    let tail = &input[index..];
    if tail.starts_with("\\(") {
        Some(("\\(", "\\)", false))
    } else if tail.starts_with("\\[") {
        Some(("\\[", "\\]", true))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(markdown: &str) -> String {
        render_markdown(markdown, &RenderOptions::default())
    }

    #[test]
    fn renders_heading_bold_and_math() {
        let out = render("# Hi\n\nSome **bold** text with $E=mc^2$ math.");
        assert!(out.contains("id=\"hi\""));
        assert!(out.contains("header-anchor"));
        assert!(out.contains("<strong>bold</strong>"));
        assert!(out.contains("katex"));
        assert!(!out.contains("$E=mc^2$"));
    }

    #[test]
    fn fenced_block_is_highlighted() {
        let out = render("```rust\nfn main() {}\n```");
        assert!(out.contains("<pre"));
        assert!(out.contains("main"));
    }

    #[test]
    fn unknown_language_falls_back_to_escaped_block() {
        let out = render("```brainfuck\n++++[>++++<-]\n```");
        assert!(out.contains("language-brainfuck"));
        assert!(out.contains("<pre><code"));
    }

    #[test]
    fn unterminated_fence_still_renders() {
        let out = render("```rust\nfn main(");
        assert!(!out.is_empty());
        assert!(out.contains("main"));
    }

    #[test]
    fn malformed_math_does_not_blank_the_document() {
        let out = render("before $\\frac{$ after");
        assert!(out.contains("before"));
        assert!(out.contains("after"));
    }

    #[test]
    fn tables_get_a_scroll_wrapper() {
        let out = render("| a | b |\n|---|---|\n| 1 | 2 |");
        assert!(out.contains("markdown-table-wrapper"));
        assert!(out.contains("<table>"));
    }

    #[test]
    fn images_get_lazy_loading() {
        let out = render("![diagram](/img/d.png)");
        assert!(out.contains("loading=\"lazy\""));
        assert!(out.contains("markdown-image"));
        assert!(out.contains("alt=\"diagram\""));
        assert!(out.contains("src=\"/img/d.png\""));
    }

    #[test]
    fn link_inside_image_alt_is_flattened() {
        let out = render("![a [b](c)](d)");
        assert!(!out.contains("<a "));
        assert!(out.contains("alt=\"a b\""));
        assert!(out.contains("src=\"d\""));
    }

    #[test]
    fn bare_urls_become_links() {
        let out = render("see https://example.com/page for details");
        assert!(out.contains("<a href=\"https://example.com/page\""));
    }

    #[test]
    fn latex_delimiters_render_when_enabled() {
        let options = RenderOptions {
            math_delimiters: MathDelimiters::All,
            ..RenderOptions::default()
        };
        let out = render_markdown("\\(x^2\\) and \\[y^2\\]", &options);
        assert!(out.contains("katex"));
    }

    #[test]
    fn latex_delimiters_stay_literal_by_default() {
        let out = render("keep \\(x^2\\) as-is");
        assert!(!out.contains("katex"));
    }

    #[test]
    fn empty_input_renders_empty() {
        assert_eq!(render(""), "");
        assert_eq!(render("   \n"), "");
    }

    #[test]
    fn slugs_are_deterministic_and_url_safe() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  Spaced   Out  "), "spaced-out");
        assert_eq!(slugify("数学公式"), "数学公式");
    }

    #[test]
    fn heading_anchor_survives_inline_code() {
        let out = render("## Using `cargo build`");
        assert!(out.contains("id=\"using-cargo-build\""));
        assert!(out.contains("<code>cargo build</code>"));
    }
}
