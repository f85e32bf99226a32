//! Math rendering for content that is already HTML.
//!
//! HTML-source content can still carry literal math delimiters the author typed
//! by hand. This pass finds inline `$...$`, display `$$...$$`, and LaTeX-style
//! `\(...\)` / `\[...\]` spans and renders each independently with KaTeX. A
//! formula that fails keeps its original delimited text inside a `math-error`
//! wrapper with the message as a tooltip; processing continues for the rest.
//! Delimiters inside `<code>`/`<pre>` regions are left untouched.

use std::sync::LazyLock;

use regex::{Captures, Regex, RegexBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MathOptions {
    pub error_color: String,
}

impl Default for MathOptions {
    fn default() -> Self {
        Self {
            error_color: "#cc0000".to_string(),
        }
    }
}

static DISPLAY_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$([^$]+?)\$\$").unwrap());
static LATEX_INLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\\?\(([^)]+?)\\\\?\)").unwrap());
static LATEX_DISPLAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\\?\[([^\]]+?)\\\\?\]").unwrap());

static CODE_REGION: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<code[^>]*>.*?</code>|<pre[^>]*>.*?</pre>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

static INLINE_MATH_PROBE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[^$\n]+?\$").unwrap());

/// Render every math span found in an HTML string. Returns the input unchanged
/// when it is empty or the math engine cannot be configured.
pub fn process_html_math(html: &str, options: &MathOptions) -> String {
    if html.trim().is_empty() {
        return html.to_string();
    }

    let (inline_opts, display_opts) = match build_opts(options) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("math engine configuration failed, leaving HTML untouched: {e}");
            return html.to_string();
        }
    };

    let mut processed = process_inline_math(html, &inline_opts);
    processed = process_display_math(&processed, &display_opts);
    processed = process_latex_math(&processed, &inline_opts, &display_opts);

    debug!(
        original_len = html.len(),
        processed_len = processed.len(),
        "html math pass complete"
    );
    processed
}

/// Cheap probe so hosts can skip the pass entirely.
pub fn contains_math(content: &str) -> bool {
    !content.trim().is_empty()
        && (INLINE_MATH_PROBE.is_match(content)
            || DISPLAY_MATH.is_match(content)
            || LATEX_INLINE.is_match(content)
            || LATEX_DISPLAY.is_match(content))
}

fn build_opts(options: &MathOptions) -> Result<(katex::Opts, katex::Opts), String> {
    let build = |display_mode: bool| {
        katex::Opts::builder()
            .display_mode(display_mode)
            .throw_on_error(false)
            .error_color(options.error_color.clone())
            .build()
            .map_err(|e| e.to_string())
    };
    Ok((build(false)?, build(true)?))
}

/// Byte ranges covered by `<code>`/`<pre>` elements. Matches are skipped when
/// they start or end inside one of these.
fn protected_ranges(html: &str) -> Vec<(usize, usize)> {
    CODE_REGION
        .find_iter(html)
        .map(|m| (m.start(), m.end()))
        .collect()
}

fn is_protected(position: usize, ranges: &[(usize, usize)]) -> bool {
    ranges
        .iter()
        .any(|&(start, end)| position >= start && position < end)
}

/// Inline `$...$` needs "not adjacent to another `$`" on both sides, which the
/// regex crate cannot express without lookaround, so this is a forward scan.
fn process_inline_math(html: &str, opts: &katex::Opts) -> String {
    let ranges = protected_ranges(html);
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut i = 0;

    while i < html.len() {
        let single_dollar = bytes[i] == b'$'
            && (i == 0 || bytes[i - 1] != b'$')
            && (i + 1 < html.len() && bytes[i + 1] != b'$');
        if single_dollar && !is_protected(i, &ranges) {
            if let Some(close) = find_inline_close(html, i + 1) {
                if !is_protected(close, &ranges) {
                    let content = &html[i + 1..close];
                    out.push_str(&render_fragment(content, false, opts));
                    i = close + 1;
                    continue;
                }
            }
        }

        if let Some(ch) = html[i..].chars().next() {
            out.push(ch);
            i += ch.len_utf8();
        } else {
            break;
        }
    }

    out
}

/// Position of the closing `$` for an inline span opened just before `from`,
/// or `None` when the span would be empty, cross a newline, or run into `$$`.
fn find_inline_close(html: &str, from: usize) -> Option<usize> {
    let rest = &html[from..];
    let offset = rest.find(['$', '\n'])?;
    if rest.as_bytes()[offset] != b'$' || offset == 0 {
        return None;
    }
    let close = from + offset;
    if html.as_bytes().get(close + 1) == Some(&b'$') {
        return None;
    }
    Some(close)
}

fn process_display_math(html: &str, opts: &katex::Opts) -> String {
    replace_outside_code(html, &DISPLAY_MATH, |caps| {
        render_fragment(&caps[1], true, opts)
    })
}

fn process_latex_math(html: &str, inline: &katex::Opts, display: &katex::Opts) -> String {
    let pass = replace_outside_code(html, &LATEX_INLINE, |caps| {
        render_latex_fragment(&caps[1], false, inline)
    });
    replace_outside_code(&pass, &LATEX_DISPLAY, |caps| {
        render_latex_fragment(&caps[1], true, display)
    })
}

/// Regex replacement that leaves matches inside `<code>`/`<pre>` alone.
fn replace_outside_code(
    html: &str,
    pattern: &Regex,
    replacement: impl Fn(&Captures) -> String,
) -> String {
    let ranges = protected_ranges(html);
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in pattern.captures_iter(html) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&html[last..whole.start()]);
        if is_protected(whole.start(), &ranges) {
            out.push_str(whole.as_str());
        } else {
            out.push_str(&replacement(&caps));
        }
        last = whole.end();
    }
    out.push_str(&html[last..]);
    out
}

fn render_fragment(content: &str, display_mode: bool, opts: &katex::Opts) -> String {
    match katex::render_with_opts(content.trim(), opts) {
        Ok(rendered) if display_mode => format!("<div class=\"katex-display\">{rendered}</div>"),
        Ok(rendered) => rendered,
        Err(e) => {
            warn!("formula failed to render: {e}");
            let title = htmlescape::encode_attribute(&e.to_string());
            let body = htmlescape::encode_minimal(content);
            if display_mode {
                format!("<div class=\"math-error\" title=\"{title}\">$${body}$$</div>")
            } else {
                format!("<span class=\"math-error\" title=\"{title}\">${body}$</span>")
            }
        }
    }
}

fn render_latex_fragment(content: &str, display_mode: bool, opts: &katex::Opts) -> String {
    match katex::render_with_opts(content.trim(), opts) {
        Ok(rendered) if display_mode => format!("<div class=\"katex-display\">{rendered}</div>"),
        Ok(rendered) => rendered,
        Err(e) => {
            warn!("formula failed to render: {e}");
            let title = htmlescape::encode_attribute(&e.to_string());
            let body = htmlescape::encode_minimal(content);
            if display_mode {
                format!("<div class=\"math-error\" title=\"{title}\">\\[{body}\\]</div>")
            } else {
                format!("<span class=\"math-error\" title=\"{title}\">\\({body}\\)</span>")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(html: &str) -> String {
        process_html_math(html, &MathOptions::default())
    }

    #[test]
    fn renders_inline_dollar_math() {
        let out = process("<p>Energy: $E=mc^2$ as shown.</p>");
        assert!(out.contains("katex"));
        assert!(!out.contains("$E=mc^2$"));
    }

    #[test]
    fn renders_display_math_with_wrapper() {
        let out = process("<p>$$\\int_0^1 x\\,dx$$</p>");
        assert!(out.contains("katex-display"));
    }

    #[test]
    fn renders_latex_style_delimiters() {
        let out = process("<p>\\(a^2+b^2\\) and \\[c^2\\]</p>");
        assert!(out.contains("katex"));
        assert!(!out.contains("\\(a^2"));
    }

    #[test]
    fn code_regions_are_left_alone() {
        let out = process("<p>$x^2$</p><code>$y^2$</code><pre>$z^2$</pre>");
        assert!(out.contains("<code>$y^2$</code>"));
        assert!(out.contains("<pre>$z^2$</pre>"));
        assert!(!out.contains("<p>$x^2$</p>"));
    }

    #[test]
    fn dollar_amounts_without_closing_delimiter_pass_through() {
        let out = process("<p>It costs $5 today.</p>");
        assert_eq!(out, "<p>It costs $5 today.</p>");
    }

    #[test]
    fn inline_math_does_not_cross_lines() {
        let input = "<p>$a\nb$</p>";
        assert_eq!(process(input), input);
    }

    #[test]
    fn empty_input_is_returned_unchanged() {
        assert_eq!(process(""), "");
    }

    #[test]
    fn math_probe_detects_delimiters() {
        assert!(contains_math("has $x$ inline"));
        assert!(contains_math("block $$y$$ math"));
        assert!(contains_math("latex \\(z\\) span"));
        assert!(!contains_math("plain prose, $ 5 alone"));
    }
}
