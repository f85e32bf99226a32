//! Markdown⇄HTML conversion for the rich-text editor.
//!
//! `md_to_html` expands `:::video url:::` / `:::gist url:::` shortcode lines
//! into embed `<div>` islands before a minimal Markdown render; `html_to_md`
//! walks the DOM back into Markdown, re-emitting those islands (and any other
//! `div`/`iframe`) as verbatim HTML so they survive the trip structurally.
//! The asymmetry is deliberate: an embed comes back as literal HTML inside the
//! Markdown, never as reconstructed shortcode syntax.

use std::sync::LazyLock;

use pulldown_cmark::{html, Options, Parser};
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use tracing::debug;
use url::Url;

const VIDEO_HOSTS: &[&str] = &[
    "youtu.be",
    "www.youtube.com",
    "youtube.com",
    "vimeo.com",
    "www.vimeo.com",
    "player.vimeo.com",
    "player.bilibili.com",
    "www.bilibili.com",
    "bilibili.com",
];

static SHORTCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:::(video|gist)\s+(\S+)\s*:::$").unwrap());
static BILIBILI_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"BV[0-9A-Za-z]+").unwrap());
static VIMEO_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static MULTI_BLANK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Markdown to HTML for the editing surface. Shortcode lines expand first;
/// everything else goes through a minimal parser with raw-HTML pass-through.
pub fn md_to_html(markdown: &str) -> String {
    if markdown.trim().is_empty() {
        return String::new();
    }
    let preprocessed = preprocess_shortcodes(markdown);

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(&preprocessed, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

/// HTML back to Markdown for persistence: ATX headings, fenced code, inline
/// emphasis/links, lists and blockquotes; embed islands stay literal HTML.
pub fn html_to_md(html_input: &str) -> String {
    if html_input.trim().is_empty() {
        return String::new();
    }
    let doc = Html::parse_fragment(html_input);
    let mut out = String::new();
    for child in doc.root_element().children() {
        convert_block(child, &mut out);
    }
    MULTI_BLANK.replace_all(&out, "\n\n").trim().to_string()
}

/// Full editor round trip. Plain text, emphasis, headings and recognized
/// embeds survive; unrecognized shortcode syntax is not guaranteed to.
pub fn round_trip(markdown: &str) -> String {
    html_to_md(&md_to_html(markdown))
}

fn preprocess_shortcodes(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            let Some(caps) = SHORTCODE.captures(line.trim()) else {
                return line.to_string();
            };
            let url = &caps[2];
            match &caps[1] {
                "video" => match build_video_iframe(url) {
                    Some(embed) => embed,
                    None => {
                        debug!("unrecognized video host, keeping shortcode literal: {url}");
                        line.to_string()
                    }
                },
                // Gist embeds are emitted unconditionally; the URL is only data.
                _ => format!(
                    "<div class=\"embed-gist\" data-gist=\"{}\"></div>",
                    crate::markdown::encode_attr(url)
                ),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build a host-specific embed iframe, or `None` when the URL does not parse
/// or its host is not on the allow-list.
fn build_video_iframe(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    if !VIDEO_HOSTS.contains(&host) {
        return None;
    }

    let embed = if host == "youtu.be" {
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(|id| format!("https://www.youtube.com/embed/{id}"))
    } else if host.ends_with("youtube.com") {
        url.query_pairs()
            .find(|(k, _)| k.as_ref() == "v")
            .map(|(_, id)| format!("https://www.youtube.com/embed/{id}"))
    } else if host.contains("bilibili") {
        BILIBILI_ID
            .find(raw)
            .map(|m| format!("https://player.bilibili.com/player.html?bvid={}&page=1", m.as_str()))
    } else if host.contains("vimeo") {
        VIMEO_ID
            .find(raw)
            .map(|m| format!("https://player.vimeo.com/video/{}", m.as_str()))
    } else {
        None
    }?;

    Some(format!(
        "<div class=\"video-embed\"><iframe src=\"{embed}\" loading=\"lazy\" allowfullscreen \
         frameborder=\"0\" allow=\"accelerometer; autoplay; clipboard-write; encrypted-media; \
         gyroscope; picture-in-picture\" referrerpolicy=\"no-referrer-when-downgrade\"></iframe></div>"
    ))
}

fn convert_block(node: ego_tree::NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(t) => {
            let text = collapse_whitespace(&t.text);
            if !text.trim().is_empty() {
                out.push_str(text.trim());
                out.push_str("\n\n");
            }
        }
        Node::Element(el) => {
            let Some(element) = ElementRef::wrap(node) else {
                return;
            };
            match el.name() {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = el.name()[1..].parse::<usize>().unwrap_or(1);
                    let text = inline_content(element);
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                    out.push_str(text.trim());
                    out.push_str("\n\n");
                }
                "p" => {
                    let text = inline_content(element);
                    if !text.trim().is_empty() {
                        out.push_str(text.trim());
                        out.push_str("\n\n");
                    }
                }
                "hr" => out.push_str("---\n\n"),
                "pre" => convert_code_block(element, out),
                "blockquote" => convert_blockquote(element, out),
                "ul" | "ol" => {
                    convert_list(element, out, 0);
                    out.push('\n');
                }
                // Embed islands and any other div/iframe survive as raw HTML,
                // separated by blank lines.
                "div" | "iframe" | "table" => {
                    out.push_str(&element.html());
                    out.push_str("\n\n");
                }
                _ => {
                    let text = inline_content(element);
                    if !text.trim().is_empty() {
                        out.push_str(text.trim());
                        out.push_str("\n\n");
                    }
                }
            }
        }
        _ => {}
    }
}

fn convert_code_block(pre: ElementRef<'_>, out: &mut String) {
    let mut language = String::new();
    let mut code = String::new();
    for child in pre.children() {
        match child.value() {
            Node::Element(el) if el.name() == "code" => {
                if let Some(class) = el.attr("class") {
                    if let Some(lang) = class
                        .split_whitespace()
                        .find_map(|c| c.strip_prefix("language-"))
                    {
                        language = lang.to_string();
                    }
                }
                if let Some(code_el) = ElementRef::wrap(child) {
                    code = code_el.text().collect();
                }
            }
            Node::Text(t) => code.push_str(&t.text),
            _ => {}
        }
    }
    out.push_str("```");
    out.push_str(&language);
    out.push('\n');
    out.push_str(code.trim_end_matches('\n'));
    out.push_str("\n```\n\n");
}

fn convert_blockquote(quote: ElementRef<'_>, out: &mut String) {
    let mut inner = String::new();
    for child in quote.children() {
        convert_block(child, &mut inner);
    }
    for line in inner.trim().lines() {
        if line.is_empty() {
            out.push_str(">\n");
        } else {
            out.push_str("> ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');
}

fn convert_list(list: ElementRef<'_>, out: &mut String, depth: usize) {
    let ordered = list.value().name() == "ol";
    let mut index = 1;
    for child in list.children() {
        let Some(item) = ElementRef::wrap(child) else {
            continue;
        };
        if item.value().name() != "li" {
            continue;
        }
        let mut line = String::new();
        let mut nested: Vec<ElementRef> = Vec::new();
        for part in item.children() {
            if let Some(part_el) = ElementRef::wrap(part) {
                if matches!(part_el.value().name(), "ul" | "ol") {
                    nested.push(part_el);
                    continue;
                }
            }
            inline_node(part, &mut line);
        }
        out.push_str(&"  ".repeat(depth));
        if ordered {
            out.push_str(&format!("{index}. "));
        } else {
            out.push_str("- ");
        }
        out.push_str(line.trim());
        out.push('\n');
        for sublist in nested {
            convert_list(sublist, out, depth + 1);
        }
        index += 1;
    }
}

fn inline_content(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in element.children() {
        inline_node(child, &mut out);
    }
    out
}

fn inline_node(node: ego_tree::NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(t) => out.push_str(&collapse_whitespace(&t.text)),
        Node::Element(el) => {
            let Some(element) = ElementRef::wrap(node) else {
                return;
            };
            match el.name() {
                "strong" | "b" => {
                    out.push_str("**");
                    out.push_str(inline_content(element).trim());
                    out.push_str("**");
                }
                "em" | "i" => {
                    out.push('*');
                    out.push_str(inline_content(element).trim());
                    out.push('*');
                }
                "del" | "s" | "strike" => {
                    out.push_str("~~");
                    out.push_str(inline_content(element).trim());
                    out.push_str("~~");
                }
                "code" => {
                    out.push('`');
                    out.push_str(&element.text().collect::<String>());
                    out.push('`');
                }
                "a" => {
                    let text = inline_content(element);
                    let href = el.attr("href").unwrap_or("");
                    out.push_str(&format!("[{}]({href})", text.trim()));
                }
                "img" => {
                    let alt = el.attr("alt").unwrap_or("");
                    let src = el.attr("src").unwrap_or("");
                    out.push_str(&format!("![{alt}]({src})"));
                }
                "br" => out.push('\n'),
                _ => out.push_str(&inline_content(element)),
            }
        }
        _ => {}
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_short_link_becomes_embed_iframe() {
        let out = md_to_html(":::video https://youtu.be/dQw4w9WgXcQ:::");
        assert!(out.contains("<iframe src=\"https://www.youtube.com/embed/dQw4w9WgXcQ\""));
        assert!(out.contains("class=\"video-embed\""));
    }

    #[test]
    fn youtube_long_form_is_recognized() {
        let out = md_to_html(":::video https://www.youtube.com/watch?v=dQw4w9WgXcQ:::");
        assert!(out.contains("https://www.youtube.com/embed/dQw4w9WgXcQ"));
    }

    #[test]
    fn bilibili_and_vimeo_build_player_urls() {
        let bili = md_to_html(":::video https://www.bilibili.com/video/BV1xx411c7mD:::");
        assert!(bili.contains("player.bilibili.com/player.html?bvid=BV1xx411c7mD"));
        let vimeo = md_to_html(":::video https://vimeo.com/123456:::");
        assert!(vimeo.contains("player.vimeo.com/video/123456"));
    }

    #[test]
    fn unknown_host_keeps_shortcode_literal() {
        let out = md_to_html(":::video https://example.com/not-a-video:::");
        assert!(!out.contains("<iframe"));
        assert!(out.contains(":::video https://example.com/not-a-video:::"));
    }

    #[test]
    fn gist_embed_is_unconditional() {
        let out = md_to_html(":::gist https://gist.github.com/u/abc123:::");
        assert!(out.contains("class=\"embed-gist\""));
        assert!(out.contains("data-gist=\"https://gist.github.com/u/abc123\""));
    }

    #[test]
    fn heading_and_emphasis_round_trip() {
        let md = "# Hi\n\nSome **bold** and *soft* text.";
        let once = round_trip(md);
        assert!(once.contains("# Hi"));
        assert!(once.contains("**bold**"));
        assert!(once.contains("*soft*"));
    }

    #[test]
    fn round_trip_is_a_fixed_point_after_one_pass() {
        let md = "# Title\n\nFirst paragraph with **bold** text.\n\n## Sub\n\nSecond *italic* paragraph.";
        let once = round_trip(md);
        let twice = round_trip(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn video_embed_survives_round_trip_as_html() {
        let md = "intro\n\n:::video https://youtu.be/dQw4w9WgXcQ:::\n\noutro";
        let once = round_trip(md);
        assert!(once.contains("class=\"video-embed\""));
        assert!(once.contains("youtube.com/embed/dQw4w9WgXcQ"));
        let twice = round_trip(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn gist_embed_survives_round_trip_as_html() {
        let once = round_trip(":::gist https://gist.github.com/u/abc123:::");
        assert!(once.contains("class=\"embed-gist\""));
        let twice = round_trip(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn fenced_code_round_trips_with_language() {
        let md = "```rust\nfn main() {}\n```";
        let once = round_trip(md);
        assert!(once.contains("```rust"));
        assert!(once.contains("fn main() {}"));
    }

    #[test]
    fn links_and_images_convert_back() {
        let md = "See [docs](https://example.com/docs) and ![logo](/logo.png) here.";
        let once = round_trip(md);
        assert!(once.contains("[docs](https://example.com/docs)"));
        assert!(once.contains("![logo](/logo.png)"));
    }

    #[test]
    fn lists_convert_back() {
        let once = round_trip("- one\n- two\n\n1. first\n2. second");
        assert!(once.contains("- one"));
        assert!(once.contains("- two"));
        assert!(once.contains("1. first"));
        assert!(once.contains("2. second"));
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(md_to_html(""), "");
        assert_eq!(html_to_md(""), "");
        assert_eq!(round_trip(""), "");
    }
}
