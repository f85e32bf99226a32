//! Code highlighting provider.
//!
//! A process-wide, lazily built syntect handle shared by every render call. The
//! handle is immutable once built; `reset()` invalidates it atomically so tests
//! (or a theme switch) can force a rebuild. Construction failure is never fatal
//! to callers: `shared()` returns `None` and fenced blocks degrade to escaped
//! `<pre>` output.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;
use thiserror::Error;
use tracing::{error, info, warn};

/// Languages accepted on fenced blocks, after alias mapping. Anything outside
/// this list falls back to an escaped block.
pub const LANGUAGES: &[&str] = &[
    "javascript",
    "typescript",
    "python",
    "html",
    "css",
    "scss",
    "json",
    "bash",
    "yaml",
    "xml",
    "sql",
    "php",
    "java",
    "c",
    "cpp",
    "go",
    "rust",
    "markdown",
    "latex",
    "tex",
    "text",
];

/// Reduced set for the second construction attempt.
const FALLBACK_LANGUAGES: &[&str] = &["javascript", "python", "html", "css", "json", "text"];

const PREFERRED_THEMES: &[(&str, &str)] = &[
    ("github-light", "InspiredGitHub"),
    ("github-dark", "base16-ocean.dark"),
];
const FALLBACK_THEMES: &[(&str, &str)] = &[
    ("github-light", "base16-ocean.light"),
    ("github-dark", "base16-ocean.dark"),
];

/// Tokens the default syntax set has no grammar for, rendered with the closest
/// grammar it does have.
const SYNTAX_FALLBACKS: &[(&str, &str)] = &[("typescript", "javascript"), ("scss", "css")];

#[derive(Debug, Error)]
pub enum HighlightError {
    #[error("language not in the configured set: {0}")]
    UnsupportedLanguage(String),
    #[error("theme not available: {0}")]
    UnknownTheme(String),
    #[error("highlighting failed: {0}")]
    Render(String),
}

/// Compiled grammars plus the theme pair. Built once, read many.
pub struct CodeHighlighter {
    syntaxes: SyntaxSet,
    themes: BTreeMap<&'static str, Theme>,
    languages: &'static [&'static str],
}

impl CodeHighlighter {
    fn build(
        theme_names: &[(&'static str, &str)],
        languages: &'static [&'static str],
    ) -> Result<Self, HighlightError> {
        let syntaxes = SyntaxSet::load_defaults_newlines();
        let mut available = ThemeSet::load_defaults().themes;
        let mut themes = BTreeMap::new();
        for (public, internal) in theme_names {
            let theme = available
                .remove(*internal)
                .ok_or_else(|| HighlightError::UnknownTheme((*internal).to_string()))?;
            themes.insert(*public, theme);
        }
        Ok(Self {
            syntaxes,
            themes,
            languages,
        })
    }

    /// Map common shorthand language tags onto the canonical names.
    pub fn resolve_language<'a>(&self, tag: &'a str) -> Option<&'a str> {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }
        let canonical = match tag {
            "js" | "jsx" | "react" | "node" => "javascript",
            "ts" | "tsx" => "typescript",
            "py" => "python",
            "sh" | "shell" | "zsh" => "bash",
            "yml" => "yaml",
            "plaintext" | "plain" | "txt" => "text",
            other => other,
        };
        self.languages
            .contains(&canonical)
            .then_some(canonical)
    }

    /// Highlight one code block to standalone `<pre>` HTML.
    ///
    /// Fails per call, never per process: the caller is expected to emit an
    /// escaped block instead.
    pub fn highlight(
        &self,
        code: &str,
        language: &str,
        theme: &str,
    ) -> Result<String, HighlightError> {
        let selected = self
            .themes
            .get(theme)
            .or_else(|| self.themes.values().next())
            .ok_or_else(|| HighlightError::UnknownTheme(theme.to_string()))?;

        let syntax = if language == "text" {
            self.syntaxes.find_syntax_plain_text()
        } else {
            self.syntaxes
                .find_syntax_by_token(language)
                .or_else(|| {
                    SYNTAX_FALLBACKS
                        .iter()
                        .find(|(tag, _)| *tag == language)
                        .and_then(|(_, substitute)| self.syntaxes.find_syntax_by_token(substitute))
                })
                .ok_or_else(|| HighlightError::UnsupportedLanguage(language.to_string()))?
        };

        highlighted_html_for_string(code, &self.syntaxes, syntax, selected)
            .map_err(|e| HighlightError::Render(e.to_string()))
    }
}

enum Cache {
    Unset,
    Ready(Arc<CodeHighlighter>),
    Failed,
}

static SHARED: Mutex<Cache> = Mutex::new(Cache::Unset);

/// Get the shared highlighter, building it on first use.
///
/// Concurrent first callers serialize on the lock, so exactly one instance is
/// ever constructed. After a failed build (including the reduced-set retry) the
/// failure is remembered and `None` is returned until [`reset`] is called.
pub fn shared() -> Option<Arc<CodeHighlighter>> {
    let mut cache = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
    match &*cache {
        Cache::Ready(handle) => Some(handle.clone()),
        Cache::Failed => None,
        Cache::Unset => {
            let built = CodeHighlighter::build(PREFERRED_THEMES, LANGUAGES).or_else(|e| {
                warn!("highlighter construction failed, retrying with reduced set: {e}");
                CodeHighlighter::build(FALLBACK_THEMES, FALLBACK_LANGUAGES)
            });
            match built {
                Ok(handle) => {
                    info!("code highlighter ready");
                    let handle = Arc::new(handle);
                    *cache = Cache::Ready(handle.clone());
                    Some(handle)
                }
                Err(e) => {
                    error!("code highlighter unavailable, falling back to escaped blocks: {e}");
                    *cache = Cache::Failed;
                    None
                }
            }
        }
    }
}

/// Drop the cached handle so the next [`shared`] call rebuilds it.
pub fn reset() {
    let mut cache = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
    *cache = Cache::Unset;
}

/// One content-sniffing rule for untagged fences.
struct InferenceRule {
    patterns: Vec<Regex>,
    language: &'static str,
}

impl InferenceRule {
    fn new(patterns: &[&str], language: &'static str) -> Self {
        Self {
            patterns: patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
            language,
        }
    }
}

// Ordered: first rule with any matching pattern wins.
static INFERENCE_RULES: LazyLock<Vec<InferenceRule>> = LazyLock::new(|| {
    vec![
        InferenceRule::new(
            &[
                r"import\s+(numpy|pandas|matplotlib|sklearn|seaborn)",
                r"from\s+(sklearn|pandas|numpy)",
                r"def\s+\w+\(",
                r"print\(",
                r"\bplt\.",
                r"\bpd\.",
                r"\bnp\.",
                r"\blen\(",
            ],
            "python",
        ),
        InferenceRule::new(
            &[
                r"function\s+\w+\(",
                r"const\s+\w+\s*=",
                r"let\s+\w+\s*=",
                r"var\s+\w+\s*=",
                r"console\.log",
                r"=>\s*\{",
            ],
            "javascript",
        ),
        InferenceRule::new(
            &[r"<!DOCTYPE", r"<html", r"<div", r"<script", r"<[a-zA-Z][^>]*>"],
            "html",
        ),
    ]
});

/// Fixed default when no rule matches. Matches the corpus this heuristic was
/// tuned on; callers opt into inference explicitly.
const INFERENCE_DEFAULT: &str = "python";

/// Guess a language for an untagged fence. Fallback heuristic only: the render
/// pipeline consults this when the fence carries no usable tag and inference
/// was requested.
pub fn infer_language(code: &str) -> &'static str {
    for rule in INFERENCE_RULES.iter() {
        if rule.patterns.iter().any(|p| p.is_match(code)) {
            return rule.language;
        }
    }
    INFERENCE_DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_handle_is_cached_and_reset_rebuilds() {
        reset();
        let a = shared().expect("default theme set should build");
        let b = shared().expect("second call should reuse the cache");
        assert!(Arc::ptr_eq(&a, &b));
        reset();
        let c = shared().expect("rebuild after reset");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn highlights_rust_code() {
        let handle = shared().unwrap();
        let html = handle
            .highlight("fn main() {}\n", "rust", "github-light")
            .unwrap();
        assert!(html.contains("<pre"));
        assert!(html.contains("main"));
    }

    #[test]
    fn alias_map_resolves_shorthand() {
        let handle = shared().unwrap();
        assert_eq!(handle.resolve_language("js"), Some("javascript"));
        assert_eq!(handle.resolve_language("py"), Some("python"));
        assert_eq!(handle.resolve_language("yml"), Some("yaml"));
        assert_eq!(handle.resolve_language(""), None);
        assert_eq!(handle.resolve_language("brainfuck"), None);
    }

    #[test]
    fn missing_grammars_use_nearest_substitute() {
        let handle = shared().unwrap();
        assert!(handle
            .highlight("let x: number = 1;\n", "typescript", "github-light")
            .is_ok());
        assert!(handle
            .highlight(".a { color: red; }\n", "scss", "github-light")
            .is_ok());
    }

    #[test]
    fn unknown_language_is_a_per_call_error() {
        let handle = shared().unwrap();
        assert!(handle.highlight("++++", "brainfuck", "github-light").is_err());
    }

    #[test]
    fn infers_python_from_imports() {
        assert_eq!(infer_language("import numpy as np\nprint(np.zeros(3))"), "python");
    }

    #[test]
    fn infers_javascript_from_declarations() {
        assert_eq!(infer_language("const x = 1;\nconsole.log(x);"), "javascript");
    }

    #[test]
    fn infers_html_from_tags() {
        assert_eq!(infer_language("<div class=\"a\">hi</div>"), "html");
    }
}
