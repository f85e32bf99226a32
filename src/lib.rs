//! Content rendering pipeline for mixed Markdown/HTML posts.
//!
//! The pipeline takes author-submitted content of unknown format and turns it
//! into display-ready HTML plus plain-text summaries:
//!
//! - [`detect`] classifies raw content as Markdown or HTML source.
//! - [`markdown`] renders Markdown to HTML with math, syntax highlighting,
//!   heading anchors and image handling.
//! - [`html_math`] runs the KaTeX pass over content that is already HTML.
//! - [`summary`] extracts bounded plain-text summaries from either format.
//! - [`editor`] converts between Markdown and HTML for the editing surface,
//!   including video/gist embed shortcodes.
//! - [`highlight`] owns the shared syntect handle the renderer draws on.
//!
//! Every stage degrades instead of failing: a bad formula renders as an error
//! fragment, a missing grammar falls back to an escaped block, and summary
//! extraction has a crude plain-text fallback. None of the public entry points
//! return errors for bad content.

pub mod detect;
pub mod editor;
pub mod highlight;
pub mod html_math;
pub mod markdown;
pub mod summary;

pub use detect::{analyze, ContentType, Detection};
pub use editor::{html_to_md, md_to_html, round_trip};
pub use highlight::CodeHighlighter;
pub use html_math::{contains_math, process_html_math, MathOptions};
pub use markdown::{render_markdown, MathDelimiters, RenderOptions};
pub use summary::{extract_summary, SummaryOptions, SummarySource};
