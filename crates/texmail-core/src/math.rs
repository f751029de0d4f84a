//! Inline LaTeX rendering via pulldown-latex → MathML
//!
//! An alternative to the image pipeline for hosts that keep MathML intact:
//! nothing is uploaded, each span is replaced in place.

use pulldown_latex::{
    Parser, Storage, config::DisplayMode, config::RenderConfig, mathml::push_mathml,
};

use crate::extract::MathSpanExtractor;
use crate::html::escape;
use crate::round_trip::DISPLAY_ATTR;

/// Result of attempting to render LaTeX math
pub enum MathResult {
    /// Successfully rendered MathML
    Success(String),
    /// Rendering failed - contains fallback HTML with source and error message
    Error { html: String, message: String },
}

/// Render LaTeX math to MathML, wrapped in a span carrying the source.
///
/// # Arguments
/// * `latex` - The LaTeX source string (without delimiters like $ or $$)
/// * `display_mode` - If true, render as display math (block); if false, inline
/// * `marker_class` - Class marking the span as generated
pub fn render_math(latex: &str, display_mode: bool, marker_class: &str) -> MathResult {
    let storage = Storage::new();
    let parser = Parser::new(latex, &storage);
    let config = RenderConfig {
        display_mode: if display_mode {
            DisplayMode::Block
        } else {
            DisplayMode::Inline
        },
        ..Default::default()
    };

    let events: Vec<_> = parser.collect();
    let errors: Vec<String> = events
        .iter()
        .filter_map(|e| e.as_ref().err().map(|err| err.to_string()))
        .collect();
    if !errors.is_empty() {
        let message = errors.join("; ");
        return MathResult::Error {
            html: format_error_html(latex, display_mode, &message, marker_class),
            message,
        };
    }

    let mut mathml = String::new();
    if let Err(e) = push_mathml(&mut mathml, events.into_iter(), config) {
        return MathResult::Error {
            html: format_error_html(latex, display_mode, &e.to_string(), marker_class),
            message: e.to_string(),
        };
    }
    MathResult::Success(format!(
        r#"<span class="{}" data-raw-latex="{}"{}>{mathml}</span>"#,
        escape(marker_class),
        escape(latex),
        display_attr(display_mode)
    ))
}

fn display_attr(display_mode: bool) -> String {
    if display_mode {
        format!(r#" {DISPLAY_ATTR}="true""#)
    } else {
        String::new()
    }
}

fn format_error_html(latex: &str, display_mode: bool, error: &str, marker_class: &str) -> String {
    let escaped_latex = escape(latex);
    format!(
        r#"<span class="{} math-error" data-raw-latex="{escaped_latex}"{} title="{}"><code>{escaped_latex}</code></span>"#,
        escape(marker_class),
        display_attr(display_mode),
        escape(error)
    )
}

/// Outcome of [`render_inline`].
#[derive(Debug, Default)]
pub struct InlineRender {
    pub body: String,
    pub rendered: usize,
    /// Raw matches that failed to parse, with the parser's message
    pub failed: Vec<(String, String)>,
}

/// Replace every math span in `body` with MathML. Failed spans get an error
/// marker that still carries their source, so they can be restored.
pub fn render_inline(body: &str, extractor: &MathSpanExtractor, marker_class: &str) -> InlineRender {
    let mut out = InlineRender::default();
    let mut last = 0;
    for span in extractor.extract(body) {
        out.body.push_str(&body[last..span.range.start]);
        match render_math(&span.latex, span.display, marker_class) {
            MathResult::Success(html) => {
                out.body.push_str(&html);
                out.rendered += 1;
            }
            MathResult::Error { html, message } => {
                tracing::debug!(latex = %span.latex, %message, "math failed to parse");
                out.body.push_str(&html);
                out.failed.push((span.raw_match, message));
            }
        }
        last = span.range.end;
    }
    out.body.push_str(&body[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MARKER_CLASS;

    #[test]
    fn renders_inline_math() {
        let result = render_math("x^2", false, DEFAULT_MARKER_CLASS);
        assert!(matches!(result, MathResult::Success(_)));
        if let MathResult::Success(html) = result {
            assert!(html.starts_with(
                r#"<span class="generated-equation" data-raw-latex="x^2"><math"#
            ));
            assert!(html.ends_with("</math></span>"));
        }
    }

    #[test]
    fn renders_display_math() {
        let result = render_math(r"\frac{a}{b}", true, DEFAULT_MARKER_CLASS);
        assert!(matches!(result, MathResult::Success(_)));
        if let MathResult::Success(html) = result {
            assert!(html.contains("<mfrac"));
            assert!(html.contains(r#"data-display="true""#));
        }
    }

    #[test]
    fn handles_invalid_latex() {
        // Unclosed brace
        let result = render_math(r"\frac{a", false, DEFAULT_MARKER_CLASS);
        assert!(matches!(result, MathResult::Error { .. }));
        if let MathResult::Error { html, message } = result {
            assert!(html.contains("math-error"));
            assert!(html.contains(r#"data-raw-latex="\frac{a""#));
            assert!(!message.is_empty());
        }
    }

    #[test]
    fn inline_mode_replaces_every_span() {
        let body = r"<p>Let $x^2$ and $\frac{1$ hold, $x^2$.</p>";
        let out = render_inline(body, &MathSpanExtractor::default(), DEFAULT_MARKER_CLASS);
        assert_eq!(out.rendered, 2);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].0, r"$\frac{1$");
        assert!(out.body.starts_with("<p>Let <span"));
        assert!(out.body.ends_with(".</p>"));
        assert!(!out.body.contains("$x^2$"));
    }

    #[test]
    fn no_math_leaves_body_alone() {
        let out = render_inline("<p>plain</p>", &MathSpanExtractor::default(), DEFAULT_MARKER_CLASS);
        assert_eq!(out.body, "<p>plain</p>");
        assert_eq!(out.rendered, 0);
    }
}
