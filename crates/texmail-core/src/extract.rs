//! Math span detection over compose bodies.

use std::ops::Range;

use regex::Regex;
use serde::Serialize;

use crate::config::Delimiters;
use crate::html;

/// One delimited LaTeX expression found in a body snapshot.
///
/// Two spans with the same `raw_match` are the same equation and share one
/// rendered image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MathSpan {
    /// The matched text including delimiters, exactly as it appears in the body
    pub raw_match: String,
    /// The expression with surrounding whitespace trimmed and character references decoded
    pub latex: String,
    /// Display (`$$`, `\[`) rather than inline math
    pub display: bool,
    /// Occurrence order within the body
    pub sequence_index: usize,
    /// Byte range of `raw_match` in the body
    pub range: Range<usize>,
}

/// Finds math spans in the text runs of an HTML body.
///
/// Spans never cross markup, so nothing inside a tag, attribute or comment is
/// ever matched.
#[derive(Debug, Clone)]
pub struct MathSpanExtractor {
    pattern: Regex,
}

impl Default for MathSpanExtractor {
    fn default() -> Self {
        Self::new(&Delimiters::default())
    }
}

impl MathSpanExtractor {
    pub fn new(delimiters: &Delimiters) -> Self {
        // Escapes come first so `\$` and `\\` are consumed before a delimiter can start there.
        let mut alternatives = vec![r"\\\$", r"\\\\"];
        if delimiters.display_dollars {
            alternatives.push(r"\$\$(?P<dd>(?:\\.|[^\\$])+)\$\$");
        }
        if delimiters.brackets {
            alternatives.push(r"\\\[(?P<br>(?s:.)+?)\\\]");
        }
        if delimiters.parens {
            alternatives.push(r"\\\((?P<pa>.+?)\\\)");
        }
        alternatives.push(r"\$(?P<d>(?:\\.|[^\\$\n])+)\$");

        let pattern = Regex::new(&alternatives.join("|")).expect("delimiter grammar is valid");
        Self { pattern }
    }

    pub fn extract(&self, body: &str) -> Vec<MathSpan> {
        let mut spans = Vec::new();
        for (offset, text) in html::text_segments(body) {
            for caps in self.pattern.captures_iter(text) {
                let (content, display) = if let Some(m) = caps.name("d") {
                    (m, false)
                } else if let Some(m) = caps.name("pa") {
                    (m, false)
                } else if let Some(m) = caps.name("dd") {
                    (m, true)
                } else if let Some(m) = caps.name("br") {
                    (m, true)
                } else {
                    // escaped delimiter
                    continue;
                };

                let latex = html::decode_entities(content.as_str()).replace('\u{a0}', " ");
                let latex = latex.trim();
                if latex.is_empty() {
                    continue;
                }

                let whole = &caps[0];
                let start = offset + caps.get(0).map(|m| m.start()).unwrap_or_default();
                spans.push(MathSpan {
                    raw_match: whole.to_string(),
                    latex: latex.to_string(),
                    display,
                    sequence_index: spans.len(),
                    range: start..start + whole.len(),
                });
            }
        }
        spans
    }
}

/// Distinct spans by `raw_match`, in order of first occurrence.
pub fn unique_spans(spans: &[MathSpan]) -> Vec<&MathSpan> {
    let mut seen = std::collections::HashSet::new();
    spans
        .iter()
        .filter(|span| seen.insert(span.raw_match.as_str()))
        .collect()
}
