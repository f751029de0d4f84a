//! Turning generated equations back into editable LaTeX.

use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::html::{self, ImageBlock, Tag};
use crate::session::RenderReport;

static SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)(<span\b[^>]*>).*?</span>").unwrap());

/// Set on generated equations that were display math.
pub const DISPLAY_ATTR: &str = "data-display";

/// Lets the user edit an equation's source.
pub trait LatexEditor: Send + Sync {
    /// Offer `latex` for editing. `None` means the user cancelled.
    fn edit(&self, latex: &str) -> impl Future<Output = Option<String>> + Send;
}

impl<T: LatexEditor> LatexEditor for Arc<T> {
    fn edit(&self, latex: &str) -> impl Future<Output = Option<String>> + Send {
        (**self).edit(latex)
    }
}

/// What activating an image did.
#[derive(Debug)]
pub enum Activation {
    /// No such image, or not one this system generated
    NotGenerated,
    /// The editor was dismissed; the body is unchanged
    Cancelled,
    /// The edit was applied and the body re-rendered
    Edited(RenderReport),
}

/// The `index`-th image in document order.
pub fn nth_image(body: &str, index: usize) -> Option<ImageBlock> {
    html::images(body).into_iter().nth(index)
}

/// The source of a generated equation, or `None` for any other tag.
pub fn generated_latex(tag: &Tag, marker_class: &str) -> Option<String> {
    if !tag.has_class(marker_class) {
        return None;
    }
    tag.get("data-raw-latex").map(str::to_string)
}

/// Whether a generated equation was display math.
pub fn is_display(tag: &Tag) -> bool {
    tag.get(DISPLAY_ATTR).is_some()
}

/// Replace the markup at `range` with the delimited source.
pub fn replace_with_source(body: &str, range: Range<usize>, latex: &str, display: bool) -> String {
    let mut out = String::with_capacity(body.len() + latex.len());
    out.push_str(&body[..range.start]);
    push_source(&mut out, latex, display);
    out.push_str(&body[range.end..]);
    out
}

/// `$latex$`, or `\[latex\]` for display math and anything spanning lines,
/// which inline dollars cannot hold.
fn push_source(out: &mut String, latex: &str, display: bool) {
    let (open, close) = if display || latex.contains('\n') {
        (r"\[", r"\]")
    } else {
        ("$", "$")
    };
    out.push_str(open);
    out.push_str(&html::escape(latex));
    out.push_str(close);
}

/// Convert every generated image and MathML span in `body` back to delimited source.
pub fn restore_all(body: &str, marker_class: &str) -> (String, usize) {
    let mut found: Vec<(Range<usize>, String, bool)> = html::images(body)
        .into_iter()
        .filter_map(|block| {
            generated_latex(&block.tag, marker_class)
                .map(|latex| (block.range, latex, is_display(&block.tag)))
        })
        .collect();
    for caps in SPAN_RE.captures_iter(body) {
        let (Some(whole), Some(open)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(tag) = Tag::parse(open.as_str()) else {
            continue;
        };
        if let Some(latex) = generated_latex(&tag, marker_class) {
            found.push((whole.range(), latex, is_display(&tag)));
        }
    }
    found.sort_by_key(|(range, _, _)| range.start);

    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    let mut restored = 0;
    for (range, latex, display) in found {
        if range.start < last {
            continue;
        }
        out.push_str(&body[last..range.start]);
        push_source(&mut out, &latex, display);
        last = range.end;
        restored += 1;
    }
    out.push_str(&body[last..]);
    (out, restored)
}
