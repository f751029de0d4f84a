//! Correlation between equations, placeholder tokens and uploaded attachments.

use std::collections::HashMap;

use regex::Regex;

use crate::extract::MathSpan;
use crate::host::InlineAttachment;
use crate::html::{self, ImageBlock};
use crate::render::RasterImage;

/// One unique equation, rendered and waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct RenderedAsset {
    /// Position in the correlation table
    pub index: usize,
    pub placeholder: String,
    pub raw_match: String,
    pub latex: String,
    pub display: bool,
    pub image: RasterImage,
    /// Attachment file name; embeds the cycle and index for correlation
    pub file_name: String,
}

impl RenderedAsset {
    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }
}

/// What a pending upload in the body corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadIdentity {
    /// Carries this cycle's identifier for the asset at `index`
    Current(usize),
    /// Carries this cycle's identifier for an index with no equation
    OutOfRange,
    /// Left over from an earlier cycle
    Stale,
    /// Carries the sentinel but no recoverable identifier
    Unknown,
}

/// Insertion-ordered table from `raw_match` to its rendered asset.
///
/// Identical spans share one asset, one placeholder and one attachment.
#[derive(Debug)]
pub struct AttachmentCorrelator {
    cycle: u32,
    prefix: String,
    sentinel: String,
    marker_class: String,
    assets: Vec<RenderedAsset>,
    by_raw: HashMap<String, usize>,
    identifier: Regex,
}

impl AttachmentCorrelator {
    /// Start a table for one render cycle over `body`.
    ///
    /// The placeholder prefix is picked so that no token can already occur in `body`.
    pub fn new(body: &str, cycle: u32, sentinel: &str, marker_class: &str) -> Self {
        let prefix = (0..)
            .map(|n| {
                if n == 0 {
                    "latex".to_string()
                } else {
                    format!("latex-{n}-")
                }
            })
            .find(|candidate| !body.contains(&format!("<!--{candidate}")))
            .unwrap_or_default();
        let identifier = identifier_pattern(sentinel);
        Self {
            cycle,
            prefix,
            sentinel: sentinel.to_string(),
            marker_class: marker_class.to_string(),
            assets: Vec::new(),
            by_raw: HashMap::new(),
            identifier,
        }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn marker_class(&self) -> &str {
        &self.marker_class
    }

    /// Record a rendered span. A span already in the table returns the existing asset
    /// and `image` is dropped.
    pub fn register(&mut self, span: &MathSpan, image: RasterImage) -> &RenderedAsset {
        if let Some(&index) = self.by_raw.get(&span.raw_match) {
            return &self.assets[index];
        }
        let index = self.assets.len();
        let asset = RenderedAsset {
            index,
            placeholder: format!("<!--{}{index}-->", self.prefix),
            raw_match: span.raw_match.clone(),
            latex: span.latex.clone(),
            display: span.display,
            image,
            file_name: format!(
                "eq{}{}_{index}_{}.png",
                self.sentinel,
                self.cycle,
                sanitize_fragment(&span.latex)
            ),
        };
        tracing::debug!(index, file = %asset.file_name, "registered equation");
        self.by_raw.insert(span.raw_match.clone(), index);
        self.assets.push(asset);
        &self.assets[index]
    }

    pub fn lookup(&self, raw_match: &str) -> Option<&RenderedAsset> {
        self.by_raw.get(raw_match).map(|&i| &self.assets[i])
    }

    pub fn get(&self, index: usize) -> Option<&RenderedAsset> {
        self.assets.get(index)
    }

    pub fn assets(&self) -> &[RenderedAsset] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Attachments to hand to the host, in table order.
    pub fn attachments(&self) -> Vec<InlineAttachment> {
        self.assets
            .iter()
            .map(|asset| {
                InlineAttachment::new(
                    asset.file_name.clone(),
                    asset.image.png.clone(),
                    asset.width(),
                    asset.height(),
                )
            })
            .collect()
    }

    /// Classify a pending upload by the identifier in its markup.
    pub fn identify(&self, markup: &str) -> UploadIdentity {
        let Some(caps) = self.identifier.captures(markup) else {
            return UploadIdentity::Unknown;
        };
        if caps[1].parse::<u32>().ok() != Some(self.cycle) {
            return UploadIdentity::Stale;
        }
        match caps[2].parse::<usize>() {
            Ok(index) if index < self.assets.len() => UploadIdentity::Current(index),
            _ => UploadIdentity::OutOfRange,
        }
    }

    /// Uploads in `body` still carrying the sentinel and not yet finalized.
    pub fn pending_uploads(&self, body: &str) -> Vec<ImageBlock> {
        pending_uploads(body, &self.sentinel, &self.marker_class)
    }

    /// Equations of this cycle with an upload in `body`.
    ///
    /// Each identified equation counts once however many copies arrived; uploads
    /// without an identifier count one each, since any of them may fill a slot.
    pub fn count_confirmed(&self, body: &str) -> usize {
        let mut seen = vec![false; self.assets.len()];
        let mut unidentified = 0;
        for block in self.pending_uploads(body) {
            match self.identify(&block.markup) {
                UploadIdentity::Current(index) => seen[index] = true,
                UploadIdentity::Unknown => unidentified += 1,
                UploadIdentity::OutOfRange | UploadIdentity::Stale => {}
            }
        }
        let identified = seen.iter().filter(|&&seen| seen).count();
        (identified + unidentified).min(self.assets.len())
    }
}

fn identifier_pattern(sentinel: &str) -> Regex {
    Regex::new(&format!(r"{}(\d+)_(\d+)_", regex::escape(sentinel)))
        .expect("escaped sentinel is a valid pattern")
}

/// Uploads in `body` carrying `sentinel` that are not yet marked as generated.
pub fn pending_uploads(body: &str, sentinel: &str, marker_class: &str) -> Vec<ImageBlock> {
    html::image_blocks(body)
        .into_iter()
        .filter(|block| block.markup.contains(sentinel) && !block.tag.has_class(marker_class))
        .collect()
}

/// Pending uploads in `body` carrying an identifier from any cycle.
///
/// Outside a running cycle these can only be late arrivals from a cycle that
/// already ended.
pub fn leftover_uploads(body: &str, sentinel: &str, marker_class: &str) -> Vec<ImageBlock> {
    let identifier = identifier_pattern(sentinel);
    pending_uploads(body, sentinel, marker_class)
        .into_iter()
        .filter(|block| identifier.is_match(&block.markup))
        .collect()
}

/// File-name-safe fragment of an expression: ASCII alphanumerics, `_` runs
/// for everything else, at most 24 characters.
fn sanitize_fragment(latex: &str) -> String {
    let mut out = String::new();
    for c in latex.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
        if out.len() >= 24 {
            break;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "math".to_string()
    } else {
        trimmed.to_string()
    }
}
