//! Placeholder substitution and finalization of uploaded equations.

use std::ops::Range;

use crate::correlate::{AttachmentCorrelator, RenderedAsset, UploadIdentity};
use crate::error::RenderError;
use crate::extract::MathSpan;
use crate::html::{self, Tag};
use crate::round_trip::DISPLAY_ATTR;

/// Result of a finalize pass.
#[derive(Debug)]
pub struct FinalizeOutcome {
    pub body: String,
    /// Indices of the assets whose placeholders now carry a finalized image
    pub finalized: Vec<usize>,
    /// Indices of the assets reverted to their original text
    pub reverted: Vec<usize>,
    /// Pending uploads found for this cycle
    pub confirmed: usize,
    /// Set when uploads and equations did not line up one to one
    pub mismatch: Option<RenderError>,
}

impl FinalizeOutcome {
    fn unchanged(body: &str) -> Self {
        Self {
            body: body.to_string(),
            finalized: Vec::new(),
            reverted: Vec::new(),
            confirmed: 0,
            mismatch: None,
        }
    }
}

/// Moves between raw math spans, placeholder tokens and finalized images.
#[derive(Debug, Clone)]
pub struct PlaceholderRewriter {
    marker_class: String,
}

impl PlaceholderRewriter {
    pub fn new(marker_class: impl Into<String>) -> Self {
        Self {
            marker_class: marker_class.into(),
        }
    }

    /// Replace every extracted occurrence of a registered span with its placeholder.
    ///
    /// Spans without an asset (render failures) keep their text. `spans` must come
    /// from extracting `body`.
    pub fn substitute(
        &self,
        body: &str,
        spans: &[MathSpan],
        correlator: &AttachmentCorrelator,
    ) -> String {
        let mut out = String::with_capacity(body.len());
        let mut last = 0;
        for span in spans {
            let Some(asset) = correlator.lookup(&span.raw_match) else {
                continue;
            };
            out.push_str(&body[last..span.range.start]);
            out.push_str(&asset.placeholder);
            last = span.range.end;
        }
        out.push_str(&body[last..]);
        out
    }

    /// Undo a cycle: placeholders back to their raw text, pending uploads removed.
    pub fn revert(&self, body: &str, correlator: &AttachmentCorrelator) -> String {
        let pending: Vec<Range<usize>> = correlator
            .pending_uploads(body)
            .into_iter()
            .map(|block| block.range)
            .collect();
        let mut body = html::remove_ranges(body, &pending);
        for asset in correlator.assets() {
            body = body.replace(&asset.placeholder, &asset.raw_match);
        }
        body
    }

    /// Move confirmed uploads onto their placeholders.
    ///
    /// Uploads are matched by the identifier embedded in their file name; uploads
    /// without one take the remaining equations in table order. A second upload
    /// for an equation, or one naming an index this cycle never produced, is
    /// dropped and counted in the mismatch rather than placed by position.
    /// Equations left without an upload go back to their raw text. Uploads from
    /// earlier cycles are dropped. Images already carrying the marker class are never touched, so
    /// running this again on its own output changes nothing.
    pub fn finalize(&self, body: &str, correlator: &AttachmentCorrelator) -> FinalizeOutcome {
        let pending = correlator.pending_uploads(body);
        let has_placeholders = correlator
            .assets()
            .iter()
            .any(|asset| body.contains(&asset.placeholder));
        if pending.is_empty() && !has_placeholders {
            return FinalizeOutcome::unchanged(body);
        }

        let expected = correlator.len();
        let mut matched: Vec<Option<Tag>> = vec![None; expected];
        let mut unidentified = Vec::new();
        let mut confirmed = 0;
        let mut discarded = 0;
        for block in &pending {
            match correlator.identify(&block.markup) {
                UploadIdentity::Current(index) if matched[index].is_none() => {
                    matched[index] = Some(block.tag.clone());
                    confirmed += 1;
                }
                UploadIdentity::Current(index) => {
                    tracing::warn!(index, upload = %block.markup, "second upload for one equation");
                    discarded += 1;
                }
                UploadIdentity::OutOfRange => {
                    tracing::warn!(upload = %block.markup, "upload names no equation of this cycle");
                    discarded += 1;
                }
                UploadIdentity::Stale => {
                    tracing::debug!(upload = %block.markup, "dropping upload from an earlier cycle");
                }
                UploadIdentity::Unknown => {
                    unidentified.push(block.tag.clone());
                    confirmed += 1;
                }
            }
        }
        // Only uploads with no identifier at all are placed by position.
        for tag in unidentified {
            match matched.iter().position(Option::is_none) {
                Some(slot) => {
                    tracing::debug!(slot, "correlating upload by position");
                    matched[slot] = Some(tag);
                }
                None => {
                    tracing::warn!("extra upload with no equation left to match");
                    discarded += 1;
                }
            }
        }

        let ranges: Vec<Range<usize>> = pending.iter().map(|block| block.range.clone()).collect();
        let mut out = html::remove_ranges(body, &ranges);
        let mut finalized = Vec::new();
        let mut reverted = Vec::new();
        for (asset, tag) in correlator.assets().iter().zip(matched) {
            match tag {
                Some(tag) => {
                    let markup = self.finalized_markup(tag, asset, correlator.sentinel());
                    out = out.replace(&asset.placeholder, &markup);
                    finalized.push(asset.index);
                }
                None => {
                    out = out.replace(&asset.placeholder, &asset.raw_match);
                    reverted.push(asset.index);
                }
            }
        }

        let mismatch = (confirmed != expected || !reverted.is_empty() || discarded > 0).then(|| {
            RenderError::CorrelationMismatch {
                expected,
                confirmed: finalized.len(),
                discarded,
            }
        });

        FinalizeOutcome {
            body: out,
            finalized,
            reverted,
            confirmed,
            mismatch,
        }
    }

    /// The permanent tag for `asset`, keeping the host's `src` and other attributes.
    ///
    /// Attributes carrying the sentinel are dropped, except `title`, which takes
    /// the LaTeX, and `src`, which is the only reference to the uploaded bytes.
    /// A host that serves uploads at a URL derived from the file name keeps the
    /// sentinel in `src`; the marker class is what identifies the tag as
    /// finalized, so this never makes it look pending again.
    fn finalized_markup(&self, mut tag: Tag, asset: &RenderedAsset, sentinel: &str) -> String {
        let tainted: Vec<String> = tag
            .attrs()
            .filter(|(key, value)| *key != "src" && value.contains(sentinel))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in tainted {
            if key == "title" {
                tag.set("title", asset.latex.as_str());
            } else {
                tag.remove(&key);
            }
        }
        tag.set("alt", asset.latex.as_str());
        tag.add_class(&self.marker_class);
        tag.set("data-raw-latex", asset.latex.as_str());
        if asset.display {
            tag.set(DISPLAY_ATTR, "true");
        }
        tag.set("width", asset.width().to_string());
        tag.set("height", asset.height().to_string());
        tag.to_html()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MARKER_CLASS, DEFAULT_SENTINEL};
    use crate::extract::MathSpanExtractor;
    use crate::render::RasterImage;
    use bytes::Bytes;

    fn image(width: u32) -> RasterImage {
        RasterImage {
            png: Bytes::from_static(b"png"),
            width,
            height: 12,
            pixel_width: width * 2,
            pixel_height: 24,
        }
    }

    fn setup(body: &str) -> (Vec<MathSpan>, AttachmentCorrelator, PlaceholderRewriter) {
        let spans = MathSpanExtractor::default().extract(body);
        let mut correlator =
            AttachmentCorrelator::new(body, 1, DEFAULT_SENTINEL, DEFAULT_MARKER_CLASS);
        for span in &spans {
            correlator.register(span, image(8 * span.latex.len() as u32));
        }
        (spans, correlator, PlaceholderRewriter::new(DEFAULT_MARKER_CLASS))
    }

    fn upload(name: &str, cid: &str) -> String {
        format!(r#"<div><img src="cid:{cid}" alt="{name}" data-name="{name}"><br></div>"#)
    }

    #[test]
    fn substitutes_every_occurrence() {
        let body = "Solve $a+b$ and $a+b$ please";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        assert_eq!(substituted, "Solve <!--latex0--> and <!--latex0--> please");
        assert_eq!(rewriter.revert(&substituted, &correlator), body);
    }

    #[test]
    fn duplicate_equations_share_one_finalized_tag() {
        let body = "Solve $a+b$ and $a+b$ please";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let with_upload = format!("{substituted}{}", upload("eq_pending_1_0_a_b.png", "c0"));
        let outcome = rewriter.finalize(&with_upload, &correlator);
        assert!(outcome.mismatch.is_none());
        assert_eq!(outcome.finalized, vec![0]);
        let tag = r#"<img src="cid:c0" alt="a+b" class="generated-equation" data-raw-latex="a+b" width="24" height="12">"#;
        assert_eq!(outcome.body, format!("Solve {tag} and {tag} please"));
    }

    #[test]
    fn matches_by_identifier_even_when_reordered() {
        let body = "$x$ then $yy$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            "{substituted}{}{}",
            upload("eq_pending_1_1_yy.png", "second"),
            upload("eq_pending_1_0_x.png", "first"),
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert!(outcome.mismatch.is_none());
        insta::assert_snapshot!(outcome.body, @r#"<img src="cid:first" alt="x" class="generated-equation" data-raw-latex="x" width="8" height="12"> then <img src="cid:second" alt="yy" class="generated-equation" data-raw-latex="yy" width="16" height="12">"#);
    }

    #[test]
    fn falls_back_to_position_without_identifiers() {
        let body = "$x$ then $yy$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            "{substituted}{}{}",
            upload("eq_pending___x.png", "first"),
            upload("eq_pending___yy.png", "second"),
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert_eq!(outcome.finalized, vec![0, 1]);
        assert!(outcome.body.starts_with(r#"<img src="cid:first" alt="x""#));
        assert!(!outcome.body.contains(DEFAULT_SENTINEL));
    }

    #[test]
    fn missing_upload_reverts_that_equation() {
        let body = "$x$ then $yy$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!("{substituted}{}", upload("eq_pending_1_1_yy.png", "second"));
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert_eq!(outcome.finalized, vec![1]);
        assert_eq!(outcome.reverted, vec![0]);
        assert!(outcome.body.starts_with("$x$ then <img src=\"cid:second\""));
        assert!(matches!(
            outcome.mismatch,
            Some(RenderError::CorrelationMismatch {
                expected: 2,
                confirmed: 1,
                discarded: 0,
            })
        ));
    }

    #[test]
    fn second_upload_for_one_equation_is_not_moved_along() {
        let body = "$x$ then $yy$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            "{substituted}{}{}",
            upload("eq_pending_1_0_x.png", "first"),
            upload("eq_pending_1_0_x.png", "copy"),
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert_eq!(outcome.finalized, vec![0]);
        assert_eq!(outcome.reverted, vec![1]);
        assert!(outcome.body.ends_with(" then $yy$"));
        assert!(!outcome.body.contains("cid:copy"));
        assert!(matches!(
            outcome.mismatch,
            Some(RenderError::CorrelationMismatch {
                expected: 2,
                confirmed: 1,
                discarded: 1,
            })
        ));
    }

    #[test]
    fn upload_naming_an_unknown_index_is_dropped() {
        let body = "$x$ then $yy$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            "{substituted}{}{}",
            upload("eq_pending_1_0_x.png", "first"),
            upload("eq_pending_1_9_x.png", "bogus"),
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert!(!outcome.body.contains("cid:bogus"));
        assert!(outcome.body.ends_with(" then $yy$"));
        assert!(matches!(
            outcome.mismatch,
            Some(RenderError::CorrelationMismatch { discarded: 1, .. })
        ));
    }

    #[test]
    fn finalize_is_idempotent() {
        let body = "<p>$x^2$</p>";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!("{substituted}{}", upload("eq_pending_1_0_x_2.png", "c"));
        let first = rewriter.finalize(&uploaded, &correlator);
        let second = rewriter.finalize(&first.body, &correlator);
        assert_eq!(second.body, first.body);
        assert!(second.finalized.is_empty());
        assert!(second.mismatch.is_none());
    }

    #[test]
    fn stale_uploads_are_dropped_and_earlier_equations_untouched() {
        let earlier = r#"<img src="cid:old" alt="z" class="generated-equation" data-raw-latex="z">"#;
        let body = format!("{earlier} and $x$");
        let (spans, correlator, rewriter) = setup(&body);
        let substituted = rewriter.substitute(&body, &spans, &correlator);
        let uploaded = format!(
            "{substituted}{}{}",
            upload("eq_pending_0_0_q.png", "stale"),
            upload("eq_pending_1_0_x.png", "fresh"),
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert!(outcome.body.starts_with(earlier));
        assert!(!outcome.body.contains("cid:stale"));
        assert!(outcome.body.contains("cid:fresh"));
        assert!(outcome.mismatch.is_none());
    }

    #[test]
    fn display_equations_are_marked() {
        let body = r"\[a+b\]";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!("{substituted}{}", upload("eq_pending_1_0_a_b.png", "c"));
        let outcome = rewriter.finalize(&uploaded, &correlator);
        insta::assert_snapshot!(outcome.body, @r#"<img src="cid:c" alt="a+b" class="generated-equation" data-raw-latex="a+b" data-display="true" width="24" height="12">"#);
    }

    #[test]
    fn host_url_naming_the_file_is_kept() {
        let body = "$x$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            r#"{substituted}<img src="https://mail.example/att?name=eq_pending_1_0_x.png" alt="eq_pending_1_0_x.png">"#
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        assert_eq!(outcome.finalized, vec![0]);
        assert!(outcome.body.starts_with(r#"<img src="https://mail.example/att?name=eq_pending_1_0_x.png" alt="x""#));
        let again = rewriter.finalize(&outcome.body, &correlator);
        assert_eq!(again.body, outcome.body);
        assert!(again.finalized.is_empty());
    }

    #[test]
    fn title_with_sentinel_is_rewritten() {
        let body = "$x$";
        let (spans, correlator, rewriter) = setup(body);
        let substituted = rewriter.substitute(body, &spans, &correlator);
        let uploaded = format!(
            r#"{substituted}<img src="cid:c" title="eq_pending_1_0_x.png" class="CToWUd">"#
        );
        let outcome = rewriter.finalize(&uploaded, &correlator);
        insta::assert_snapshot!(outcome.body, @r#"<img src="cid:c" title="x" class="CToWUd generated-equation" alt="x" data-raw-latex="x" width="8" height="12">"#);
    }
}
