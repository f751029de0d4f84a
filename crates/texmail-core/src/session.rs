//! One compose window's render cycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::StreamExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::RenderConfig;
use crate::correlate::{AttachmentCorrelator, leftover_uploads};
use crate::error::RenderError;
use crate::extract::{MathSpanExtractor, unique_spans};
use crate::host::ComposeSurface;
use crate::html;
use crate::math::{InlineRender, render_inline};
use crate::render::{MathRenderer, Typesetter};
use crate::rewrite::PlaceholderRewriter;
use crate::round_trip::{
    Activation, LatexEditor, generated_latex, is_display, nth_image, replace_with_source,
    restore_all,
};
use crate::waiter::UploadWaiter;

/// An equation that kept its original text.
#[derive(Debug)]
pub struct EquationFailure {
    pub raw_match: String,
    pub error: RenderError,
}

/// Summary of one render cycle.
#[derive(Debug, Default)]
pub struct RenderReport {
    /// Math spans found in the body, duplicates included
    pub spans: usize,
    /// Unique equations that rendered and were uploaded
    pub equations: usize,
    /// Equations replaced by a finalized image
    pub finalized: usize,
    pub failed: Vec<EquationFailure>,
    /// Recoverable problems, such as a correlation mismatch
    pub warnings: Vec<RenderError>,
}

/// Runs render cycles against one compose surface, one at a time.
///
/// The renderer is shared: hand the same `Arc` to every session so the
/// typesetter and font database are set up once per process. Dropping the
/// session cancels any cycle still waiting on the host.
pub struct ComposeSession<S, T> {
    surface: S,
    renderer: Arc<MathRenderer<T>>,
    config: RenderConfig,
    extractor: MathSpanExtractor,
    rewriter: PlaceholderRewriter,
    in_flight: Mutex<()>,
    cycles: AtomicU32,
    cancel: CancellationToken,
}

impl<S: ComposeSurface, T: Typesetter> ComposeSession<S, T> {
    pub fn new(surface: S, renderer: Arc<MathRenderer<T>>, config: RenderConfig) -> Self {
        let config = config.normalized();
        Self {
            extractor: MathSpanExtractor::new(&config.delimiters),
            rewriter: PlaceholderRewriter::new(config.marker_class.clone()),
            surface,
            renderer,
            config,
            in_flight: Mutex::new(()),
            cycles: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// The compose surface went away: stop any waiting cycle and refuse new ones.
    pub fn discard(&self) {
        self.cancel.cancel();
    }

    fn begin(&self) -> Result<MutexGuard<'_, ()>, RenderError> {
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        let guard = self
            .in_flight
            .try_lock()
            .map_err(|_| RenderError::CycleInFlight)?;
        self.sweep_leftovers();
        Ok(guard)
    }

    /// Remove uploads the host inserted after their cycle had already given up.
    fn sweep_leftovers(&self) {
        let body = self.surface.body();
        let leftovers: Vec<_> =
            leftover_uploads(&body, &self.config.sentinel, &self.config.marker_class)
                .into_iter()
                .map(|block| block.range)
                .collect();
        if leftovers.is_empty() {
            return;
        }
        tracing::debug!(count = leftovers.len(), "removing late uploads from an ended cycle");
        self.surface.set_body(html::remove_ranges(&body, &leftovers));
    }

    /// Render every math span in the body to an uploaded image.
    pub async fn render(&self) -> Result<RenderReport, RenderError> {
        let _cycle = self.begin()?;
        self.run_cycle().await
    }

    #[tracing::instrument(skip(self), fields(cycle))]
    async fn run_cycle(&self) -> Result<RenderReport, RenderError> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::Span::current().record("cycle", cycle);

        let body = self.surface.body();
        let spans = self.extractor.extract(&body);
        let mut report = RenderReport {
            spans: spans.len(),
            ..Default::default()
        };
        if spans.is_empty() {
            tracing::debug!("no math in body");
            return Ok(report);
        }

        let unique = unique_spans(&spans);
        let renderer = &self.renderer;
        let results: Vec<_> = futures_util::stream::iter(
            unique
                .iter()
                .map(|span| async move { renderer.render(&span.latex, span.display).await }),
        )
        .buffered(self.config.concurrency)
        .collect()
        .await;
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let mut correlator = AttachmentCorrelator::new(
            &body,
            cycle,
            &self.config.sentinel,
            &self.config.marker_class,
        );
        for (span, result) in unique.iter().zip(results) {
            match result {
                Ok(image) => {
                    correlator.register(span, image);
                }
                Err(error) if error.is_equation_local() => {
                    tracing::warn!(latex = %span.latex, %error, "equation left as text");
                    report.failed.push(EquationFailure {
                        raw_match: span.raw_match.clone(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
        }
        if correlator.is_empty() {
            return Ok(report);
        }
        report.equations = correlator.len();

        // The body may have been edited while rendering; substitute into what is there now.
        let current = self.surface.body();
        let substituted = if current == body {
            self.rewriter.substitute(&body, &spans, &correlator)
        } else {
            tracing::debug!("body changed during rendering, re-extracting");
            let spans = self.extractor.extract(&current);
            self.rewriter.substitute(&current, &spans, &correlator)
        };
        self.surface.set_body(substituted);

        if let Err(error) = self.surface.attach_inline(correlator.attachments()).await {
            tracing::warn!(%error, "upload failed, reverting");
            self.revert(&correlator);
            return Err(error.into());
        }

        let mut waiter = UploadWaiter::new(&self.config);
        let confirmed = match waiter.wait(&self.surface, &correlator, &self.cancel).await {
            Ok(body) => body,
            Err(error) => {
                self.revert(&correlator);
                return Err(error);
            }
        };

        let outcome = self.rewriter.finalize(&confirmed, &correlator);
        self.surface.set_body(outcome.body);
        report.finalized = outcome.finalized.len();
        if let Some(mismatch) = outcome.mismatch {
            tracing::warn!(%mismatch, reverted = outcome.reverted.len(), "partial finalize");
            report.warnings.push(mismatch);
        }
        tracing::info!(
            spans = report.spans,
            equations = report.equations,
            finalized = report.finalized,
            failed = report.failed.len(),
            "render cycle complete"
        );
        Ok(report)
    }

    fn revert(&self, correlator: &AttachmentCorrelator) {
        let body = self.surface.body();
        self.surface.set_body(self.rewriter.revert(&body, correlator));
    }

    /// Edit the `index`-th image of the body if it is a generated equation, then
    /// re-render the whole body.
    #[tracing::instrument(skip(self, editor))]
    pub async fn activate<E: LatexEditor>(
        &self,
        index: usize,
        editor: &E,
    ) -> Result<Activation, RenderError> {
        let _cycle = self.begin()?;
        let body = self.surface.body();
        let images = html::images(&body);
        let Some(block) = images.get(index) else {
            return Ok(Activation::NotGenerated);
        };
        let Some(latex) = generated_latex(&block.tag, &self.config.marker_class) else {
            return Ok(Activation::NotGenerated);
        };
        let display = is_display(&block.tag);
        // Identical equations share identical markup; remember which copy this is.
        let occurrence = images[..index]
            .iter()
            .filter(|other| other.markup == block.markup)
            .count();

        let edited = match editor.edit(&latex).await {
            Some(edited) if !edited.trim().is_empty() => edited,
            _ => return Ok(Activation::Cancelled),
        };

        let body = self.surface.body();
        let Some(range) = html::images(&body)
            .into_iter()
            .filter(|other| other.markup == block.markup)
            .nth(occurrence)
            .map(|found| found.range)
        else {
            tracing::debug!("image disappeared while editing");
            return Ok(Activation::NotGenerated);
        };
        self.surface
            .set_body(replace_with_source(&body, range, edited.trim(), display));
        let report = self.run_cycle().await?;
        Ok(Activation::Edited(report))
    }

    /// The `index`-th image's LaTeX, if it is a generated equation.
    pub fn generated_source(&self, index: usize) -> Option<String> {
        let block = nth_image(&self.surface.body(), index)?;
        generated_latex(&block.tag, &self.config.marker_class)
    }

    /// Render every math span in place as MathML, without uploading anything.
    pub async fn render_mathml(&self) -> Result<InlineRender, RenderError> {
        let _cycle = self.begin()?;
        let body = self.surface.body();
        let out = render_inline(&body, &self.extractor, &self.config.marker_class);
        if out.rendered > 0 || !out.failed.is_empty() {
            self.surface.set_body(out.body.clone());
        }
        Ok(out)
    }

    /// Put every generated equation back as delimited LaTeX. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize, RenderError> {
        let _cycle = self.begin()?;
        let (body, restored) = restore_all(&self.surface.body(), &self.config.marker_class);
        if restored > 0 {
            self.surface.set_body(body);
        }
        Ok(restored)
    }
}

impl<S, T> Drop for ComposeSession<S, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
