//! texmail core
//!
//! Renders LaTeX written into a mail compose body as inline images. A render
//! cycle extracts the math spans, typesets and rasterizes each unique
//! equation, swaps the spans for placeholder comments, hands the images to the
//! host as inline attachments, waits for the host to insert them and finally
//! moves each uploaded image onto its placeholders. Generated images keep
//! their LaTeX in `data-raw-latex`, so they can be turned back into text.
//!
//! ```no_run
//! # async fn demo() -> Result<(), texmail_core::RenderError> {
//! use std::sync::Arc;
//! use texmail_core::{
//!     CommandTypesetter, ComposeSession, MathRenderer, MemoryCompose, RenderConfig,
//! };
//!
//! let config = RenderConfig::default();
//! let renderer = Arc::new(MathRenderer::new(
//!     CommandTypesetter::new(config.typesetter.clone()),
//!     &config,
//! ));
//! let session = ComposeSession::new(MemoryCompose::new("Solve $a+b$"), renderer, config);
//! let report = session.render().await?;
//! println!("{} equations rendered", report.finalized);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlate;
pub mod error;
pub mod extract;
pub mod host;
pub mod html;
pub mod math;
pub mod render;
pub mod rewrite;
pub mod round_trip;
pub mod session;
pub mod typeset;
pub mod waiter;

pub use config::{Delimiters, RenderConfig, TypesetterConfig};
pub use correlate::{AttachmentCorrelator, RenderedAsset, UploadIdentity};
pub use error::{HostError, InvalidSyntax, RenderError};
pub use extract::{MathSpan, MathSpanExtractor};
pub use host::memory::{ImageSource, MemoryCompose, MemoryOptions};
pub use host::{ComposeSurface, InlineAttachment};
pub use math::{InlineRender, MathResult, render_inline, render_math};
pub use render::{MathRenderer, RasterImage, Typesetter};
pub use rewrite::{FinalizeOutcome, PlaceholderRewriter};
pub use round_trip::{Activation, LatexEditor};
pub use session::{ComposeSession, EquationFailure, RenderReport};
pub use typeset::CommandTypesetter;
pub use waiter::{UploadWaiter, WaiterState};
