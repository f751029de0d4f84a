//! Error types for texmail

use miette::{Diagnostic, NamedSource, SourceSpan};
use std::time::Duration;

/// Main error type for the render pipeline.
///
/// The first three variants are local to a single equation: the equation keeps
/// its original text and the rest of the cycle carries on. The others concern
/// a whole render cycle.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum RenderError {
    /// LaTeX rejected by the parser or the typesetting engine
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidSyntax(#[from] InvalidSyntax),

    /// Typesetter output could not be turned into a raster image
    #[error("rasterization failed: {0}")]
    #[diagnostic(code(texmail::raster))]
    RasterizationFailed(String),

    /// The typesetting engine could not be started
    #[error("typesetting engine unavailable: {message}")]
    #[diagnostic(
        code(texmail::engine),
        help("install MathJax's `tex2svg` or point the `typesetter` setting at another LaTeX to SVG command")
    )]
    EngineUnavailable { message: String },

    /// The host never confirmed every uploaded equation
    #[error("host confirmed {observed} of {expected} uploaded equations within {waited:?}")]
    #[diagnostic(
        code(texmail::upload_timeout),
        help("the body was reverted to its original text; try rendering again")
    )]
    UploadTimeout {
        expected: usize,
        observed: usize,
        waited: Duration,
    },

    /// Confirmed uploads could not all be matched to equations
    #[error(
        "expected {expected} uploaded equations, correlated {confirmed}, discarded {discarded} unmatched uploads"
    )]
    #[diagnostic(
        code(texmail::correlation),
        severity(Warning),
        help("unmatched equations were left as plain LaTeX")
    )]
    CorrelationMismatch {
        expected: usize,
        confirmed: usize,
        /// Uploads naming an equation that was already matched or does not exist
        discarded: usize,
    },

    /// A second activation arrived while a cycle was running
    #[error("a render cycle is already running on this compose surface")]
    #[diagnostic(code(texmail::busy))]
    CycleInFlight,

    /// An upload waiter was asked to wait a second time
    #[error("upload waiter already ran; create a new one per render cycle")]
    #[diagnostic(code(texmail::waiter))]
    WaiterSpent,

    /// The compose surface went away mid-cycle
    #[error("compose surface was discarded")]
    #[diagnostic(code(texmail::cancelled))]
    Cancelled,

    /// Error reported by the host compose surface
    #[error(transparent)]
    #[diagnostic(transparent)]
    Host(#[from] HostError),
}

impl RenderError {
    /// Whether the error only affects the one equation it was raised for.
    pub fn is_equation_local(&self) -> bool {
        matches!(
            self,
            RenderError::InvalidSyntax(_)
                | RenderError::RasterizationFailed(_)
                | RenderError::EngineUnavailable { .. }
        )
    }
}

/// LaTeX syntax error, labelled against the offending source
#[derive(thiserror::Error, Debug, Diagnostic)]
#[error("invalid LaTeX: {message}")]
#[diagnostic(
    code(texmail::syntax),
    help("the equation was left as plain text in the message")
)]
pub struct InvalidSyntax {
    message: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("in this expression")]
    location: SourceSpan,
}

impl InvalidSyntax {
    pub fn new(latex: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            src: NamedSource::new("latex", latex.to_string()),
            location: SourceSpan::new(0.into(), latex.len()),
        }
    }

    /// The LaTeX source that failed to parse.
    pub fn latex(&self) -> &str {
        self.src.inner()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error type for host compose-surface operations.
#[derive(thiserror::Error, Debug, Clone, Diagnostic)]
#[error("host error: {0}")]
#[diagnostic(code(texmail::host))]
pub struct HostError(pub String);

impl From<&str> for HostError {
    fn from(s: &str) -> Self {
        HostError(s.to_string())
    }
}

impl From<String> for HostError {
    fn from(s: String) -> Self {
        HostError(s)
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError(err.to_string())
    }
}
