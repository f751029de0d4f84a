//! Render pipeline settings.

use std::time::Duration;

/// Reserved substring marking attachments that are uploaded but not yet finalized.
pub const DEFAULT_SENTINEL: &str = "_pending_";

/// Class carried by every tag this crate generates.
pub const DEFAULT_MARKER_CLASS: &str = "generated-equation";

/// Which optional delimiter forms are recognised. `$...$` is always on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    /// `$$...$$` display math
    pub display_dollars: bool,
    /// `\[...\]` display math
    pub brackets: bool,
    /// `\(...\)` inline math
    pub parens: bool,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            display_dollars: true,
            brackets: true,
            parens: true,
        }
    }
}

/// External LaTeX to SVG command.
///
/// The command is invoked as `program [args] [inline_args|display_args] -- <latex>`
/// and must print an SVG document on stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct TypesetterConfig {
    pub program: String,
    pub args: Vec<String>,
    pub inline_args: Vec<String>,
    pub display_args: Vec<String>,
}

impl Default for TypesetterConfig {
    /// MathJax's `tex2svg` from `mathjax-node-cli`.
    fn default() -> Self {
        Self {
            program: "tex2svg".to_string(),
            args: Vec::new(),
            inline_args: vec!["--inline".to_string()],
            display_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Raster upscale factor relative to the natural size of the typeset output.
    pub scale: f32,
    /// How long to wait for the host to confirm every upload.
    pub upload_timeout: Duration,
    /// Poll interval used when the host offers no mutation observation.
    pub poll_interval: Duration,
    /// Maximum number of equations rendered at once.
    pub concurrency: usize,
    pub delimiters: Delimiters,
    pub sentinel: String,
    pub marker_class: String,
    /// Parse LaTeX with pulldown-latex before handing it to the typesetter.
    ///
    /// Off by default: pulldown-latex knows fewer commands than MathJax
    /// (`\boxed`, `\tag`, `\newcommand`), so only turn this on for engines with
    /// the same command set.
    pub validate_syntax: bool,
    pub typesetter: TypesetterConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scale: 2.0,
            upload_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            concurrency: 4,
            delimiters: Delimiters::default(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            marker_class: DEFAULT_MARKER_CLASS.to_string(),
            validate_syntax: false,
            typesetter: TypesetterConfig::default(),
        }
    }
}

impl RenderConfig {
    /// Clamp values that would stall or break a cycle.
    pub fn normalized(mut self) -> Self {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            tracing::warn!(scale = self.scale, "invalid raster scale, using 2.0");
            self.scale = 2.0;
        }
        self.concurrency = self.concurrency.max(1);
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(250);
        }
        if self.sentinel.trim().is_empty() {
            self.sentinel = DEFAULT_SENTINEL.to_string();
        }
        if self.marker_class.trim().is_empty() {
            self.marker_class = DEFAULT_MARKER_CLASS.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_fixes_degenerate_values() {
        let config = RenderConfig {
            scale: f32::NAN,
            concurrency: 0,
            poll_interval: Duration::ZERO,
            sentinel: " ".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.scale, 2.0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.sentinel, DEFAULT_SENTINEL);
    }

    #[test]
    fn normalized_keeps_valid_values() {
        let config = RenderConfig {
            scale: 3.0,
            concurrency: 8,
            ..Default::default()
        };
        assert_eq!(config.clone().normalized(), config);
    }
}
