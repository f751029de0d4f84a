//! LaTeX to PNG rendering.
//!
//! A [`Typesetter`] turns LaTeX into SVG; the SVG is measured and rasterized
//! with resvg at the configured scale.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use pulldown_latex::{Parser, Storage};

use crate::config::RenderConfig;
use crate::error::{InvalidSyntax, RenderError};

/// Converts LaTeX into a standalone SVG document.
///
/// Implementations wrap an external typesetting engine. They are shared across
/// every equation of every cycle, so keep per-call state out of them.
pub trait Typesetter: Send + Sync {
    fn typeset(
        &self,
        latex: &str,
        display: bool,
    ) -> impl Future<Output = Result<String, RenderError>> + Send;
}

impl<T: Typesetter> Typesetter for Arc<T> {
    fn typeset(
        &self,
        latex: &str,
        display: bool,
    ) -> impl Future<Output = Result<String, RenderError>> + Send {
        (**self).typeset(latex, display)
    }
}

/// A rasterized equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    /// PNG-encoded pixels
    pub png: Bytes,
    /// Natural width of the typeset output, in CSS pixels
    pub width: u32,
    /// Natural height of the typeset output, in CSS pixels
    pub height: u32,
    /// Width of the pixel buffer (natural width times scale)
    pub pixel_width: u32,
    /// Height of the pixel buffer
    pub pixel_height: u32,
}

/// Renders LaTeX to raster images through a shared typesetter.
pub struct MathRenderer<T> {
    typesetter: T,
    scale: f32,
    validate: bool,
}

impl<T: Typesetter> MathRenderer<T> {
    pub fn new(typesetter: T, config: &RenderConfig) -> Self {
        Self {
            typesetter,
            scale: config.scale,
            validate: config.validate_syntax,
        }
    }

    pub fn typesetter(&self) -> &T {
        &self.typesetter
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn render(&self, latex: &str, is_display: bool) -> Result<RasterImage, RenderError> {
        if self.validate {
            validate_latex(latex)?;
        }
        let svg = self.typesetter.typeset(latex, is_display).await?;
        let scale = self.scale;
        let image = tokio::task::spawn_blocking(move || rasterize(&svg, scale))
            .await
            .map_err(|e| RenderError::RasterizationFailed(format!("rasterizer task: {e}")))??;
        tracing::debug!(
            width = image.width,
            height = image.height,
            bytes = image.png.len(),
            "rendered equation"
        );
        Ok(image)
    }
}

/// Parse `latex` with pulldown-latex and report the first problems found.
pub fn validate_latex(latex: &str) -> Result<(), InvalidSyntax> {
    let storage = Storage::new();
    let parser = Parser::new(latex, &storage);
    let errors: Vec<String> = parser
        .filter_map(|event| event.err().map(|err| err.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(InvalidSyntax::new(latex, errors.join("; ")))
    }
}

/// Font database shared by every rasterization, loaded on first use.
fn shared_fontdb() -> Arc<fontdb::Database> {
    static FONTDB: OnceLock<Arc<fontdb::Database>> = OnceLock::new();
    FONTDB
        .get_or_init(|| {
            let mut db = fontdb::Database::new();
            db.load_system_fonts();
            tracing::debug!(faces = db.len(), "loaded system fonts for rasterization");
            Arc::new(db)
        })
        .clone()
}

/// Measure `svg` and rasterize it at `scale` times its natural size.
///
/// The tree and pixmap only live for the duration of the call.
pub fn rasterize(svg: &str, scale: f32) -> Result<RasterImage, RenderError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(RenderError::RasterizationFailed(format!(
            "invalid scale {scale}"
        )));
    }

    let options = usvg::Options {
        fontdb: shared_fontdb(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_str(svg, &options)
        .map_err(|e| RenderError::RasterizationFailed(format!("failed to parse SVG: {e}")))?;

    let size = tree.size();
    let (natural_w, natural_h) = (size.width(), size.height());
    if !(natural_w > 0.0 && natural_h > 0.0) {
        return Err(RenderError::RasterizationFailed(format!(
            "typeset output is empty ({natural_w}x{natural_h})"
        )));
    }

    let pixel_width = (natural_w * scale).ceil() as u32;
    let pixel_height = (natural_h * scale).ceil() as u32;
    let mut pixmap = tiny_skia::Pixmap::new(pixel_width, pixel_height).ok_or_else(|| {
        RenderError::RasterizationFailed(format!(
            "failed to create {pixel_width}x{pixel_height} pixmap"
        ))
    })?;

    resvg::render(
        &tree,
        tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );

    let png = pixmap
        .encode_png()
        .map_err(|e| RenderError::RasterizationFailed(format!("failed to encode PNG: {e}")))?;

    Ok(RasterImage {
        png: Bytes::from(png),
        width: natural_w.ceil() as u32,
        height: natural_h.ceil() as u32,
        pixel_width,
        pixel_height,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    /// Typesetter producing a box sized by the expression length.
    ///
    /// Any expression containing `\broken` yields an empty SVG.
    pub(crate) struct BoxTypesetter;

    impl Typesetter for BoxTypesetter {
        fn typeset(
            &self,
            latex: &str,
            _display: bool,
        ) -> impl Future<Output = Result<String, RenderError>> + Send {
            let svg = box_svg(latex);
            async move { Ok(svg) }
        }
    }

    pub(crate) fn box_svg(latex: &str) -> String {
        let (w, h) = if latex.contains(r"\broken") {
            (0, 0)
        } else {
            (8 * latex.chars().count().max(1), 12)
        };
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}"><rect width="{w}" height="{h}" fill="black"/></svg>"#
        )
    }

    #[test]
    fn rasterizes_at_scale() {
        let image = rasterize(&box_svg("ab"), 2.0).unwrap();
        assert_eq!((image.width, image.height), (16, 12));
        assert_eq!((image.pixel_width, image.pixel_height), (32, 24));
        assert!(image.png.starts_with(PNG_MAGIC));
    }

    #[test]
    fn rounds_fractional_sizes_up() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="10.2" height="5.5"><rect width="10" height="5"/></svg>"#;
        let image = rasterize(svg, 1.5).unwrap();
        assert_eq!((image.width, image.height), (11, 6));
        assert_eq!((image.pixel_width, image.pixel_height), (16, 9));
    }

    #[test]
    fn empty_output_fails() {
        let err = rasterize(&box_svg(r"\broken"), 2.0).unwrap_err();
        assert!(matches!(err, RenderError::RasterizationFailed(_)));
        let err = rasterize("not svg at all", 2.0).unwrap_err();
        assert!(matches!(err, RenderError::RasterizationFailed(_)));
    }

    #[test]
    fn rejects_bad_scale() {
        let err = rasterize(&box_svg("x"), 0.0).unwrap_err();
        assert!(matches!(err, RenderError::RasterizationFailed(_)));
    }

    #[test]
    fn validates_latex() {
        assert!(validate_latex(r"\frac{a}{b}").is_ok());
        assert!(validate_latex(r"\sum_{i=0}^{n} x_i").is_ok());
        let err = validate_latex(r"\frac{a").unwrap_err();
        assert_eq!(err.latex(), r"\frac{a");
        assert!(!err.message().is_empty());
    }

    #[tokio::test]
    async fn renderer_rejects_invalid_syntax_before_typesetting() {
        let config = RenderConfig {
            validate_syntax: true,
            ..Default::default()
        };
        let renderer = MathRenderer::new(BoxTypesetter, &config);
        let err = renderer.render(r"\frac{a", false).await.unwrap_err();
        assert!(matches!(err, RenderError::InvalidSyntax(_)));
        let image = renderer.render("x^2", false).await.unwrap();
        assert_eq!(image.width, 24);
    }

    #[tokio::test]
    async fn engine_decides_by_default() {
        assert!(validate_latex(r"\boxed{x}").is_err());
        let renderer = MathRenderer::new(BoxTypesetter, &RenderConfig::default());
        let image = renderer.render(r"\boxed{x}", false).await.unwrap();
        assert_eq!(image.width, 8 * 9);
    }
}
