//! Typesetting through an external LaTeX to SVG command.

use std::future::Future;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;

use crate::config::TypesetterConfig;
use crate::error::{InvalidSyntax, RenderError};
use crate::html;
use crate::render::Typesetter;

/// MathJax reports TeX errors inside otherwise valid SVG output.
static MJX_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-mjx-error="([^"]*)""#).unwrap());

/// Runs a command such as MathJax's `tex2svg` once per equation.
#[derive(Debug, Clone)]
pub struct CommandTypesetter {
    config: TypesetterConfig,
}

impl CommandTypesetter {
    pub fn new(config: TypesetterConfig) -> Self {
        Self { config }
    }

    fn command(&self, latex: &str, display: bool) -> Command {
        let mode_args = if display {
            &self.config.display_args
        } else {
            &self.config.inline_args
        };
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(mode_args)
            .arg("--")
            .arg(latex)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Typesetter for CommandTypesetter {
    fn typeset(
        &self,
        latex: &str,
        display: bool,
    ) -> impl Future<Output = Result<String, RenderError>> + Send {
        let mut cmd = self.command(latex, display);
        let program = self.config.program.clone();
        async move {
            let output = cmd.output().await.map_err(|e| RenderError::EngineUnavailable {
                message: format!("failed to run `{program}`: {e}"),
            })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = stderr.trim();
                let message = if message.is_empty() {
                    format!("`{program}` exited with {}", output.status)
                } else {
                    message.to_string()
                };
                return Err(InvalidSyntax::new(latex, message).into());
            }

            let svg = String::from_utf8(output.stdout).map_err(|_| {
                RenderError::RasterizationFailed(format!("`{program}` produced non-UTF-8 output"))
            })?;
            parse_output(latex, svg)
        }
    }
}

/// Check typesetter output: engine-reported TeX errors become `InvalidSyntax`.
fn parse_output(latex: &str, svg: String) -> Result<String, RenderError> {
    if let Some(caps) = MJX_ERROR_RE.captures(&svg) {
        let message = html::decode_entities(&caps[1]).into_owned();
        return Err(InvalidSyntax::new(latex, message).into());
    }
    if !svg.contains("<svg") {
        return Err(RenderError::RasterizationFailed(
            "typesetter output contains no SVG".to_string(),
        ));
    }
    Ok(svg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mathjax_errors_are_syntax_errors() {
        let svg = r#"<svg><g data-mml-node="merror" data-mjx-error="Missing close brace"></g></svg>"#;
        let err = parse_output(r"\frac{a", svg.to_string()).unwrap_err();
        match err {
            RenderError::InvalidSyntax(e) => assert_eq!(e.message(), "Missing close brace"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_svg_output_is_rejected() {
        let err = parse_output("x", "usage: tex2svg".to_string()).unwrap_err();
        assert!(matches!(err, RenderError::RasterizationFailed(_)));
    }

    #[test]
    fn builds_arguments_per_mode() {
        let typesetter = CommandTypesetter::new(TypesetterConfig::default());
        let inline = typesetter.command("-x", false);
        let args: Vec<_> = inline.as_std().get_args().collect();
        assert_eq!(args, ["--inline", "--", "-x"]);
        let display = typesetter.command("y", true);
        let args: Vec<_> = display.as_std().get_args().collect();
        assert_eq!(args, ["--", "y"]);
    }

    #[tokio::test]
    async fn missing_program_is_engine_unavailable() {
        let typesetter = CommandTypesetter::new(TypesetterConfig {
            program: "texmail-no-such-typesetter".into(),
            ..Default::default()
        });
        let err = typesetter.typeset("x", false).await.unwrap_err();
        assert!(matches!(err, RenderError::EngineUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_is_invalid_syntax() {
        let typesetter = CommandTypesetter::new(TypesetterConfig {
            program: "false".into(),
            inline_args: Vec::new(),
            ..Default::default()
        });
        let err = typesetter.typeset("x", false).await.unwrap_err();
        assert!(matches!(err, RenderError::InvalidSyntax(_)));
    }
}
