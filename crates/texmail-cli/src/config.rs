//! KDL settings file.
//!
//! ```kdl
//! scale 3
//! timeout-ms 15000
//! typesetter "tex2svg" "--font" "TeX"
//! inline-args "--inline"
//! brackets false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode, KdlValue};
use miette::{IntoDiagnostic, Result};
use texmail_core::RenderConfig;

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("texmail").join("config.kdl"))
}

/// Load settings from `path`, or from the default location when it exists.
pub fn load(path: Option<&Path>) -> Result<RenderConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(RenderConfig::default()),
        },
    };
    tracing::debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(&path)
        .into_diagnostic()
        .map_err(|e| e.wrap_err(format!("failed to read {}", path.display())))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<RenderConfig> {
    let doc: KdlDocument = text.parse().map_err(miette::Report::new)?;
    let mut config = RenderConfig::default();

    for node in doc.nodes() {
        let name = node.name().value();
        match name {
            "scale" => config.scale = number(node)? as f32,
            "timeout-ms" => config.upload_timeout = Duration::from_millis(integer(node)?),
            "poll-ms" => config.poll_interval = Duration::from_millis(integer(node)?),
            "concurrency" => config.concurrency = integer(node)? as usize,
            "display-dollars" => config.delimiters.display_dollars = boolean(node)?,
            "brackets" => config.delimiters.brackets = boolean(node)?,
            "parens" => config.delimiters.parens = boolean(node)?,
            "validate" => config.validate_syntax = boolean(node)?,
            "sentinel" => config.sentinel = string(node)?,
            "marker-class" => config.marker_class = string(node)?,
            "typesetter" => {
                let mut words = strings(node)?.into_iter();
                config.typesetter.program = words
                    .next()
                    .ok_or_else(|| miette::miette!("`typesetter` needs a program name"))?;
                config.typesetter.args = words.collect();
            }
            "inline-args" => config.typesetter.inline_args = strings(node)?,
            "display-args" => config.typesetter.display_args = strings(node)?,
            other => tracing::warn!(node = other, "ignoring unknown config setting"),
        }
    }

    Ok(config.normalized())
}

fn value<'a>(node: &'a KdlNode) -> Result<&'a KdlValue> {
    node.entries()
        .first()
        .map(|entry| entry.value())
        .ok_or_else(|| miette::miette!("`{}` needs a value", node.name().value()))
}

fn number(node: &KdlNode) -> Result<f64> {
    let value = value(node)?;
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|n| n as f64))
        .ok_or_else(|| miette::miette!("`{}` must be a number", node.name().value()))
}

fn integer(node: &KdlNode) -> Result<u64> {
    value(node)?
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| miette::miette!("`{}` must be a non-negative integer", node.name().value()))
}

fn boolean(node: &KdlNode) -> Result<bool> {
    value(node)?
        .as_bool()
        .ok_or_else(|| miette::miette!("`{}` must be true or false", node.name().value()))
}

fn string(node: &KdlNode) -> Result<String> {
    value(node)?
        .as_string()
        .map(str::to_string)
        .ok_or_else(|| miette::miette!("`{}` must be a string", node.name().value()))
}

fn strings(node: &KdlNode) -> Result<Vec<String>> {
    node.entries()
        .iter()
        .map(|entry| {
            entry.value().as_string().map(str::to_string).ok_or_else(|| {
                miette::miette!("`{}` takes only strings", node.name().value())
            })
        })
        .collect()
}
