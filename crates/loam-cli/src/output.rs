//! Output modes shared by every command.
//!
//! `--format` wins. Otherwise `--json` or `LOAM_FORMAT`, resolved through
//! [`loam_core::config::resolve_engine_config`], picks the mode; with
//! neither set, a TTY gets pretty output and a pipe gets text.

use clap::ValueEnum;
use loam_core::ErrorCode;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Headed sections of aligned `key: value` lines.
    Pretty,
    /// One `key=value` record per line.
    Text,
    Json,
}

impl OutputMode {
    pub fn resolve(flag: Option<Self>, resolved: &str) -> Self {
        flag.unwrap_or(match resolved {
            "json" => Self::Json,
            "text" => Self::Text,
            _ => Self::Pretty,
        })
    }
}

/// A heading underlined to the width of a terminal.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}\n{}", "-".repeat(72))
}

pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<16} {}", format!("{key}:"), value.as_ref())
}

/// Write `value` to stdout. JSON is derived from `Serialize`; the other two
/// modes get their own renderer.
pub fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Text => text(value, &mut out)?,
        OutputMode::Pretty => pretty(value, &mut out)?,
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

impl CliError {
    /// An uncoded failure, e.g. an `anyhow` chain rendered with `{:#}`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            hint: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            message: message.into(),
            code: Some(code.code()),
            hint: code.hint(),
        }
    }

    fn write(&self, mode: OutputMode, w: &mut dyn Write) -> anyhow::Result<()> {
        if mode == OutputMode::Json {
            serde_json::to_writer_pretty(&mut *w, &serde_json::json!({ "error": self }))?;
            writeln!(w)?;
            return Ok(());
        }
        match self.code {
            Some(code) => writeln!(w, "error[{code}]: {}", self.message)?,
            None => writeln!(w, "error: {}", self.message)?,
        }
        if let Some(hint) = self.hint {
            writeln!(w, "  hint: {hint}")?;
        }
        Ok(())
    }
}

/// Report `error` on stderr.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    error.write(mode, &mut io::stderr().lock())
}
