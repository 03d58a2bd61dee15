//! CLI output formatting.
//!
//! Human-readable output with colored symbols, or one JSON object per line
//! when `--json` is set. `--quiet` suppresses everything but warnings and
//! errors.

use std::fmt::Display;

use owo_colors::OwoColorize;
use parking_lot::RwLock;
use serde_json::{json, Value};

/// Runtime output configuration shared by CLI handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
    pub verbose: u8,
}

impl OutputConfig {
    #[must_use]
    pub const fn new(json: bool, quiet: bool, verbose: u8) -> Self {
        Self {
            json,
            quiet,
            verbose,
        }
    }
}

static MODE: RwLock<OutputConfig> = parking_lot::const_rwlock(OutputConfig::new(false, false, 0));

fn mode() -> OutputConfig {
    *MODE.read()
}

/// One unit of CLI output, rendered either as text or as a tagged JSON line.
enum Line<'a> {
    Header(&'a str),
    Field(&'a str, String),
    Success(&'a str),
    Warning(&'a str),
    Section(&'a str),
}

impl Line<'_> {
    /// Warnings survive `--quiet`.
    const fn always_shown(&self) -> bool {
        matches!(self, Line::Warning(_))
    }

    fn tagged(&self) -> Value {
        let (kind, payload) = match self {
            Line::Header(version) => ("header", json!({ "app": "botfleet", "version": version })),
            Line::Field(label, value) => ("field", json!({ "label": label, "value": value })),
            Line::Success(message) => ("success", json!({ "message": message })),
            Line::Warning(message) => ("warning", json!({ "message": message })),
            Line::Section(title) => ("section", json!({ "title": title })),
        };
        json!({ "type": kind, "payload": payload })
    }

    fn render(&self) {
        match self {
            Line::Header(version) => println!("{} {}\n", "botfleet".bold(), version.dimmed()),
            Line::Field(label, value) => println!("  {:<12} {value}", label.dimmed()),
            Line::Success(message) => println!("  {} {message}", "✓".green()),
            Line::Warning(message) => println!("  {} {message}", "⚠".yellow()),
            Line::Section(title) => println!("\n{}", title.bold()),
        }
    }
}

fn emit(line: &Line<'_>) {
    let mode = mode();
    if mode.json {
        println!("{}", line.tagged());
    } else if !mode.quiet || line.always_shown() {
        line.render();
    }
}

/// Apply output settings from global CLI flags.
pub fn configure(config: OutputConfig) {
    *MODE.write() = config;
}

#[must_use]
pub fn is_json() -> bool {
    mode().json
}

#[must_use]
pub fn is_quiet() -> bool {
    mode().quiet
}

#[must_use]
pub fn verbosity() -> u8 {
    mode().verbose
}

/// Print the application name and version.
pub fn header(version: &str) {
    emit(&Line::Header(version));
}

/// Print a labeled value.
pub fn field(label: &str, value: impl Display) {
    emit(&Line::Field(label, value.to_string()));
}

pub fn success(message: &str) {
    emit(&Line::Success(message));
}

pub fn warning(message: &str) {
    emit(&Line::Warning(message));
}

pub fn section(title: &str) {
    emit(&Line::Section(title));
}

/// Print an error line to stderr.
pub fn error(message: &str) {
    if mode().json {
        eprintln!("{}", json!({ "type": "error", "payload": { "message": message } }));
    } else {
        eprintln!("  {} {message}", "×".red());
    }
}

/// Print pre-rendered text (e.g. a table), indented.
pub fn lines(text: &str) {
    let mode = mode();
    if mode.quiet && !mode.json {
        return;
    }
    for line in text.lines() {
        println!("  {line}");
    }
}

/// Print a complete JSON document.
pub fn json_output(value: Value) {
    println!("{value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_lines_carry_kind_and_payload() {
        let value = Line::Field("Bots", "2".into()).tagged();
        assert_eq!(value["type"], "field");
        assert_eq!(value["payload"]["label"], "Bots");
        assert_eq!(value["payload"]["value"], "2");
    }

    #[test]
    fn only_warnings_bypass_quiet() {
        assert!(Line::Warning("x").always_shown());
        assert!(!Line::Success("x").always_shown());
        assert!(!Line::Section("x").always_shown());
    }
}
