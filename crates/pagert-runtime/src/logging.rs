//! Site-scoped log seam.
//!
//! The runtime never writes log files itself; it hands leveled, site-scoped lines
//! to a [`Logger`]. [`TracingLogger`] forwards to `tracing`, [`MemoryLogger`]
//! keeps lines in memory for reports and tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, site: &str, line: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, site: &str, line: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(site, "{line}"),
            LogLevel::Info => tracing::info!(site, "{line}"),
            LogLevel::Warn => tracing::warn!(site, "{line}"),
            LogLevel::Error => tracing::error!(site, "{line}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub site: String,
    pub line: String,
}

/// Captures every line; optionally forwards to another logger as well.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    lines: Arc<Mutex<Vec<LogLine>>>,
    forward: Option<Arc<dyn Logger>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding_to(logger: Arc<dyn Logger>) -> Self {
        MemoryLogger {
            lines: Arc::default(),
            forward: Some(logger),
        }
    }

    pub fn lines(&self) -> Vec<LogLine> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.line.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, site: &str, line: &str) {
        let entry = LogLine {
            level,
            site: site.to_string(),
            line: line.to_string(),
        };
        match self.lines.lock() {
            Ok(mut lines) => lines.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        if let Some(next) = &self.forward {
            next.log(level, site, line);
        }
    }
}

pub fn runtime_error_line(site: &str, page: &Path, cause: &str) -> String {
    format!(
        "Site: {site}: Runtime error on file {}: {cause}",
        page.display()
    )
}

pub fn timeout_line(limit_seconds: u64) -> String {
    format!("Timeout exceeded limit of {limit_seconds} seconds")
}
