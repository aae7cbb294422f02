//! Test helpers shared with the adapter crates (`testing` feature).

use crate::context::RequestContext;
use crate::error::PanicError;
use crate::logger::{Fields, QueueLogger};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Logger that keeps every line in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
    panics: Mutex<Vec<(String, String)>>,
}

impl RecordingLogger {
    fn record(&self, level: Level, msg: &str, err: Option<&dyn std::error::Error>) {
        let line = match err {
            Some(e) => format!("{msg}: {e}"),
            None => msg.to_string(),
        };
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((level, line));
    }

    fn at(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn infos(&self) -> Vec<String> {
        self.at(Level::Info)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.at(Level::Warn)
    }

    pub fn errors(&self) -> Vec<String> {
        self.at(Level::Error)
    }

    /// `(cid, message)` for each reported panic.
    pub fn panics(&self) -> Vec<(String, String)> {
        self.panics.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl QueueLogger for RecordingLogger {
    fn info(&self, msg: &str, _fields: Fields<'_>) {
        self.record(Level::Info, msg, None);
    }

    fn warn(&self, msg: &str, err: Option<&dyn std::error::Error>, _fields: Fields<'_>) {
        self.record(Level::Warn, msg, err);
    }

    fn error(&self, msg: &str, err: Option<&dyn std::error::Error>, _fields: Fields<'_>) {
        self.record(Level::Error, msg, err);
    }

    fn panic_report(&self, ctx: &RequestContext, msg: &str, _panic: &PanicError) {
        self.panics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((ctx.cid.clone(), msg.to_string()));
    }
}
