//! Logging seam used by the adapters for per-message events.

use crate::context::RequestContext;
use crate::error::PanicError;
use std::fmt;

/// Structured key/value fields attached to a log line.
pub type Fields<'a> = &'a [(&'a str, &'a dyn fmt::Display)];

/// Minimal logger the adapters report through.
pub trait QueueLogger: Send + Sync {
    fn info(&self, msg: &str, fields: Fields<'_>);

    fn warn(&self, msg: &str, err: Option<&dyn std::error::Error>, fields: Fields<'_>);

    fn error(&self, msg: &str, err: Option<&dyn std::error::Error>, fields: Fields<'_>);

    /// Report a recovered handler panic together with the request it belongs to.
    fn panic_report(&self, ctx: &RequestContext, msg: &str, panic: &PanicError);
}

/// Default logger, forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

fn render(fields: Fields<'_>) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_error(err: Option<&dyn std::error::Error>) -> String {
    err.map(|e| e.to_string()).unwrap_or_default()
}

impl QueueLogger for TracingLogger {
    fn info(&self, msg: &str, fields: Fields<'_>) {
        tracing::info!(fields = %render(fields), "{msg}");
    }

    fn warn(&self, msg: &str, err: Option<&dyn std::error::Error>, fields: Fields<'_>) {
        tracing::warn!(error = %render_error(err), fields = %render(fields), "{msg}");
    }

    fn error(&self, msg: &str, err: Option<&dyn std::error::Error>, fields: Fields<'_>) {
        tracing::error!(error = %render_error(err), fields = %render(fields), "{msg}");
    }

    fn panic_report(&self, ctx: &RequestContext, msg: &str, panic: &PanicError) {
        tracing::error!(
            cid = %ctx.cid,
            elapsed_ms = ctx.elapsed_ms(),
            panic = %panic.message,
            backtrace = %panic.backtrace,
            "{msg}"
        );
    }
}
