//! Error and diagnostic reporting for the analyses.
//!
//! All failure categories are consolidated here:
//! - Malformed input aborts construction (`Err(AnalysisError)`).
//! - Unsupported constructs and unsound fallbacks are reported through an
//!   injectable [`DiagnosticSink`] and then handled conservatively.
//! - Resource-cap hits collapse the affected set and continue.
//!
//! Warnings never abort an analysis that has started; errors are never used
//! as control flow.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashSet;

/// The four failure categories surfaced by the analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing operand, missing subgraph root, invalid node reference.
    MalformedInput,
    /// A construct the analysis cannot model precisely.
    UnsupportedConstruct,
    /// The analysis continued with an unsound assumption.
    UnsoundFallback,
    /// A configured size cap was exceeded and the result was collapsed.
    ResourceCapHit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::UnsupportedConstruct => "unsupported construct",
            ErrorKind::UnsoundFallback => "unsound fallback",
            ErrorKind::ResourceCapHit => "resource cap hit",
        };
        f.write_str(s)
    }
}

/// An error surfaced to the caller.
#[derive(Debug, Clone)]
pub struct AnalysisError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AnalysisError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> AnalysisError {
        AnalysisError {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> AnalysisError {
        AnalysisError::new(ErrorKind::MalformedInput, message)
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for AnalysisError {}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Return early with a [`ErrorKind::MalformedInput`] error.
#[macro_export]
macro_rules! malformed {
    ($($arg:tt)*) => {
        return Err($crate::diagnostics::AnalysisError::new(
            $crate::diagnostics::ErrorKind::MalformedInput,
            format!($($arg)*),
        ))
    };
}

/// Receiver for non-fatal analysis diagnostics.
///
/// The host injects an implementation to collect warnings; the default
/// forwards to the `log` crate.
pub trait DiagnosticSink {
    fn report(&mut self, kind: ErrorKind, message: &str);
}

/// Default sink forwarding diagnostics to `log`.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&mut self, kind: ErrorKind, message: &str) {
        match kind {
            ErrorKind::UnsoundFallback => log::warn!("{kind}: {message}"),
            ErrorKind::ResourceCapHit => log::debug!("{kind}: {message}"),
            _ => log::warn!("{kind}: {message}"),
        }
    }
}

/// Sink that records every diagnostic; used in tests and by hosts that
/// postprocess warnings.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub reports: Vec<(ErrorKind, String)>,
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, kind: ErrorKind, message: &str) {
        self.reports.push((kind, message.to_string()));
    }
}

/// De-duplicates per-construct reports so each (kind, node) pair is
/// reported at most once per analysis run.
#[derive(Debug, Default)]
pub struct OnceReporter {
    seen: FxHashSet<(ErrorKind, u32)>,
}

impl OnceReporter {
    pub fn report(
        &mut self,
        sink: &mut dyn DiagnosticSink,
        kind: ErrorKind,
        node: u32,
        message: &str,
    ) {
        if self.seen.insert((kind, node)) {
            sink.report(kind, message);
        }
    }
}
