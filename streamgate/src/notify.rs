//! Upstream error and diagnostic channels.

use crate::media::MediaType;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::debug;
use std::fmt;

/// Category of a fatal report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SessionCreation,
    DecryptFailure,
    HdcpAuthentication,
    HdcpCompliance,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub media_type: Option<MediaType>,
    pub code: Option<i32>,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?}: {} (code {})", self.kind, self.message, code),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Non-fatal event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// Output protection kept failing; playback continues.
    OutputProtection {
        media_type: Option<MediaType>,
        failures: u32,
    },
}

/// Sending half, cloned into every gate.
#[derive(Clone, Debug)]
pub struct Notifier {
    errors: Sender<ErrorReport>,
    diagnostics: Sender<Diagnostic>,
}

/// Receiving half, held by the player core.
#[derive(Clone, Debug)]
pub struct Notices {
    pub errors: Receiver<ErrorReport>,
    pub diagnostics: Receiver<Diagnostic>,
}

pub fn channel() -> (Notifier, Notices) {
    let (errors_tx, errors_rx) = unbounded();
    let (diagnostics_tx, diagnostics_rx) = unbounded();

    (
        Notifier {
            errors: errors_tx,
            diagnostics: diagnostics_tx,
        },
        Notices {
            errors: errors_rx,
            diagnostics: diagnostics_rx,
        },
    )
}

impl Notifier {
    pub fn error(&self, report: ErrorReport) {
        if let Err(e) = self.errors.send(report) {
            debug!("error report dropped, no receiver: {}", e.into_inner());
        }
    }

    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        if let Err(e) = self.diagnostics.send(diagnostic) {
            debug!("diagnostic dropped, no receiver: {:?}", e.into_inner());
        }
    }
}

impl Notices {
    /// Everything reported so far, without waiting.
    pub fn drain_errors(&self) -> Vec<ErrorReport> {
        self.errors.try_iter().collect()
    }

    pub fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.try_iter().collect()
    }
}
