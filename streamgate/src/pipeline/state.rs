use std::fmt;

/// Lifecycle of the pipeline.
///
/// Ordered: states only move forward, except that `Error` ends a tune.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    None,
    Tuning,
    Configured,
    Ready,
    Playing,
    ShuttingDown,
    Error,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Error)
    }

    /// Samples may flow.
    pub fn accepts_samples(&self) -> bool {
        matches!(self, Self::Ready | Self::Playing)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        matches!(
            (self, next),
            (None, Tuning)
                | (Tuning, Configured)
                | (Configured, Ready)
                | (Ready, Playing)
                | (Tuning | Configured, Error)
                | (None | Tuning | Configured | Ready | Playing, ShuttingDown)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
