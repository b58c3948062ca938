use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Validate,
    Dimensions,
    Load,
    Aggregate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Dimensions => "dimensions",
            Stage::Load => "load",
            Stage::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub stage: Stage,
    /// 0–100.
    pub progress: u8,
    pub message: String,
}

impl StatusUpdate {
    pub fn new(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.min(100),
            message: message.into(),
        }
    }
}

/// Receiver for pipeline progress.
///
/// `report` is called inline from the pipeline and must not wait on I/O;
/// implementations that persist updates hand them off (see
/// [`crate::jobs::JobTracker`]).
pub trait StatusSink: Send + Sync {
    fn report(&self, update: StatusUpdate);
}

/// Discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl StatusSink for NoopSink {
    fn report(&self, _update: StatusUpdate) {}
}

impl<T: StatusSink + ?Sized> StatusSink for std::sync::Arc<T> {
    fn report(&self, update: StatusUpdate) {
        (**self).report(update)
    }
}
