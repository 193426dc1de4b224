use std::backtrace::Backtrace;

use thiserror::Error;

/// Error kinds a segment kernel call can surface. Matches the kind taxonomy
/// of spec.md §7; `FatalInvariant` is the one kind callers must not attempt
/// to recover from (see `lib/collection/src/flow_graph`).
#[derive(Error, Debug, Clone)]
pub enum SegmentError {
    #[error("bad input: {description}")]
    BadInput { description: String },

    #[error("segment is unhealthy (being released concurrently)")]
    Unhealthy,

    #[error("service error: {description}")]
    ServiceError {
        description: String,
        backtrace: Option<String>,
    },

    #[error("fatal invariant violated: {description}")]
    FatalInvariant { description: String },
}

impl SegmentError {
    pub fn service_error(description: impl Into<String>) -> Self {
        SegmentError::ServiceError {
            description: description.into(),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn fatal(description: impl Into<String>) -> Self {
        SegmentError::FatalInvariant {
            description: description.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SegmentError::FatalInvariant { .. })
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, SegmentError::Unhealthy)
    }
}

pub type SegmentResult<T> = Result<T, SegmentError>;
