use std::backtrace::Backtrace;

use segment::SegmentError;
use thiserror::Error;

/// Error taxonomy for the collection crate (MetaReplica, FlowGraph,
/// SegmentLoader). Mirrors the kind list in spec.md §7; the teacher's
/// `StorageError` (see `lib/storage/src/content_manager/errors.rs`) is the
/// idiom this enum follows.
#[derive(Error, Debug, Clone)]
pub enum CollectionError {
    #[error("not found: {description}")]
    NotFound { description: String },

    #[error("wrong segment type: {description}")]
    WrongType { description: String },

    #[error("already exists: {description}")]
    AlreadyExists { description: String },

    #[error("bad input: {description}")]
    BadInput { description: String },

    #[error("insufficient memory to load: {description}")]
    InsufficientMemory { description: String },

    #[error("channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("fatal invariant violated: {description}")]
    FatalInvariant { description: String },

    #[error("service error: {description}")]
    ServiceError {
        description: String,
        backtrace: Option<String>,
    },
}

impl CollectionError {
    pub fn not_found(description: impl Into<String>) -> Self {
        CollectionError::NotFound {
            description: description.into(),
        }
    }

    pub fn already_exists(description: impl Into<String>) -> Self {
        CollectionError::AlreadyExists {
            description: description.into(),
        }
    }

    pub fn wrong_type(description: impl Into<String>) -> Self {
        CollectionError::WrongType {
            description: description.into(),
        }
    }

    pub fn fatal(description: impl Into<String>) -> Self {
        CollectionError::FatalInvariant {
            description: description.into(),
        }
    }

    pub fn service_error(description: impl Into<String>) -> Self {
        CollectionError::ServiceError {
            description: description.into(),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectionError::FatalInvariant { .. })
    }
}

pub type CollectionResult<T> = Result<T, CollectionError>;

impl From<SegmentError> for CollectionError {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::BadInput { description } => CollectionError::BadInput { description },
            SegmentError::Unhealthy => CollectionError::ServiceError {
                description: "segment unhealthy".to_string(),
                backtrace: None,
            },
            SegmentError::ServiceError {
                description,
                backtrace,
            } => CollectionError::ServiceError {
                description,
                backtrace,
            },
            SegmentError::FatalInvariant { description } => {
                CollectionError::FatalInvariant { description }
            }
        }
    }
}
