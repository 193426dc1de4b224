use std::backtrace::Backtrace;

use collection::CollectionError;
use thiserror::Error;

/// Error taxonomy for the storage crate (ShardCluster, QueryCollection,
/// TaskScheduler, Lifecycle). Kind list mirrors spec.md §7; idiom follows
/// the teacher's own `StorageError`.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("not found: {description}")]
    NotFound { description: String },

    #[error("wrong type: {description}")]
    WrongType { description: String },

    #[error("already released: {description}")]
    AlreadyReleased { description: String },

    #[error("unavailable: {description}")]
    Unavailable { description: String },

    #[error("stale event: {description}")]
    StaleEvent { description: String },

    #[error("insufficient memory: {description}")]
    InsufficientMemory { description: String },

    #[error("misaligned message: {description}")]
    MisalignedMessage { description: String },

    #[error("collection released: {description}")]
    CollectionReleased { description: String },

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

impl StorageError {
    pub fn not_found(description: impl Into<String>) -> Self {
        StorageError::NotFound {
            description: description.into(),
        }
    }

    pub fn unavailable(description: impl Into<String>) -> Self {
        StorageError::Unavailable {
            description: description.into(),
        }
    }

    pub fn stale_event(description: impl Into<String>) -> Self {
        StorageError::StaleEvent {
            description: description.into(),
        }
    }

    pub fn fatal(description: impl Into<String>) -> Self {
        StorageError::FatalInvariant {
            description: description.into(),
        }
    }

    pub fn service_error(description: impl Into<String>) -> Self {
        StorageError::ServiceError {
            description: description.into(),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::FatalInvariant { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<CollectionError> for StorageError {
    fn from(err: CollectionError) -> Self {
        match err {
            CollectionError::NotFound { description } => StorageError::NotFound { description },
            CollectionError::WrongType { description } => StorageError::WrongType { description },
            CollectionError::AlreadyExists { description } => StorageError::ServiceError {
                description,
                backtrace: None,
            },
            CollectionError::BadInput { description } => {
                StorageError::MisalignedMessage { description }
            }
            CollectionError::InsufficientMemory { description } => {
                StorageError::InsufficientMemory { description }
            }
            CollectionError::ChannelClosed { channel } => StorageError::ChannelClosed { channel },
            CollectionError::FatalInvariant { description } => {
                StorageError::FatalInvariant { description }
            }
            CollectionError::ServiceError {
                description,
                backtrace,
            } => StorageError::ServiceError {
                description,
                backtrace,
            },
        }
    }
}
