//! Errors raised by the collaborators of the fill pipeline
//!
//! Adapters translate transport and database failures into these types
//! before they reach the pipeline, so nothing here carries a raw client
//! error. Each type says whether retrying can help.

use crate::types::BlobPointer;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    EmptyVariant,
    VariantTooLong(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::EmptyVariant => write!(f, "Variant must not be empty"),
            KeyError::VariantTooLong(v) => write!(
                f,
                "Variant '{}' is longer than {} bytes",
                v,
                crate::types::MAX_VARIANT_LEN
            ),
        }
    }
}

impl std::error::Error for KeyError {}

/// The catalog could not be read. A missing item is reported as
/// `Ok(None)` by the reader, not as an error.
#[derive(Debug, Clone)]
pub enum CatalogError {
    /// Network failure, timeout, throttling or a server-side error
    Unavailable(String),
    /// The catalog refused the request; asking again at once will not help
    Rejected(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Unavailable(_))
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Unavailable(msg) => write!(f, "Catalog unavailable: {}", msg),
            CatalogError::Rejected(msg) => write!(f, "Catalog rejected request: {}", msg),
        }
    }
}

impl std::error::Error for CatalogError {}

#[derive(Debug, Clone)]
pub enum SourceError {
    /// Nothing to fetch right now (network failure, empty body, upstream 404)
    Unavailable(String),
    /// The source states the file does not exist
    Gone,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "Source unavailable: {}", msg),
            SourceError::Gone => write!(f, "Source file does not exist"),
        }
    }
}

impl std::error::Error for SourceError {}

#[derive(Debug, Clone)]
pub enum SinkError {
    /// The pointer no longer resolves in the blob store
    Dangling(BlobPointer),
    Failed(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Dangling(p) => {
                write!(f, "Dangling pointer {}/{}", p.chat_id, p.message_id)
            }
            SinkError::Failed(msg) => write!(f, "Sink failed: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

#[derive(Debug, Clone)]
pub struct IndexError(pub String);

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cache index error: {}", self.0)
    }
}

impl std::error::Error for IndexError {}

#[derive(Debug, Clone)]
pub struct LockError(pub String);

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock manager error: {}", self.0)
    }
}

impl std::error::Error for LockError {}

#[derive(Debug, Clone)]
pub enum QueueError {
    Backend(String),
    /// A stored job payload could not be decoded
    Malformed { id: i64, reason: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Backend(msg) => write!(f, "Task queue error: {}", msg),
            QueueError::Malformed { id, reason } => {
                write!(f, "Job {} has a malformed payload: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Failure of the self-healing read path
#[derive(Debug, Clone)]
pub enum ReadError {
    /// The item or variant does not exist
    NotFound,
    /// Nothing can be served right now; the caller may try again later
    Unavailable(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotFound => write!(f, "Not found"),
            ReadError::Unavailable(msg) => write!(f, "Content unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ReadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_classification() {
        assert!(SourceError::Unavailable("timeout".into()).is_transient());
        assert!(!SourceError::Gone.is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            KeyError::VariantTooLong("fb2.zip.gz".into()).to_string(),
            "Variant 'fb2.zip.gz' is longer than 8 bytes"
        );
        let err = SinkError::Dangling(BlobPointer {
            chat_id: 1,
            message_id: 2,
        });
        assert_eq!(err.to_string(), "Dangling pointer 1/2");
    }
}
