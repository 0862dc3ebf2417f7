//! Error types for the files client

use std::fmt;

#[derive(Debug)]
pub enum FilesError {
    Http(Box<reqwest::Error>),
    Status(u16),
    /// The referenced message no longer exists in storage
    Dangling { chat_id: i64, message_id: i64 },
}

impl fmt::Display for FilesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilesError::Http(err) => write!(f, "Files HTTP error: {}", err),
            FilesError::Status(code) => write!(f, "Files server returned status {}", code),
            FilesError::Dangling {
                chat_id,
                message_id,
            } => write!(f, "No stored file at {}/{}", chat_id, message_id),
        }
    }
}

impl std::error::Error for FilesError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilesError::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FilesError {
    fn from(err: reqwest::Error) -> Self {
        FilesError::Http(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, FilesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_display() {
        let err = FilesError::Dangling {
            chat_id: -100123,
            message_id: 77,
        };
        assert_eq!(format!("{}", err), "No stored file at -100123/77");
    }

    #[test]
    fn test_error_is_debug() {
        let debug_str = format!("{:?}", FilesError::Status(500));
        assert!(debug_str.contains("Status"));
    }
}
