//! Error types for the library client

use std::fmt;

/// Errors that can occur when talking to the library service
#[derive(Debug)]
pub enum LibraryError {
    /// Transport failure or undecodable body
    Http(Box<reqwest::Error>),
    /// The service answered with an unexpected status
    Status(u16),
}

impl LibraryError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status(code) => *code >= 500 || *code == 429,
        }
    }
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "Library HTTP error: {}", e),
            Self::Status(code) => write!(f, "Library returned status {}", code),
        }
    }
}

impl std::error::Error for LibraryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e.as_ref()),
            Self::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for LibraryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = LibraryError::Status(502);
        assert_eq!(format!("{}", err), "Library returned status 502");
    }

    #[test]
    fn test_status_transience() {
        assert!(LibraryError::Status(503).is_transient());
        assert!(LibraryError::Status(429).is_transient());
        assert!(!LibraryError::Status(403).is_transient());
    }
}
