//! Error types for the downloader client

use std::fmt;

#[derive(Debug)]
pub enum DownloaderError {
    /// Transport failure
    Http(Box<reqwest::Error>),
    /// The downloader could not produce the file right now (empty result,
    /// not found upstream, or a server error). Worth retrying later.
    Unavailable(u16),
    /// The downloader reports that the file does not exist at all
    Gone,
}

impl DownloaderError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Gone)
    }
}

impl fmt::Display for DownloaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "Downloader HTTP error: {}", e),
            Self::Unavailable(code) => {
                write!(f, "Downloader has no file right now (status {})", code)
            }
            Self::Gone => write!(f, "File does not exist upstream"),
        }
    }
}

impl std::error::Error for DownloaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DownloaderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, DownloaderError>;
