//! Client for the downloader service
//!
//! The downloader fetches a book file in a given format from its upstream
//! source and streams it back. It is slow and occasionally has nothing to
//! return; callers are expected to retry later in that case.

mod client;
mod error;

pub use client::{Download, DownloaderClient, FilenameData};
pub use error::{DownloaderError, Result};
