//! Client for the files server
//!
//! The files server stores uploaded blobs as messages in a chat and hands
//! back the `(chat_id, message_id)` pair that locates them. Messages can be
//! deleted out-of-band, so a previously returned pointer may stop resolving.

mod client;
mod error;

pub use client::{FileDownload, FilesClient, UploadData, UploadResult};
pub use error::{FilesError, Result};
