//! Client for the book library service
//!
//! Read-only access to the catalog: paginated listings of book ids with the
//! file formats each offers, and single-book lookups with the source
//! coordinates and display metadata (title, authors).

mod client;
mod error;
mod types;

pub use client::LibraryClient;
pub use error::{LibraryError, Result};
pub use types::{BaseBook, Book, BookAuthor, Page, Source};
