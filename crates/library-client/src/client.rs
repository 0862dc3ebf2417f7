//! Library service HTTP client

use crate::error::{LibraryError, Result};
use crate::types::{BaseBook, Book, Page};
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const BOOK_CACHE_TTL_SECS: u64 = 60;
const BOOK_CACHE_CAPACITY: u64 = 4_096;

/// Client for the book library (catalog) service
///
/// Single-book lookups are cached briefly since the same book is usually
/// requested several times in a row while one of its files is being filled
/// and then served.
pub struct LibraryClient {
    http: Client,
    base_url: String,
    api_key: String,
    book_cache: Cache<i32, Book>,
}

impl LibraryClient {
    /// Create a client with a 30 second request timeout
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;

        let book_cache = Cache::builder()
            .max_capacity(BOOK_CACHE_CAPACITY)
            .time_to_live(Duration::from_secs(BOOK_CACHE_TTL_SECS))
            .build();

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            book_cache,
        })
    }

    /// List books page by page (1-based page numbers)
    pub async fn get_books(&self, page: u32, size: u32) -> Result<Page<BaseBook>> {
        let url = self.books_url(page, size);
        self.get_json(&url).await?.ok_or(LibraryError::Status(404))
    }

    /// Fetch a single book; `None` when the library does not know it
    pub async fn get_book(&self, book_id: i32) -> Result<Option<Book>> {
        if let Some(book) = self.book_cache.get(&book_id).await {
            return Ok(Some(book));
        }

        let url = format!("{}/api/v1/books/{}", self.base_url, book_id);
        let book: Option<Book> = self.get_json(&url).await?;

        if let Some(ref book) = book {
            self.book_cache.insert(book_id, book.clone()).await;
        }

        Ok(book)
    }

    fn books_url(&self, page: u32, size: u32) -> String {
        format!(
            "{}/api/v1/books/base/?page={}&size={}",
            self.base_url, page, size
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        debug!(url = %url, "Library request");

        let response = self
            .http
            .get(url)
            .header("Authorization", &self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(LibraryError::Status(status.as_u16())),
        }
    }
}
