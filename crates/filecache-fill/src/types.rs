use crate::error::KeyError;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;

/// Longest variant name the index column holds
pub const MAX_VARIANT_LEN: usize = 8;

/// One representation of one catalog item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub item_id: i32,
    pub variant: String,
}

impl CacheKey {
    pub fn new(item_id: i32, variant: impl Into<String>) -> Result<Self, KeyError> {
        let variant = variant.into();
        if variant.is_empty() {
            return Err(KeyError::EmptyVariant);
        }
        if variant.len() > MAX_VARIANT_LEN {
            return Err(KeyError::VariantTooLong(variant));
        }
        Ok(Self { item_id, variant })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.item_id, self.variant)
    }
}

/// Where the sink stored an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobPointer {
    pub chat_id: i64,
    pub message_id: i64,
}

/// A row of the cache index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub id: i64,
    #[serde(rename = "object_id")]
    pub item_id: i32,
    #[serde(rename = "object_type")]
    pub variant: String,
    #[serde(flatten)]
    pub pointer: BlobPointer,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            item_id: self.item_id,
            variant: self.variant.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogAuthor {
    pub first_name: String,
    pub last_name: String,
    pub middle_name: String,
}

impl CatalogAuthor {
    /// "Last First Middle", skipping empty parts
    pub fn display_name(&self) -> String {
        [&self.last_name, &self.first_name, &self.middle_name]
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Full catalog record for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: i32,
    pub source_id: u32,
    pub remote_id: u32,
    pub title: String,
    pub authors: Vec<CatalogAuthor>,
    pub available_types: Vec<String>,
}

impl CatalogItem {
    pub fn offers(&self, variant: &str) -> bool {
        self.available_types.iter().any(|t| t == variant)
    }
}

/// What a catalog page lists for each item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    pub id: i32,
    pub available_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPage {
    pub items: Vec<ItemSummary>,
    pub total_pages: u32,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Bytes fetched from the source, ready for upload
pub struct SourceFile {
    pub filename: String,
    pub size: Option<u64>,
    pub body: ByteStream,
}

impl SourceFile {
    /// Wait for the first non-empty chunk. `None` when the body ends
    /// without carrying a single byte; otherwise the file with that chunk
    /// put back in front of the rest of the body.
    pub async fn non_empty(mut self) -> io::Result<Option<Self>> {
        let first = loop {
            match self.body.try_next().await? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => break chunk,
                None => return Ok(None),
            }
        };
        let rest = self.body;
        self.body = Box::pin(stream::once(async move { Ok::<_, io::Error>(first) }).chain(rest));
        Ok(Some(self))
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("filename", &self.filename)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Bytes streamed back from the sink
pub struct SinkFile {
    pub size: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for SinkFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkFile")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Names a file is served under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub filename: String,
    pub filename_ascii: String,
}

impl FileName {
    /// Name used when the source cannot provide one
    pub fn fallback(key: &CacheKey) -> Self {
        let name = format!("{}.{}", key.item_id, key.variant);
        Self {
            filename: name.clone(),
            filename_ascii: name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_validation() {
        assert!(CacheKey::new(1, "fb2").is_ok());
        assert!(CacheKey::new(1, "fb2.zip").is_ok());
        assert!(matches!(CacheKey::new(1, ""), Err(KeyError::EmptyVariant)));
        assert!(matches!(
            CacheKey::new(1, "verylongtype"),
            Err(KeyError::VariantTooLong(_))
        ));
    }

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new(42, "epub").unwrap();
        assert_eq!(key.to_string(), "42:epub");
    }

    #[test]
    fn test_cache_entry_serializes_flat() {
        let entry = CacheEntry {
            id: 5,
            item_id: 42,
            variant: "pdf".into(),
            pointer: BlobPointer {
                chat_id: -100,
                message_id: 7,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 5,
                "object_id": 42,
                "object_type": "pdf",
                "chat_id": -100,
                "message_id": 7
            })
        );
    }

    #[test]
    fn test_author_display_name_skips_empty_parts() {
        let author = CatalogAuthor {
            first_name: "Stanisław".into(),
            last_name: "Lem".into(),
            middle_name: String::new(),
        };
        assert_eq!(author.display_name(), "Lem Stanisław");
    }

    #[test]
    fn test_offers() {
        let item = CatalogItem {
            id: 1,
            source_id: 1,
            remote_id: 10,
            title: "T".into(),
            authors: vec![],
            available_types: vec!["pdf".into()],
        };
        assert!(item.offers("pdf"));
        assert!(!item.offers("epub"));
    }

    fn file_of(chunks: Vec<&'static [u8]>) -> SourceFile {
        let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))));
        SourceFile {
            filename: "a.pdf".into(),
            size: None,
            body: Box::pin(body),
        }
    }

    #[tokio::test]
    async fn test_non_empty_rejects_empty_body() {
        assert!(file_of(vec![]).non_empty().await.unwrap().is_none());
        assert!(file_of(vec![b"", b""]).non_empty().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_empty_keeps_every_byte() {
        let file = file_of(vec![b"", b"ab", b"cd"])
            .non_empty()
            .await
            .unwrap()
            .unwrap();
        let chunks: Vec<Bytes> = file.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abcd");
    }
}
