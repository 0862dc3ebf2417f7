use crate::caption::build_caption;
use crate::error::{ReadError, SinkError};
use crate::filler::{Collaborators, FillOutcome, Filler};
use crate::types::{CacheEntry, CacheKey, FileName, SinkFile};
use std::sync::Arc;
use tracing::{info, warn};

/// A cached file opened for streaming, with the metadata it is served under
#[derive(Debug)]
pub struct OpenedFile {
    pub entry: CacheEntry,
    pub name: FileName,
    pub caption: String,
    pub file: SinkFile,
}

/// Interactive access to cached files. Missing entries are filled
/// synchronously; entries whose blob vanished are evicted and refilled.
pub struct CacheReader {
    parts: Collaborators,
    filler: Arc<Filler>,
    heal_attempts: usize,
}

impl CacheReader {
    pub fn new(parts: Collaborators, filler: Arc<Filler>, heal_attempts: usize) -> Self {
        Self {
            parts,
            filler,
            heal_attempts,
        }
    }

    /// The entry for `key`, filling it now if needed
    pub async fn lookup(&self, key: &CacheKey) -> Result<CacheEntry, ReadError> {
        match self.filler.ensure_cached(key, true).await {
            FillOutcome::Cached(entry) => Ok(entry),
            FillOutcome::NotApplicable(_) => Err(ReadError::NotFound),
            FillOutcome::Unavailable(reason) | FillOutcome::Retry { reason, .. } => {
                Err(ReadError::Unavailable(reason.to_string()))
            }
        }
    }

    pub async fn open(&self, key: &CacheKey) -> Result<OpenedFile, ReadError> {
        let mut entry = self.lookup(key).await?;
        let mut heals = 0;

        let file = loop {
            match self.parts.sink.download(entry.pointer).await {
                Ok(file) => break file,
                Err(SinkError::Dangling(pointer)) if heals < self.heal_attempts => {
                    warn!(
                        key = %key,
                        chat_id = pointer.chat_id,
                        message_id = pointer.message_id,
                        "Cached blob is gone, refilling"
                    );
                    self.parts
                        .index
                        .evict(&entry)
                        .await
                        .map_err(|e| ReadError::Unavailable(e.to_string()))?;
                    heals += 1;
                    entry = self.lookup(key).await?;
                }
                Err(e) => return Err(ReadError::Unavailable(e.to_string())),
            }
        };
        if heals > 0 {
            info!(key = %key, "Refilled dangling entry");
        }

        let (name, caption) = self.describe(key).await;
        Ok(OpenedFile {
            entry,
            name,
            caption,
            file,
        })
    }

    /// Filename and caption for the response headers; both degrade
    /// to defaults rather than fail the read
    async fn describe(&self, key: &CacheKey) -> (FileName, String) {
        let (name, item) = tokio::join!(
            self.parts.source.filename(key),
            self.parts.catalog.get_item(key.item_id)
        );

        let name = name.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Falling back to default filename");
            FileName::fallback(key)
        });
        let caption = match item {
            Ok(Some(item)) => build_caption(&item, self.filler.settings().caption_limit),
            Ok(None) => String::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "No caption available");
                String::new()
            }
        };
        (name, caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use futures::TryStreamExt;

    async fn read_all(file: SinkFile) -> Vec<u8> {
        file.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_fills_missing_entry() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(1, &["pdf"]));
        let key = CacheKey::new(1, "pdf").unwrap();

        let opened = harness.reader().open(&key).await.unwrap();

        assert_eq!(opened.entry.key(), key);
        assert_eq!(opened.name.filename, "book-1.pdf");
        assert!(opened.caption.starts_with("📖 Book 1"));
        assert_eq!(read_all(opened.file).await, b"1.pdf".to_vec());
    }

    #[tokio::test]
    async fn test_dangling_pointer_is_healed() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(2, &["epub"]));
        let key = CacheKey::new(2, "epub").unwrap();
        let reader = harness.reader();

        let first = reader.open(&key).await.unwrap();
        harness.sink.drop_blob(first.entry.pointer);

        let healed = reader.open(&key).await.unwrap();
        assert_ne!(healed.entry.pointer, first.entry.pointer);
        assert_eq!(read_all(healed.file).await, b"2.epub".to_vec());
        assert_eq!(harness.index.entry_count(), 1);
        assert_eq!(harness.index.get_entry(&key), Some(healed.entry.clone()));

        let again = reader.open(&key).await.unwrap();
        assert_eq!(again.entry, healed.entry);
    }

    #[tokio::test]
    async fn test_heal_gives_up_after_one_refill() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(3, &["pdf"]));
        let key = CacheKey::new(3, "pdf").unwrap();
        harness.sink.set_drop_uploads(true);

        let result = harness.reader().open(&key).await;
        assert!(matches!(result, Err(ReadError::Unavailable(_))));
        assert_eq!(harness.sink.uploads(), 2);
    }

    #[tokio::test]
    async fn test_unknown_variant_is_not_found() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(4, &["pdf"]));

        let result = harness
            .reader()
            .open(&CacheKey::new(4, "mobi").unwrap())
            .await;
        assert!(matches!(result, Err(ReadError::NotFound)));
    }

    #[tokio::test]
    async fn test_filename_falls_back_to_key() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(5, &["fb2"]));
        let key = CacheKey::new(5, "fb2").unwrap();
        harness.source.set_names_unavailable(true);

        let opened = harness.reader().open(&key).await.unwrap();
        assert_eq!(opened.name, FileName::fallback(&key));
    }
}
