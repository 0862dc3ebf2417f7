use async_trait::async_trait;
use downloader_client::{DownloaderClient, DownloaderError};
use filecache_fill::{
    BlobPointer, CacheKey, CatalogAuthor, CatalogError, CatalogItem, CatalogPage, CatalogReader,
    FileName, ItemSummary, Sink, SinkError, SinkFile, SourceError, SourceFetcher, SourceFile,
};
use files_client::{FilesClient, FilesError};
use futures::TryStreamExt;
use library_client::{Book, LibraryClient, LibraryError};
use std::io;
use tracing::debug;

pub struct HttpCatalog {
    client: LibraryClient,
}

impl HttpCatalog {
    pub fn new(client: LibraryClient) -> Self {
        Self { client }
    }
}

fn catalog_error(e: LibraryError) -> CatalogError {
    if e.is_transient() {
        CatalogError::Unavailable(e.to_string())
    } else {
        CatalogError::Rejected(e.to_string())
    }
}

fn catalog_item(book: Book) -> CatalogItem {
    CatalogItem {
        id: book.id,
        source_id: book.source.id,
        remote_id: book.remote_id,
        title: book.title,
        authors: book
            .authors
            .into_iter()
            .map(|a| CatalogAuthor {
                first_name: a.first_name,
                last_name: a.last_name,
                middle_name: a.middle_name,
            })
            .collect(),
        available_types: book.available_types,
    }
}

#[async_trait]
impl CatalogReader for HttpCatalog {
    async fn list_items(&self, page: u32, page_size: u32) -> Result<CatalogPage, CatalogError> {
        let listing = self
            .client
            .get_books(page, page_size)
            .await
            .map_err(catalog_error)?;
        Ok(CatalogPage {
            items: listing
                .items
                .into_iter()
                .map(|b| ItemSummary {
                    id: b.id,
                    available_types: b.available_types,
                })
                .collect(),
            total_pages: listing.pages,
        })
    }

    async fn get_item(&self, id: i32) -> Result<Option<CatalogItem>, CatalogError> {
        self.client
            .get_book(id)
            .await
            .map(|book| book.map(catalog_item))
            .map_err(catalog_error)
    }
}

pub struct HttpSource {
    client: DownloaderClient,
}

impl HttpSource {
    pub fn new(client: DownloaderClient) -> Self {
        Self { client }
    }
}

fn source_error(err: DownloaderError) -> SourceError {
    match err {
        DownloaderError::Gone => SourceError::Gone,
        other => SourceError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl SourceFetcher for HttpSource {
    async fn fetch_bytes(
        &self,
        item: &CatalogItem,
        variant: &str,
    ) -> Result<SourceFile, SourceError> {
        let download = self
            .client
            .download(item.source_id, item.remote_id, variant)
            .await
            .map_err(source_error)?;

        let filename = download
            .filename_ascii
            .clone()
            .or_else(|| download.filename.clone())
            .unwrap_or_else(|| format!("{}.{}", item.id, variant));
        let size = download.content_length;
        debug!(item_id = item.id, variant, filename = %filename, size = ?size, "Fetched from source");

        Ok(SourceFile {
            filename,
            size,
            body: Box::pin(download.into_stream().map_err(io::Error::other)),
        })
    }

    async fn filename(&self, key: &CacheKey) -> Result<FileName, SourceError> {
        let data = self
            .client
            .filename(key.item_id, &key.variant)
            .await
            .map_err(source_error)?;
        Ok(FileName {
            filename: data.filename,
            filename_ascii: data.filename_ascii,
        })
    }
}

pub struct HttpSink {
    client: FilesClient,
}

impl HttpSink {
    pub fn new(client: FilesClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn upload(&self, file: SourceFile, caption: &str) -> Result<BlobPointer, SinkError> {
        let body = reqwest::Body::wrap_stream(file.body);
        let stored = self
            .client
            .upload(body, &file.filename, file.size, caption)
            .await
            .map_err(|e| SinkError::Failed(e.to_string()))?;
        Ok(BlobPointer {
            chat_id: stored.chat_id,
            message_id: stored.message_id,
        })
    }

    async fn download(&self, pointer: BlobPointer) -> Result<SinkFile, SinkError> {
        match self
            .client
            .download(pointer.chat_id, pointer.message_id)
            .await
        {
            Ok(download) => Ok(SinkFile {
                size: download.content_length,
                body: Box::pin(download.into_stream().map_err(io::Error::other)),
            }),
            Err(FilesError::Dangling { .. }) => Err(SinkError::Dangling(pointer)),
            Err(e) => Err(SinkError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use library_client::{BookAuthor, Source};

    #[test]
    fn test_catalog_item_from_book() {
        let book = Book {
            id: 12,
            remote_id: 3400,
            title: "Пикник на обочине".into(),
            lang: "ru".into(),
            authors: vec![BookAuthor {
                id: 1,
                first_name: "Аркадий".into(),
                last_name: "Стругацкий".into(),
                middle_name: "Натанович".into(),
            }],
            source: Source { id: 2 },
            available_types: vec!["fb2".into(), "epub".into()],
        };

        let item = catalog_item(book);
        assert_eq!(item.source_id, 2);
        assert_eq!(item.remote_id, 3400);
        assert!(item.offers("epub"));
        assert_eq!(
            item.authors[0].display_name(),
            "Стругацкий Аркадий Натанович"
        );
    }

    #[test]
    fn test_downloader_errors_are_classified() {
        assert!(matches!(source_error(DownloaderError::Gone), SourceError::Gone));
        assert!(source_error(DownloaderError::Unavailable(204)).is_transient());
    }

    #[test]
    fn test_library_errors_keep_transience() {
        assert!(catalog_error(LibraryError::Status(503)).is_transient());
        assert!(catalog_error(LibraryError::Status(429)).is_transient());
        assert!(matches!(
            catalog_error(LibraryError::Status(401)),
            CatalogError::Rejected(_)
        ));
    }
}
