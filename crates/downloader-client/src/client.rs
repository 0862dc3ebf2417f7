//! Downloader service HTTP client

use crate::error::{DownloaderError, Result};
use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const FILENAME_HEADER: &str = "x-filename-b64";
const FILENAME_ASCII_HEADER: &str = "x-filename-b64-ascii";

/// A file being streamed from the downloader
pub struct Download {
    pub filename: Option<String>,
    pub filename_ascii: Option<String>,
    pub content_length: Option<u64>,
    response: Response,
}

impl Download {
    /// Consume the download as a stream of body chunks
    pub fn into_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> {
        self.response.bytes_stream()
    }
}

/// Display and ASCII-safe names for a book file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilenameData {
    pub filename: String,
    pub filename_ascii: String,
}

/// Client for the downloader, which pulls raw files from upstream sources
pub struct DownloaderClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl DownloaderClient {
    /// Create a client with a 10 minute request timeout (large files)
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(10 * 60))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Start downloading `file_type` of the book identified by its source
    /// and the source's own id for it
    pub async fn download(&self, source_id: u32, remote_id: u32, file_type: &str) -> Result<Download> {
        let url = self.download_url(source_id, remote_id, file_type);
        debug!(url = %url, "Requesting file from downloader");

        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::GONE => return Err(DownloaderError::Gone),
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                return Err(DownloaderError::Unavailable(status.as_u16()))
            }
            s if !s.is_success() => {
                warn!(status = %s, url = %url, "Downloader request failed");
                return Err(DownloaderError::Unavailable(s.as_u16()));
            }
            _ => {}
        }

        let headers = response.headers();
        let content_length = content_length(headers);
        if content_length == Some(0) {
            return Err(DownloaderError::Unavailable(status.as_u16()));
        }

        let filename = decode_header(headers, FILENAME_HEADER);
        let filename_ascii = decode_header(headers, FILENAME_ASCII_HEADER);

        Ok(Download {
            filename,
            filename_ascii,
            content_length,
            response,
        })
    }

    /// Resolve the filename a book file is served under
    pub async fn filename(&self, book_id: i32, file_type: &str) -> Result<FilenameData> {
        let url = format!(
            "{}/filename/{}/{}",
            self.base_url,
            book_id,
            urlencoding::encode(file_type)
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::GONE => Err(DownloaderError::Gone),
            s if !s.is_success() => Err(DownloaderError::Unavailable(s.as_u16())),
            _ => Ok(response.json().await?),
        }
    }

    fn download_url(&self, source_id: u32, remote_id: u32, file_type: &str) -> String {
        format!(
            "{}/download/{}/{}/{}",
            self.base_url,
            source_id,
            remote_id,
            urlencoding::encode(file_type)
        )
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Decode a base64-encoded UTF-8 header value
fn decode_header(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.as_bytes();
    let decoded = general_purpose::STANDARD.decode(raw).ok()?;
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_download_url_encodes_file_type() {
        let client = DownloaderClient::new("http://downloader/", "key").unwrap();
        assert_eq!(
            client.download_url(1, 555, "fb2 zip"),
            "http://downloader/download/1/555/fb2%20zip"
        );
    }

    #[test]
    fn test_decode_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FILENAME_HEADER,
            HeaderValue::from_str(&general_purpose::STANDARD.encode("Солярис.fb2")).unwrap(),
        );
        headers.insert(FILENAME_ASCII_HEADER, HeaderValue::from_static("!!not base64"));

        assert_eq!(
            decode_header(&headers, FILENAME_HEADER).as_deref(),
            Some("Солярис.fb2")
        );
        assert_eq!(decode_header(&headers, FILENAME_ASCII_HEADER), None);
        assert_eq!(decode_header(&headers, "x-missing"), None);
    }

    #[test]
    fn test_filename_data_deserialization() {
        let json = r#"{"filename": "Лем_Солярис.fb2", "filename_ascii": "Lem_Solyaris.fb2"}"#;
        let data: FilenameData = serde_json::from_str(json).unwrap();
        assert_eq!(data.filename_ascii, "Lem_Solyaris.fb2");
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(content_length(&headers), Some(1024));
    }
}
