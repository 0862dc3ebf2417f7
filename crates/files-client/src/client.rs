//! Files server HTTP client

use crate::error::{FilesError, Result};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::CONTENT_LENGTH;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Location of an uploaded file inside the storage chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UploadData {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UploadResult {
    pub backend: String,
    pub data: UploadData,
}

/// A stored file being streamed back
pub struct FileDownload {
    pub content_length: Option<u64>,
    response: Response,
}

impl FileDownload {
    pub fn into_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> {
        self.response.bytes_stream()
    }
}

/// Client for the files server that stores blobs as chat messages
pub struct FilesClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl FilesClient {
    /// Create a client with a 5 minute request timeout
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(5 * 60))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Upload a file with a caption, returning where it was stored
    pub async fn upload(
        &self,
        body: Body,
        filename: &str,
        file_size: Option<u64>,
        caption: &str,
    ) -> Result<UploadData> {
        let url = format!("{}/api/v1/files/upload/", self.base_url);

        let part = match file_size {
            Some(size) => Part::stream_with_length(body, size),
            None => Part::stream(body),
        }
        .file_name(filename.to_string());

        let mut form = Form::new()
            .text("caption", caption.to_string())
            .text("filename", filename.to_string());
        if let Some(size) = file_size {
            form = form.text("file_size", size.to_string());
        }
        let form = form.part("file", part);

        debug!(filename, size = ?file_size, "Uploading file");

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), filename, "Upload rejected");
            return Err(FilesError::Status(response.status().as_u16()));
        }

        let result: UploadResult = response.json().await?;
        debug!(
            backend = %result.backend,
            chat_id = result.data.chat_id,
            message_id = result.data.message_id,
            "Upload stored"
        );
        Ok(result.data)
    }

    /// Stream a stored file back by its message coordinates
    pub async fn download(&self, chat_id: i64, message_id: i64) -> Result<FileDownload> {
        let url = self.download_url(chat_id, message_id);

        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if is_dangling_status(status) {
            return Err(FilesError::Dangling {
                chat_id,
                message_id,
            });
        }
        if !status.is_success() {
            return Err(FilesError::Status(status.as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Ok(FileDownload {
            content_length,
            response,
        })
    }

    fn download_url(&self, chat_id: i64, message_id: i64) -> String {
        format!(
            "{}/api/v1/files/download_by_message/{}/{}",
            self.base_url, chat_id, message_id
        )
    }
}

/// Statuses meaning the message behind a pointer is gone for good
fn is_dangling_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url() {
        let client = FilesClient::new("http://files:8000", "key").unwrap();
        assert_eq!(
            client.download_url(-1001, 42),
            "http://files:8000/api/v1/files/download_by_message/-1001/42"
        );
    }

    #[test]
    fn test_dangling_statuses() {
        assert!(is_dangling_status(StatusCode::NOT_FOUND));
        assert!(is_dangling_status(StatusCode::BAD_REQUEST));
        assert!(!is_dangling_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_dangling_status(StatusCode::OK));
    }

    #[test]
    fn test_upload_result_deserialization() {
        let json = r#"{"backend": "bot", "data": {"chat_id": -1002, "message_id": 9}}"#;
        let result: UploadResult = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.data,
            UploadData {
                chat_id: -1002,
                message_id: 9
            }
        );
    }
}
