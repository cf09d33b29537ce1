//! Plain HTTP object gateway.
//!
//! `PUT {base}/{key}` uploads, `GET {base}/{key}` downloads,
//! `DELETE {base}/{key}` removes and `GET {base}/?prefix={p}` lists,
//! answering `{"keys": [...]}`. Bodies are streamed in both directions.

use super::{validate_key, ObjectStore};
use crate::utils::errors::{ArchiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    keys: Vec<String>,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ArchiveError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn object_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }
}

/// Map a non-success status to the error taxonomy.
pub(crate) fn status_error(key: &str, status: StatusCode, body: &str) -> ArchiveError {
    let detail = format!("{} returned {}: {}", key, status, body.trim());
    if status == StatusCode::NOT_FOUND {
        ArchiveError::ObjectNotFound(key.to_string())
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ArchiveError::TransientStorage(detail)
    } else {
        ArchiveError::PermanentStorage(detail)
    }
}

fn request_error(key: &str, e: reqwest::Error) -> ArchiveError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ArchiveError::TransientStorage(format!("{}: {}", key, e))
    } else {
        ArchiveError::PermanentStorage(format!("{}: {}", key, e))
    }
}

async fn check(key: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(key, status, &body))
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        let url = self.object_url(key)?;
        let file = tokio::fs::File::open(src).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let resp = self
            .client
            .put(&url)
            .header("content-length", size.to_string())
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        check(key, resp).await?;

        tracing::debug!("Uploaded {} bytes to {}", size, key);
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .put(&url)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        check(key, resp).await?;
        Ok(())
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        let resp = check(key, resp).await?;
        let expected = resp.content_length();

        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| request_error(key, e))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.sync_all().await?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(ArchiveError::TransientStorage(format!(
                    "{}: body ended after {} of {} bytes",
                    key, written, expected
                )));
            }
        }
        Ok(written)
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        let resp = check(key, resp).await?;
        resp.bytes().await.map_err(|e| request_error(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| request_error(prefix, e))?;
        let resp = check(prefix, resp).await?;
        let listing: ListResponse = resp.json().await.map_err(|e| request_error(prefix, e))?;

        let mut keys: Vec<String> = listing
            .keys
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key)?;
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        match check(key, resp).await {
            Ok(_) | Err(ArchiveError::ObjectNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error("k", StatusCode::NOT_FOUND, ""),
            ArchiveError::ObjectNotFound(_)
        ));
        assert!(status_error("k", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error("k", StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(status_error("k", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!status_error("k", StatusCode::FORBIDDEN, "").is_transient());
        assert!(!status_error("k", StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_object_url() {
        let store = HttpStore::new("http://gateway:9000/bucket/").unwrap();
        assert_eq!(
            store.object_url("wal/000000010000000000000001").unwrap(),
            "http://gateway:9000/bucket/wal/000000010000000000000001"
        );
        assert!(store.object_url("../x").is_err());
    }
}
