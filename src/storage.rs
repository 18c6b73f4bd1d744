//! Object storage client and session-log archiving.
//!
//! Plain HTTP PUT/GET against a configured base URL with an optional bearer
//! token. Uploads are bounded; the session log is zipped in memory before it
//! leaves the process.

use std::io::{Cursor, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::StorageConfig;

const UPLOAD_TIMEOUT_SECS: u64 = 180;

pub struct ObjectStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ObjectStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
                .build()
                .expect("Failed to build storage HTTP client"),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    pub async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        let mut request = self
            .http
            .put(self.url(path))
            .header("Content-Type", content_type)
            .body(data);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Storage upload failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Storage upload returned {status}");
        }
        Ok(())
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let mut request = self.http.get(self.url(path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Storage download failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Storage download returned {status}");
        }
        Ok(response
            .bytes()
            .await
            .context("Storage download body failed")?
            .to_vec())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Deflate `data` into a single-entry zip archive held in memory.
pub fn zip_archive(entry_name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(entry_name, options)
            .context("Failed to start zip entry")?;
        writer
            .write_all(data)
            .context("Failed to write zip entry")?;
        writer.finish().context("Failed to finish zip archive")?;
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_zip_round_trip() {
        let data = b"[2026-01-01T00:00:00Z] {\"type\":\"session.update\"}\n";
        let archive = zip_archive("call.log", data).unwrap();

        let mut reader = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 1);
        let mut entry = reader.by_name("call.log").unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);
    }

    #[test]
    fn test_url_join() {
        let store = ObjectStore::new(&StorageConfig {
            base_url: "https://storage.example.com/bucket/".to_string(),
            token: None,
            sounds_prefix: "sounds".to_string(),
        });
        assert_eq!(
            store.url("/logs/a.zip"),
            "https://storage.example.com/bucket/logs/a.zip"
        );
    }
}
