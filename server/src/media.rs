use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, WrapErr};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::MediaConfig;

/// Response body returned by the media host on a successful upload.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Client for the third-party media host. Takes files staged on local disk,
/// pushes them to the host, and removes the staged file whether or not the
/// upload succeeds.
#[derive(Clone)]
pub struct MediaClient {
    http: reqwest::Client,
    config: MediaConfig,
}

impl MediaClient {
    pub fn new(config: MediaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Write an uploaded field's bytes into the staging directory and
    /// return the staged path.
    pub async fn stage(&self, original_name: &str, data: &[u8]) -> color_eyre::Result<PathBuf> {
        let file_name = format!("{}-{}", Uuid::new_v4(), sanitize_file_name(original_name));
        let path = self.config.staging_dir.join(file_name);

        tokio::fs::write(&path, data)
            .await
            .wrap_err_with(|| format!("failed to stage upload at {}", path.display()))?;

        Ok(path)
    }

    /// Upload a staged file to the media host. Returns the hosted URL, or
    /// None when the file is unreadable or the host rejects it. The staged
    /// file is deleted in both outcomes.
    pub async fn upload(&self, local_path: &Path) -> Option<String> {
        let result = self.try_upload(local_path).await;

        if let Err(err) = tokio::fs::remove_file(local_path).await {
            warn!(
                "failed to remove staged file {}: {err}",
                local_path.display()
            );
        }

        match result {
            Ok(url) => {
                info!("uploaded {} to media host", local_path.display());
                Some(url)
            }
            Err(err) => {
                warn!("media upload failed for {}: {err}", local_path.display());
                None
            }
        }
    }

    async fn try_upload(&self, local_path: &Path) -> color_eyre::Result<String> {
        let data = tokio::fs::read(local_path)
            .await
            .wrap_err_with(|| format!("failed to read staged file {}", local_path.display()))?;

        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(local_path).first_or_octet_stream();

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str(mime.as_ref())
            .wrap_err("invalid mime type for upload")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(&self.config.upload_url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .wrap_err("media host request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!("media host returned {status}: {body}"));
        }

        let upload: UploadResponse = response
            .json()
            .await
            .wrap_err("malformed media host response")?;

        Ok(upload.url)
    }
}

fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(staging_dir: PathBuf) -> MediaClient {
        MediaClient::new(MediaConfig {
            // Nothing listens here; uploads in these tests always fail fast.
            upload_url: "http://127.0.0.1:9/upload".into(),
            api_key: "test-key".into(),
            staging_dir,
        })
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("my photo.png"), "my_photo.png");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[tokio::test]
    async fn stage_writes_the_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path().to_path_buf());

        let path = client.stage("avatar.png", b"image-bytes").await.unwrap();

        assert!(path.starts_with(dir.path()));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"image-bytes");
    }

    #[tokio::test]
    async fn failed_upload_returns_none_and_removes_the_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path().to_path_buf());

        let path = client.stage("avatar.png", b"image-bytes").await.unwrap();
        let hosted = client.upload(&path).await;

        assert!(hosted.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn uploading_a_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path().to_path_buf());

        let hosted = client.upload(&dir.path().join("never-staged.png")).await;
        assert!(hosted.is_none());
    }
}
