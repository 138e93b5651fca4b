//! Output storage.
//!
//! Provider output URLs are short-lived. Outputs are copied into storage we
//! control as soon as a prediction succeeds.

use crate::error::ProviderError;
use async_trait::async_trait;
use genweave_core::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedOutput {
    /// Public URL of the stored copy.
    pub url: String,
    /// Storage-relative location.
    pub path: String,
}

#[async_trait]
pub trait OutputStorage: Send + Sync {
    /// Copies the file at `url` into storage.
    ///
    /// `reference` ties the stored file to the job or prediction that
    /// produced it.
    ///
    /// # Errors
    ///
    /// Returns an error if the download or the write fails.
    async fn download_and_save_output(
        &self,
        workflow_id: WorkflowId,
        node_id: &NodeId,
        url: &str,
        reference: &str,
    ) -> Result<SavedOutput, ProviderError>;
}

/// Stores outputs on the local filesystem under
/// `<root>/<workflow>/<node>/<reference>_<ulid>.<ext>`.
pub struct LocalOutputStorage {
    root: PathBuf,
    public_base_url: String,
    http: reqwest::Client,
}

impl LocalOutputStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// File extension from the URL path, ignoring query and fragment.
fn extension_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !ext.is_empty()
        && ext.len() <= 5
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

fn extension_from_content_type(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or_default().trim() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
}

/// Keeps caller-supplied path segments inside the storage root.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl OutputStorage for LocalOutputStorage {
    async fn download_and_save_output(
        &self,
        workflow_id: WorkflowId,
        node_id: &NodeId,
        url: &str,
        reference: &str,
    ) -> Result<SavedOutput, ProviderError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let ext = match extension_from_url(url) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map_or("bin", extension_from_content_type)
                .to_string(),
        };
        let bytes = response.bytes().await?;

        let relative = format!(
            "{}/{}/{}_{}.{ext}",
            workflow_id,
            sanitize_segment(node_id.as_str()),
            sanitize_segment(reference),
            Ulid::new()
        );
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::Storage {
                    reason: format!("failed to create {}: {e}", parent.display()),
                })?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| ProviderError::Storage {
                reason: format!("failed to write {}: {e}", target.display()),
            })?;

        debug!(%url, path = %relative, size = bytes.len(), "output saved");
        Ok(SavedOutput {
            url: format!("{}/{relative}", self.public_base_url),
            path: relative,
        })
    }
}
