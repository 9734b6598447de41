//! Proof blob storage
//!
//! Proofs are opaque to the engine: it uploads bytes, gets back a
//! dereferenceable reference and stores that verbatim. Keys follow
//! `{user_id}/{timestamp_millis}.{ext}`.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BountyError, Result};

pub const MAX_PROOF_BYTES: usize = 10 * 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm"];

/// What the proof is attached to. Kill confirmations only take screenshots;
/// bounty reports may also carry a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofKind {
    Kill,
    Sighting,
}

#[derive(Debug, Clone)]
pub struct ProofUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ProofUpload {
    pub fn validate(&self, kind: ProofKind, max_bytes: usize) -> Result<()> {
        if self.bytes.is_empty() {
            return Err(BountyError::InvalidFormat("proof file is empty".to_string()));
        }
        if self.bytes.len() > max_bytes {
            return Err(BountyError::InvalidFormat(format!(
                "proof is {} bytes, limit is {}",
                self.bytes.len(),
                max_bytes
            )));
        }

        let allowed = match kind {
            ProofKind::Kill => IMAGE_TYPES.contains(&self.content_type.as_str()),
            ProofKind::Sighting => {
                IMAGE_TYPES.contains(&self.content_type.as_str())
                    || VIDEO_TYPES.contains(&self.content_type.as_str())
            }
        };
        if !allowed {
            return Err(BountyError::InvalidFormat(format!(
                "unsupported proof type '{}'",
                self.content_type
            )));
        }
        Ok(())
    }

    /// Extension from the file name, falling back to the content type.
    pub fn extension(&self) -> String {
        let from_name = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

        from_name.unwrap_or_else(|| {
            match self.content_type.as_str() {
                "image/jpeg" => "jpg",
                "image/png" => "png",
                "image/gif" => "gif",
                "video/mp4" => "mp4",
                "video/webm" => "webm",
                _ => "bin",
            }
            .to_string()
        })
    }
}

pub fn proof_key(user_id: Uuid, at: DateTime<Utc>, ext: &str) -> String {
    format!("{}/{}.{}", user_id, at.timestamp_millis(), ext)
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, returning the reference to persist.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Writes proofs under a local directory served at `public_base_url`.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        if key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(BountyError::InvalidFormat(format!("bad blob key '{}'", key)));
        }

        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BountyError::UpstreamFailure(format!(
                    "proof {} already exists",
                    key
                )));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.flush().await?;
        debug!("Stored {} bytes at {}", bytes.len(), path.display());

        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            key
        ))
    }
}
