//! Blob store adapter
//!
//! Everything the state backend persists goes through the [`BlobStore`]
//! trait: a flat key space of byte blobs with `/`-separated keys. Locking,
//! backups and layout migration are all built from these primitives.

mod local;
mod s3;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// URL schemes [`open_bucket`] knows how to open
pub const VALID_SCHEMES: &[&str] = &["file", "s3"];

/// Errors raised by blob stores
#[derive(Debug, Error)]
pub enum BlobError {
    /// The key does not exist
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Local I/O failure
    #[error("I/O error on {key}: {message}")]
    Io { key: String, message: String },

    /// The store does not support the operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The bucket URL could not be understood
    #[error("invalid bucket URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    /// Cloud SDK failure
    #[error("storage error: {0}")]
    Backend(String),
}

impl BlobError {
    /// Map an I/O error on `key`, keeping not-found distinguishable
    pub fn io(key: impl Into<String>, err: std::io::Error) -> Self {
        let key = key.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(key)
        } else {
            Self::Io {
                key,
                message: err.to_string(),
            }
        }
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// One entry of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Full key; directories end in the delimiter
    pub key: String,
    /// Directory pseudo-entry (only produced when listing with a delimiter)
    pub is_dir: bool,
    /// Modification time, when the store reports one
    pub modified: Option<DateTime<Utc>>,
}

impl ListEntry {
    /// Last path segment of the key, without a trailing `/`
    pub fn file_name(&self) -> &str {
        let key = self.key.trim_end_matches('/');
        key.rsplit('/').next().unwrap_or(key)
    }
}

/// A key/blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Read a blob; [`BlobError::NotFound`] if it does not exist
    async fn read_all(&self, key: &str) -> BlobResult<Vec<u8>>;

    /// Create or replace a blob
    async fn write_all(&self, key: &str, data: &[u8], content_type: Option<&str>)
    -> BlobResult<()>;

    /// Delete a blob; [`BlobError::NotFound`] if it does not exist
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// List keys starting with `prefix`
    ///
    /// With a delimiter, only the level directly below the prefix is
    /// returned and deeper keys are folded into directory entries. Without
    /// one, every blob under the prefix is returned. Listing a prefix with
    /// nothing under it is not an error.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> BlobResult<Vec<ListEntry>>;

    /// Copy `src` to `dst`
    async fn copy(&self, dst: &str, src: &str) -> BlobResult<()> {
        let data = self.read_all(src).await?;
        self.write_all(dst, &data, None).await
    }

    /// A URL granting temporary read access to `key`
    async fn signed_url(&self, key: &str) -> BlobResult<String> {
        Err(BlobError::Unsupported(format!("signed URLs for {key}")))
    }
}

/// Scheme of a bucket URL (`file`, `s3`, ...), or the empty string
pub fn url_scheme(url: &str) -> &str {
    url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("")
}

/// Normalize a bucket URL
///
/// `file://` URLs have a leading `~` expanded to the home directory, relative
/// paths made absolute against the working directory, `.` and `..`
/// components resolved lexically, separators turned into `/` and a leading
/// `/` guaranteed. Any other URL is returned unchanged.
pub fn massage_blob_path(url: &str) -> BlobResult<String> {
    let Some(rest) = url.strip_prefix("file://") else {
        return Ok(url.to_string());
    };

    let path = if rest == "~" || rest.starts_with("~/") {
        let home = dirs::home_dir().ok_or_else(|| BlobError::InvalidUrl {
            url: url.to_string(),
            message: "could not determine the home directory".to_string(),
        })?;
        home.join(rest[1..].trim_start_matches('/'))
    } else {
        PathBuf::from(rest)
    };

    let absolute = if path.is_absolute() {
        path
    } else {
        let cwd = std::env::current_dir().map_err(|e| BlobError::io(url, e))?;
        cwd.join(path)
    };

    let mut cleaned = clean_path(&absolute).to_string_lossy().replace('\\', "/");
    if !cleaned.starts_with('/') {
        cleaned.insert(0, '/');
    }
    Ok(format!("file://{cleaned}"))
}

/// Resolve `.` and `..` without touching the filesystem
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Open the bucket behind a (massaged) URL
pub async fn open_bucket(url: &str) -> BlobResult<Arc<dyn BlobStore>> {
    match url_scheme(url) {
        "file" => {
            let root = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(LocalBlobStore::open(root).await?))
        }
        "s3" => {
            let parsed = url::Url::parse(url).map_err(|e| BlobError::InvalidUrl {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(S3BlobStore::open(&parsed).await?))
        }
        other => Err(BlobError::Unsupported(format!(
            "blob scheme {:?}; valid schemes are: {}",
            other,
            VALID_SCHEMES.join(", ")
        ))),
    }
}
