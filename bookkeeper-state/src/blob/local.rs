//! Local filesystem blob store
//!
//! Keys map to files under a root directory. Writes go to a temporary file
//! next to the target and are renamed into place, so readers never see a
//! partially written blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BlobError, BlobResult, BlobStore, ListEntry};

/// Blob store backed by a local directory (`file://` URLs)
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open a store rooted at an existing directory
    pub async fn open(root: impl AsRef<Path>) -> BlobResult<Self> {
        let root = root.as_ref();
        let key = root.display().to_string();
        let metadata = tokio::fs::metadata(root)
            .await
            .map_err(|e| BlobError::io(key.clone(), e))?;
        if !metadata.is_dir() {
            return Err(BlobError::Io {
                key,
                message: "not a directory".to_string(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    async fn list_dir(&self, dir_key: &str, name_prefix: &str) -> BlobResult<Vec<ListEntry>> {
        let mut reader = match tokio::fs::read_dir(self.path_for(dir_key)).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BlobError::io(dir_key, e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| BlobError::io(dir_key, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(name_prefix) || is_temp_file(&name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| BlobError::io(dir_key, e))?;
            let is_dir = metadata.is_dir();
            let key = if is_dir {
                format!("{dir_key}{name}/")
            } else {
                format!("{dir_key}{name}")
            };
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            entries.push(ListEntry {
                key,
                is_dir,
                modified,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

const TEMP_SUFFIX: &str = ".tmp";

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, key: &str) -> BlobResult<bool> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::io(key, e)),
        }
    }

    async fn read_all(&self, key: &str) -> BlobResult<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|e| BlobError::io(key, e))
    }

    async fn write_all(
        &self,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> BlobResult<()> {
        let path = self.path_for(key);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| BlobError::io(key, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(
            ".{}.{}{}",
            file_name,
            uuid::Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));

        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| BlobError::io(key, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(BlobError::io(key, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        tokio::fs::remove_file(self.path_for(key))
            .await
            .map_err(|e| BlobError::io(key, e))
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> BlobResult<Vec<ListEntry>> {
        let (dir_key, name_prefix) = match prefix.rfind('/') {
            Some(index) => prefix.split_at(index + 1),
            None => ("", prefix),
        };

        let entries = self.list_dir(dir_key, name_prefix).await?;
        if delimiter.is_some() {
            return Ok(entries);
        }

        let mut files = Vec::new();
        let mut pending = entries;
        while let Some(entry) = pending.pop() {
            if entry.is_dir {
                pending.extend(self.list_dir(&entry.key, "").await?);
            } else {
                files.push(entry);
            }
        }
        files.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(files)
    }
}
