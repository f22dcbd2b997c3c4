//! Stack persistence
//!
//! Reading and writing checkpoints, backups and update history. None of
//! these functions take locks; the façade holds the stack lock around every
//! mutating sequence.

use std::sync::Arc;

use bookkeeper_core::deployment::{Checkpoint, SecretsProviders, Snapshot};
use bookkeeper_core::secrets::SecretsManager;
use bookkeeper_core::update::UpdateInfo;
use chrono::Utc;

use crate::backend::{BackendError, BackendOptions, BackendResult};
use crate::blob::BlobStore;
use crate::encoding::{
    GZIP_EXT, JSON_EXT, decode_blob, encode_for_key, is_gzip_key, json_key, toggle_gzip,
};
use crate::layout::{history_dir, stack_base_path};
use crate::reference::StackReference;

const BACKUP_EXT: &str = ".bak";
const HISTORY_EXT: &str = ".history";
const CHECKPOINT_EXT: &str = ".checkpoint";

/// Checkpoint, backup and history storage on top of a blob store
#[derive(Clone)]
pub struct StackStore {
    store: Arc<dyn BlobStore>,
    options: BackendOptions,
}

impl StackStore {
    pub fn new(store: Arc<dyn BlobStore>, options: BackendOptions) -> Self {
        Self { store, options }
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    /// Key of the checkpoint blob of a stack
    ///
    /// Whichever of `.json` and `.json.gz` exists wins, the newer one if both
    /// do. A stack with neither is placed according to the gzip option.
    pub async fn stack_path(&self, reference: &StackReference) -> BackendResult<String> {
        let base = stack_base_path(reference);
        let plain = json_key(&base, false);
        let gzipped = json_key(&base, true);

        let entries = self.store.list(&plain, Some("/")).await?;
        let plain_entry = entries.iter().find(|e| e.key == plain);
        let gzipped_entry = entries.iter().find(|e| e.key == gzipped);

        let path = match (plain_entry, gzipped_entry) {
            (Some(p), Some(g)) => match (p.modified, g.modified) {
                (Some(pm), Some(gm)) if pm > gm => plain,
                (Some(pm), Some(gm)) if gm > pm => gzipped,
                _ if self.options.gzip => gzipped,
                _ => plain,
            },
            (Some(_), None) => plain,
            (None, Some(_)) => gzipped,
            (None, None) if self.options.gzip => gzipped,
            (None, None) => plain,
        };
        Ok(path)
    }

    /// Load the checkpoint of a stack
    pub async fn get_checkpoint(&self, reference: &StackReference) -> BackendResult<Checkpoint> {
        let path = self.stack_path(reference).await?;
        let data = self.store.read_all(&path).await?;
        let data = decode_blob(&path, data).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(Checkpoint::from_slice(&data)?)
    }

    /// Load the latest snapshot of a stack together with the checkpoint path
    ///
    /// A missing stack is a blob not-found error; callers decide whether
    /// that is a failure.
    pub async fn get_stack(
        &self,
        reference: &StackReference,
    ) -> BackendResult<(Option<Snapshot>, String)> {
        let path = self.stack_path(reference).await?;
        let checkpoint = self.get_checkpoint(reference).await?;
        Ok((checkpoint.latest, path))
    }

    /// Write the checkpoint of a stack, overwriting what was there
    ///
    /// Secrets provider metadata comes from `secrets` when given, otherwise
    /// from the snapshot itself. Never makes a backup.
    pub async fn save_stack(
        &self,
        reference: &StackReference,
        snapshot: Option<&Snapshot>,
        secrets: Option<&dyn SecretsManager>,
    ) -> BackendResult<String> {
        let latest = snapshot.map(|snapshot| {
            let mut snapshot = snapshot.clone();
            if let Some(secrets) = secrets {
                snapshot.secrets_providers = Some(SecretsProviders::from_manager(secrets));
            }
            snapshot
        });
        let checkpoint = Checkpoint::new(reference.fully_qualified_name(), latest);

        let path = json_key(&stack_base_path(reference), self.options.gzip);
        let data = encode_for_key(&path, checkpoint.to_vec()?)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        self.store
            .write_all(&path, &data, Some("application/json"))
            .await?;

        // Only one encoding of a stack may exist at a time.
        match self.store.delete(&toggle_gzip(&path)).await {
            Ok(()) => log::debug!("removed stale {} encoding of {}", other_encoding(&path), reference),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        log::debug!("saved checkpoint of {} to {}", reference, path);
        Ok(path)
    }

    /// Copy `key` to a backup next to it, optionally deleting the original
    ///
    /// The backup is `<key>.bak`, or `<key>.<nanos>.bak` if that is taken.
    pub async fn backup_target(&self, key: &str, keep_original: bool) -> BackendResult<String> {
        let mut backup = format!("{key}{BACKUP_EXT}");
        if self.store.exists(&backup).await? {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            backup = format!("{key}.{nanos}{BACKUP_EXT}");
        }

        self.store.copy(&backup, key).await?;
        if !keep_original {
            self.store.delete(key).await?;
        }
        log::debug!("backed up {} to {}", key, backup);
        Ok(backup)
    }

    /// Back up the current checkpoint of a stack, unless backups are disabled
    pub async fn backup_stack(&self, reference: &StackReference) -> BackendResult<()> {
        if self.options.disable_checkpoint_backups {
            return Ok(());
        }
        let path = self.stack_path(reference).await?;
        self.backup_target(&path, true).await?;
        Ok(())
    }

    /// Delete a stack and its history, keeping a backup of the checkpoint
    pub async fn remove_stack(&self, reference: &StackReference) -> BackendResult<()> {
        let path = self.stack_path(reference).await?;
        self.backup_target(&path, false).await?;

        // One level only: a legacy history directory can be the parent of a
        // project's history directories.
        let dir = format!("{}/", history_dir(reference));
        for entry in self.store.list(&dir, Some("/")).await? {
            if entry.is_dir {
                continue;
            }
            match self.store.delete(&entry.key).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Move a stack to a new reference
    ///
    /// The old checkpoint is backed up rather than deleted, and the history
    /// follows the stack.
    pub async fn rename_stack(
        &self,
        old: &StackReference,
        new: &StackReference,
    ) -> BackendResult<()> {
        let (snapshot, old_path) = self.get_stack(old).await?;

        let new_base = stack_base_path(new);
        for candidate in [json_key(&new_base, false), json_key(&new_base, true)] {
            if self.store.exists(&candidate).await? {
                return Err(BackendError::DestinationExists(new.to_string()));
            }
        }

        let snapshot = snapshot.map(|mut snapshot| {
            snapshot.rename_stack(new.name(), new.project());
            snapshot
        });
        self.save_stack(new, snapshot.as_ref(), None).await?;
        self.backup_target(&old_path, false).await?;
        self.rename_history(old, new).await
    }

    /// Record a finished operation
    ///
    /// Writes `<name>-<nanos>.history.json` and a copy of the current
    /// checkpoint as `<name>-<nanos>.checkpoint.json` to the history directory.
    pub async fn add_to_history(
        &self,
        reference: &StackReference,
        info: &UpdateInfo,
    ) -> BackendResult<()> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let base = format!("{}/{}-{}", history_dir(reference), reference.name(), nanos);

        let history_key = json_key(&format!("{base}{HISTORY_EXT}"), self.options.gzip);
        let data = encode_for_key(&history_key, serde_json::to_vec_pretty(info)?)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        self.store
            .write_all(&history_key, &data, Some("application/json"))
            .await?;

        let stack_path = self.stack_path(reference).await?;
        let checkpoint_key = json_key(&format!("{base}{CHECKPOINT_EXT}"), is_gzip_key(&stack_path));
        self.store.copy(&checkpoint_key, &stack_path).await?;
        Ok(())
    }

    /// Update history of a stack, newest first
    ///
    /// `page` counts from 1; smaller values are treated as 1. A `page_size`
    /// of 0 returns everything.
    pub async fn get_history(
        &self,
        reference: &StackReference,
        page_size: usize,
        page: usize,
    ) -> BackendResult<Vec<UpdateInfo>> {
        let dir = format!("{}/", history_dir(reference));
        let mut records: Vec<(i64, String)> = self
            .store
            .list(&dir, Some("/"))
            .await?
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| history_timestamp(e.file_name()).map(|nanos| (nanos, e.key)))
            .collect();
        records.sort_by(|a, b| b.cmp(a));

        let page = page.max(1);
        let selected: Vec<_> = if page_size == 0 {
            records
        } else {
            records
                .into_iter()
                .skip((page - 1).saturating_mul(page_size))
                .take(page_size)
                .collect()
        };

        let mut updates = Vec::with_capacity(selected.len());
        for (_, key) in selected {
            let data = self.store.read_all(&key).await?;
            let data = decode_blob(&key, data).map_err(|e| BackendError::Io(e.to_string()))?;
            updates.push(serde_json::from_slice(&data)?);
        }
        Ok(updates)
    }

    /// Move the history of `old` to `new`, renaming `<old>-` file prefixes
    pub async fn rename_history(
        &self,
        old: &StackReference,
        new: &StackReference,
    ) -> BackendResult<()> {
        let old_dir = history_dir(old);
        let new_dir = history_dir(new);
        let old_prefix = format!("{}-", old.name());

        for entry in self.store.list(&format!("{old_dir}/"), Some("/")).await? {
            if entry.is_dir {
                continue;
            }
            let file_name = entry.file_name();
            let renamed = match file_name.strip_prefix(&old_prefix) {
                Some(rest) => format!("{}-{}", new.name(), rest),
                None => file_name.to_string(),
            };
            let target = format!("{new_dir}/{renamed}");

            self.store.copy(&target, &entry.key).await?;
            self.store.delete(&entry.key).await?;
        }
        Ok(())
    }
}

/// Timestamp of a `<name>-<nanos>.history.json[.gz]` file
fn history_timestamp(file_name: &str) -> Option<i64> {
    let base = file_name.strip_suffix(GZIP_EXT).unwrap_or(file_name);
    let stem = base.strip_suffix(JSON_EXT)?.strip_suffix(HISTORY_EXT)?;
    let (_, nanos) = stem.rsplit_once('-')?;
    nanos.parse().ok()
}

fn other_encoding(path: &str) -> &'static str {
    if is_gzip_key(path) { "plain" } else { "gzip" }
}
