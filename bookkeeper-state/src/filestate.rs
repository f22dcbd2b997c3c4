//! Self-managed state backend
//!
//! [`FileStateBackend`] implements the stack lifecycle on top of a blob
//! store. Every mutating operation runs under the stack's advisory lock, and
//! the lock is released on every exit path: explicitly on success and error,
//! and from the guard's destructor if the operation is cancelled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bookkeeper_core::deployment::{Snapshot, UntypedDeployment};
use bookkeeper_core::engine::{
    Engine, EngineOutput, EventSink, UpdateContext, UpdateOptions,
};
use bookkeeper_core::project::{ProjectLoader, WorkspaceProjectLoader};
use bookkeeper_core::secrets::SecretsManager;
use bookkeeper_core::tokens::is_name;
use bookkeeper_core::update::{ResourceChanges, UpdateInfo, UpdateKind, UpdateResult};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::{BackendError, BackendOptions, BackendResult};
use crate::blob::{BlobStore, VALID_SCHEMES, massage_blob_path, open_bucket, url_scheme};
use crate::layout::{
    BOOKKEEPING_DIR, CURRENT_LAYOUT_VERSION, LayoutMode, detect_layout, list_legacy_stacks,
    list_projects, validate_stack_name, write_layout_version,
};
use crate::lock::{LockGuard, LockManager};
use crate::persist::StackStore;
use crate::reference::StackReference;

/// A stack loaded from the store
#[derive(Debug, Clone)]
pub struct Stack {
    pub reference: StackReference,
    /// Latest snapshot; `None` for a stack that was never deployed
    pub snapshot: Option<Snapshot>,
    /// Key of the checkpoint blob
    pub path: String,
}

/// One line of a stack listing
#[derive(Debug, Clone, PartialEq)]
pub struct StackSummary {
    pub reference: StackReference,
    pub last_update: Option<DateTime<Utc>>,
    pub resource_count: Option<usize>,
}

/// Caller-supplied inputs of an engine operation
#[derive(Clone, Default)]
pub struct UpdateOperation {
    /// Recorded in the history entry
    pub message: String,
    /// Recorded in the history entry
    pub environment: BTreeMap<String, String>,
    /// Stack configuration handed to the engine and recorded in history
    pub config: BTreeMap<String, Value>,
    /// Passed through to the engine
    pub options: UpdateOptions,
    /// Secrets manager for the new checkpoint; the snapshot's own otherwise
    pub secrets: Option<Arc<dyn SecretsManager>>,
    /// Receives engine progress events
    pub events: Option<Arc<dyn EventSink>>,
}

/// Result of a successful engine operation
#[derive(Debug)]
pub struct ApplyOutcome {
    pub changes: ResourceChanges,
    /// Plan produced by previews
    pub plan: Option<Value>,
    /// Link to the checkpoint, when the store can produce one
    pub permalink: Option<String>,
    /// History or backup failure after the stack itself was saved
    ///
    /// `SavingUpdateInfo` takes precedence over `SavingBackup`.
    pub bookkeeping_error: Option<BackendError>,
}

/// Stack state kept in a blob store
pub struct FileStateBackend {
    original_url: String,
    url: String,
    store: Arc<dyn BlobStore>,
    stacks: StackStore,
    locks: LockManager,
    mode: Mutex<LayoutMode>,
    upgrade_lock: tokio::sync::Mutex<()>,
    projects: Arc<dyn ProjectLoader>,
}

impl FileStateBackend {
    /// Open the store at `url`
    ///
    /// Detects the storage layout, initializing a fresh store in the project
    /// layout. Each backend gets its own lock ID.
    pub async fn open(
        url: &str,
        options: BackendOptions,
        projects: Arc<dyn ProjectLoader>,
    ) -> BackendResult<Self> {
        let scheme = url_scheme(url);
        if !VALID_SCHEMES.contains(&scheme) {
            return Err(BackendError::UnsupportedScheme {
                scheme: scheme.to_string(),
                valid: VALID_SCHEMES.join(", "),
            });
        }

        let massaged = massage_blob_path(url)?;
        let store = open_bucket(&massaged).await?;
        let mode = detect_layout(store.as_ref()).await?;

        let locks = LockManager::new(store.clone());
        log::debug!(
            "opened {} in {} mode (lock ID {})",
            massaged,
            mode.as_str(),
            locks.lock_id()
        );

        Ok(Self {
            original_url: url.to_string(),
            url: massaged,
            stacks: StackStore::new(store.clone(), options),
            store,
            locks,
            mode: Mutex::new(mode),
            upgrade_lock: tokio::sync::Mutex::new(()),
            projects,
        })
    }

    /// Open with options from the environment and the working-directory project
    pub async fn login(url: &str) -> BackendResult<Self> {
        Self::open(
            url,
            BackendOptions::from_env(),
            Arc::new(WorkspaceProjectLoader::new()),
        )
        .await
    }

    /// Host name of this machine, or "local"
    pub fn name(&self) -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "local".to_string())
    }

    /// URL as given to [`FileStateBackend::open`]
    pub fn original_url(&self) -> &str {
        &self.original_url
    }

    /// Normalized URL of the store
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state_dir(&self) -> &'static str {
        BOOKKEEPING_DIR
    }

    pub fn lock_id(&self) -> &str {
        self.locks.lock_id()
    }

    pub fn layout_mode(&self) -> LayoutMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_project_mode(&self) -> bool {
        self.layout_mode() == LayoutMode::Project
    }

    pub fn parse_stack_reference(&self, reference: &str) -> BackendResult<StackReference> {
        self.layout_mode()
            .parse_reference(reference, self.projects.as_ref())
    }

    pub fn validate_stack_name(&self, reference: &str) -> BackendResult<()> {
        self.parse_stack_reference(reference).map(|_| ())
    }

    pub async fn does_project_exist(&self, project: &str) -> BackendResult<bool> {
        Ok(list_projects(self.store.as_ref())
            .await?
            .iter()
            .any(|p| p == project))
    }

    /// Check a reference against the current layout
    fn check_reference(&self, reference: &StackReference) -> BackendResult<()> {
        self.layout_mode().validate_reference(reference)
    }

    /// Fail if the reference names a project other than the workspace's
    ///
    /// Outside of a project, or when the project file cannot be loaded, there
    /// is nothing to contradict.
    fn check_workspace_project(&self, reference: &StackReference) -> BackendResult<()> {
        let Some(project) = reference.project() else {
            return Ok(());
        };
        if self.projects.project_path().is_none() {
            return Ok(());
        }
        match self.projects.current_project() {
            Ok(current) if current.name != project => Err(BackendError::ProjectMismatch {
                given: project.to_string(),
                expected: current.name,
            }),
            _ => Ok(()),
        }
    }

    pub async fn create_stack(&self, reference: &StackReference) -> BackendResult<Stack> {
        self.check_reference(reference)?;
        self.check_workspace_project(reference)?;

        let guard = self.locks.lock(reference, "create").await?;
        let result = self.create_locked(reference).await;
        release(guard).await;
        result
    }

    async fn create_locked(&self, reference: &StackReference) -> BackendResult<Stack> {
        match self.stacks.get_stack(reference).await {
            Ok(_) => return Err(BackendError::StackAlreadyExists(reference.to_string())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let path = self.stacks.save_stack(reference, None, None).await?;
        log::info!("created stack '{}'", reference);
        Ok(Stack {
            reference: reference.clone(),
            snapshot: None,
            path,
        })
    }

    /// Load a stack; `None` if it does not exist
    pub async fn get_stack(&self, reference: &StackReference) -> BackendResult<Option<Stack>> {
        self.check_reference(reference)?;
        match self.stacks.get_stack(reference).await {
            Ok((snapshot, path)) => Ok(Some(Stack {
                reference: reference.clone(),
                snapshot,
                path,
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Summaries of every stack in the store
    ///
    /// Reads checkpoint metadata only; secrets are never decrypted.
    pub async fn list_stacks(&self) -> BackendResult<Vec<StackSummary>> {
        let references = self
            .layout_mode()
            .list_references(self.store.as_ref())
            .await?;

        let mut summaries = Vec::with_capacity(references.len());
        for reference in references {
            let checkpoint = self.stacks.get_checkpoint(&reference).await?;
            summaries.push(StackSummary {
                last_update: checkpoint.last_update(),
                resource_count: checkpoint.resource_count(),
                reference,
            });
        }
        Ok(summaries)
    }

    /// Delete a stack, keeping a backup of its checkpoint
    ///
    /// A stack that still has resources is only removed when `force` is set.
    pub async fn remove_stack(&self, reference: &StackReference, force: bool) -> BackendResult<()> {
        self.check_reference(reference)?;

        let guard = self.locks.lock(reference, "remove").await?;
        let result = async {
            let (snapshot, _) = self
                .stacks
                .get_stack(reference)
                .await
                .map_err(|e| stack_not_found(e, reference))?;
            let count = snapshot.as_ref().map_or(0, |s| s.resources.len());
            if !force && count > 0 {
                return Err(BackendError::StackNotEmpty {
                    stack: reference.to_string(),
                    count,
                });
            }
            self.stacks.remove_stack(reference).await
        }
        .await;
        release(guard).await;
        result
    }

    /// Rename a stack, returning its new reference
    ///
    /// A bare new name keeps the stack in its project.
    pub async fn rename_stack(
        &self,
        reference: &StackReference,
        new_name: &str,
    ) -> BackendResult<StackReference> {
        self.check_reference(reference)?;
        let new = if new_name.contains('/') {
            self.parse_stack_reference(new_name)?
        } else {
            validate_stack_name(new_name)?;
            reference.with_name(new_name)
        };

        let guard = self.locks.lock(reference, "rename").await?;
        let result = self
            .stacks
            .rename_stack(reference, &new)
            .await
            .map_err(|e| stack_not_found(e, reference));
        release(guard).await;
        result?;

        log::info!("renamed stack '{}' to '{}'", reference, new);
        Ok(new)
    }

    /// Configuration recorded by the most recent operation
    pub async fn get_latest_configuration(
        &self,
        reference: &StackReference,
    ) -> BackendResult<BTreeMap<String, Value>> {
        let history = self.get_history(reference, 1, 1).await?;
        history
            .into_iter()
            .next()
            .map(|update| update.config)
            .ok_or(BackendError::NoPreviousDeployment)
    }

    pub async fn preview(
        &self,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
    ) -> BackendResult<ApplyOutcome> {
        self.guarded_apply(UpdateKind::Preview, reference, engine, operation, true)
            .await
    }

    pub async fn update(
        &self,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        self.guarded_apply(UpdateKind::Update, reference, engine, operation, dry_run)
            .await
    }

    pub async fn import_resources(
        &self,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        self.guarded_apply(UpdateKind::Import, reference, engine, operation, dry_run)
            .await
    }

    pub async fn refresh(
        &self,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        self.guarded_apply(UpdateKind::Refresh, reference, engine, operation, dry_run)
            .await
    }

    pub async fn destroy(
        &self,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        self.guarded_apply(UpdateKind::Destroy, reference, engine, operation, dry_run)
            .await
    }

    /// Run an engine operation against a stack
    ///
    /// Previews take no lock. Everything else runs under the stack lock.
    /// Dry runs leave no trace in the store; real runs save the resulting
    /// snapshot, record history and back up the checkpoint. An engine
    /// failure is returned in preference to any bookkeeping failure.
    pub async fn guarded_apply(
        &self,
        kind: UpdateKind,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        self.check_reference(reference)?;
        self.check_workspace_project(reference)?;

        let dry_run = dry_run || kind == UpdateKind::Preview;
        log::info!("{} ({})", kind.action_label(dry_run), reference);

        let guard = match kind {
            UpdateKind::Preview => None,
            _ => Some(self.locks.lock(reference, &kind.to_string()).await?),
        };
        let result = self
            .apply_locked(kind, reference, engine, operation, dry_run)
            .await;
        if let Some(guard) = guard {
            release(guard).await;
        }
        result
    }

    async fn apply_locked(
        &self,
        kind: UpdateKind,
        reference: &StackReference,
        engine: &dyn Engine,
        operation: &UpdateOperation,
        dry_run: bool,
    ) -> BackendResult<ApplyOutcome> {
        let checkpoint = self
            .stacks
            .get_checkpoint(reference)
            .await
            .map_err(|e| stack_not_found(e, reference))?;

        let context = UpdateContext {
            stack: reference.fully_qualified_name(),
            project: reference.project().map(str::to_string),
            config: operation.config.clone(),
            snapshot: checkpoint.latest,
            events: operation.events.clone(),
        };

        let start_time = Utc::now().timestamp();
        let EngineOutput {
            snapshot,
            changes,
            plan,
            result,
        } = engine
            .run(kind, context, &operation.options, dry_run)
            .await;
        let end_time = Utc::now().timestamp();

        if dry_run {
            result?;
            return Ok(ApplyOutcome {
                changes,
                plan,
                permalink: None,
                bookkeeping_error: None,
            });
        }

        let save_error = match &snapshot {
            Some(snapshot) => self
                .persist_snapshot(reference, snapshot, operation.secrets.as_deref())
                .await
                .err(),
            None => None,
        };

        let info = UpdateInfo {
            kind,
            start_time,
            message: operation.message.clone(),
            environment: operation.environment.clone(),
            config: operation.config.clone(),
            result: if result.is_ok() && save_error.is_none() {
                UpdateResult::Succeeded
            } else {
                UpdateResult::Failed
            },
            end_time,
            resource_changes: changes.clone(),
        };
        let history_error = self.stacks.add_to_history(reference, &info).await.err();
        let backup_error = self.stacks.backup_stack(reference).await.err();

        if let Err(engine_error) = result {
            for swallowed in [&save_error, &history_error, &backup_error]
                .into_iter()
                .flatten()
            {
                log::warn!("{} failed; additionally: {}", kind, swallowed);
            }
            return Err(engine_error.into());
        }
        if let Some(save_error) = save_error {
            return Err(save_error);
        }

        let bookkeeping_error = match (history_error, backup_error) {
            (Some(history), _) => Some(BackendError::SavingUpdateInfo(Box::new(history))),
            (None, Some(backup)) => Some(BackendError::SavingBackup(Box::new(backup))),
            (None, None) => None,
        };
        if let Some(err) = &bookkeeping_error {
            log::warn!("{} of {} succeeded, but {}", kind, reference, err);
        }

        Ok(ApplyOutcome {
            changes,
            plan,
            permalink: self.permalink(reference).await,
            bookkeeping_error,
        })
    }

    /// Back up the current checkpoint and write the new snapshot over it
    async fn persist_snapshot(
        &self,
        reference: &StackReference,
        snapshot: &Snapshot,
        secrets: Option<&dyn SecretsManager>,
    ) -> BackendResult<()> {
        if let Err(err) = self.stacks.backup_stack(reference).await {
            log::warn!("could not back up {} before saving: {}", reference, err);
        }
        self.stacks
            .save_stack(reference, Some(snapshot), secrets)
            .await?;
        Ok(())
    }

    /// Link to the checkpoint of a stack
    ///
    /// Local stores get a `file://` URL; other stores a signed URL if they
    /// can make one.
    async fn permalink(&self, reference: &StackReference) -> Option<String> {
        let path = match self.stacks.stack_path(reference).await {
            Ok(path) => path,
            Err(err) => {
                log::warn!("unable to determine checkpoint path for {}: {}", reference, err);
                return None;
            }
        };

        if url_scheme(&self.url) == "file" {
            return Some(format!("{}/{}", self.url.trim_end_matches('/'), path));
        }
        match self.store.signed_url(&path).await {
            Ok(link) => Some(link),
            Err(err) => {
                log::warn!("unable to create a permalink for {}: {}", reference, err);
                None
            }
        }
    }

    /// Update history of a stack, newest first
    pub async fn get_history(
        &self,
        reference: &StackReference,
        page_size: usize,
        page: usize,
    ) -> BackendResult<Vec<UpdateInfo>> {
        self.check_reference(reference)?;
        self.stacks.get_history(reference, page_size, page).await
    }

    /// The latest snapshot in the portable deployment format
    pub async fn export_deployment(
        &self,
        reference: &StackReference,
    ) -> BackendResult<UntypedDeployment> {
        self.check_reference(reference)?;
        let checkpoint = self
            .stacks
            .get_checkpoint(reference)
            .await
            .map_err(|e| stack_not_found(e, reference))?;
        Ok(UntypedDeployment::from_snapshot(checkpoint.latest.as_ref())?)
    }

    /// Replace the state of a stack with an exported deployment
    pub async fn import_deployment(
        &self,
        reference: &StackReference,
        deployment: &UntypedDeployment,
    ) -> BackendResult<()> {
        self.check_reference(reference)?;
        let snapshot = deployment.to_snapshot()?;

        let guard = self.locks.lock(reference, "import").await?;
        let result = self.persist_snapshot(reference, &snapshot, None).await;
        release(guard).await;
        result
    }

    /// Remove every lock on a stack, including other processes' locks
    pub async fn cancel_current_update(&self, reference: &StackReference) -> BackendResult<()> {
        self.locks.cancel(reference).await
    }

    /// Hold the stack lock outside of any operation
    ///
    /// While the guard is held, operations on this stack through this
    /// backend fail with [`BackendError::Locked`] like those of any other
    /// instance.
    pub async fn lock(&self, reference: &StackReference, operation: &str) -> BackendResult<LockGuard> {
        self.check_reference(reference)?;
        self.locks.lock(reference, operation).await
    }

    pub async fn unlock(&self, reference: &StackReference) -> BackendResult<()> {
        self.locks.unlock(reference).await
    }

    pub async fn check_for_lock(&self, reference: &StackReference) -> BackendResult<()> {
        self.locks.check_for_lock(reference).await
    }

    /// Move every legacy stack into the project layout
    ///
    /// The project of each stack is read from its resource URNs, so stacks
    /// without resources cannot be moved. Stacks moved before a failure stay
    /// moved; running the upgrade again picks up where it stopped.
    pub async fn upgrade(&self) -> BackendResult<()> {
        let _upgrading = self.upgrade_lock.lock().await;

        for old in list_legacy_stacks(self.store.as_ref()).await? {
            let checkpoint = self
                .stacks
                .get_checkpoint(&old)
                .await
                .map_err(|e| BackendError::migration(old.name(), e))?;
            let project = checkpoint
                .latest
                .as_ref()
                .and_then(|snapshot| snapshot.project())
                .map(str::to_string)
                .ok_or_else(|| {
                    BackendError::migration(old.name(), "could not determine the project of the stack")
                })?;
            if !is_name(&project) {
                return Err(BackendError::migration(
                    old.name(),
                    format!("'{project}' is not a valid project name"),
                ));
            }

            let new = StackReference::new(Some(project), old.name());
            let guard = self.locks.lock(&old, "upgrade").await?;
            let result = self.stacks.rename_stack(&old, &new).await;
            release(guard).await;
            result.map_err(|e| BackendError::migration(old.name(), e))?;
            log::info!("moved stack '{}' to '{}'", old, new);
        }

        write_layout_version(self.store.as_ref(), CURRENT_LAYOUT_VERSION).await?;
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = LayoutMode::Project;
        Ok(())
    }
}

/// Release a lock, logging rather than failing
async fn release(guard: LockGuard) {
    let reference = guard.reference().clone();
    if let Err(err) = guard.release().await {
        log::warn!("failed to release lock on {}: {}", reference, err);
    }
}

fn stack_not_found(err: BackendError, reference: &StackReference) -> BackendError {
    if err.is_not_found() {
        BackendError::StackNotFound(reference.to_string())
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{META_KEY, read_layout_version};
    use bookkeeper_core::deployment::{Checkpoint, ResourceState};
    use bookkeeper_core::engine::{BoxFuture, EngineError};
    use bookkeeper_core::project::StaticProjectLoader;
    use bookkeeper_core::secrets::Base64SecretsManager;
    use bookkeeper_core::tokens::Urn;
    use bookkeeper_core::update::OpType;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn file_url(dir: &TempDir) -> String {
        format!("file://{}", dir.path().display())
    }

    async fn open_with(dir: &TempDir, options: BackendOptions) -> FileStateBackend {
        FileStateBackend::open(
            &file_url(dir),
            options,
            Arc::new(StaticProjectLoader::none()),
        )
        .await
        .unwrap()
    }

    async fn open(dir: &TempDir) -> FileStateBackend {
        open_with(dir, BackendOptions::default()).await
    }

    fn resource(stack: &str, project: &str, name: &str) -> ResourceState {
        ResourceState::new(Urn::new(stack, project, "", "pkg:index:Thing", name), "pkg:index:Thing")
    }

    /// Engine that adds one resource per run, or fails
    struct TestEngine {
        fail: bool,
    }

    impl Engine for TestEngine {
        fn run<'a>(
            &'a self,
            _kind: UpdateKind,
            context: UpdateContext,
            _options: &'a UpdateOptions,
            _dry_run: bool,
        ) -> BoxFuture<'a, EngineOutput> {
            Box::pin(async move {
                let stack = context.stack.rsplit('/').next().unwrap_or_default().to_string();
                let project = context.project.clone().unwrap_or_else(|| "proj".to_string());
                let mut snapshot = context.snapshot.unwrap_or_else(|| Snapshot::new(Vec::new()));
                let name = format!("thing{}", snapshot.resources.len());
                snapshot.resources.push(resource(&stack, &project, &name));

                let mut changes = ResourceChanges::new();
                changes.insert(OpType::Create, 1);
                if self.fail {
                    EngineOutput::failed(Some(snapshot), changes, EngineError::new("provider crashed"))
                } else {
                    EngineOutput::succeeded(Some(snapshot), changes)
                }
            })
        }
    }

    fn backups(dir: &TempDir, project: &str) -> Vec<String> {
        let stacks = dir.path().join(".bookkeeping/stacks").join(project);
        let mut names: Vec<String> = std::fs::read_dir(stacks)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(".bak"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_open_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let url = format!("file://{}/missing", dir.path().display());
        let result =
            FileStateBackend::open(&url, BackendOptions::default(), Arc::new(StaticProjectLoader::none()))
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_unsupported_scheme() {
        let result = FileStateBackend::open(
            "ftp://example.com/state",
            BackendOptions::default(),
            Arc::new(StaticProjectLoader::none()),
        )
        .await;
        match result {
            Err(BackendError::UnsupportedScheme { scheme, valid }) => {
                assert_eq!(scheme, "ftp");
                assert_eq!(valid, "file, s3");
            }
            _ => panic!("Expected UnsupportedScheme error"),
        }
    }

    #[tokio::test]
    async fn test_fresh_store_is_project_mode() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;

        assert!(backend.is_project_mode());
        assert!(dir.path().join(META_KEY).is_file());
        assert_eq!(backend.state_dir(), ".bookkeeping");
        assert!(backend.url().starts_with("file:///"));
        assert!(!backend.name().is_empty());
        assert!(backend.parse_stack_reference("").is_err());
        assert!(backend.validate_stack_name("organization/proj/dev").is_ok());
    }

    #[tokio::test]
    async fn test_each_backend_has_its_own_lock_id() {
        let dir = tempdir().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;
        assert_ne!(first.lock_id(), second.lock_id());
    }

    #[tokio::test]
    async fn test_corrupt_and_unsupported_marker() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".bookkeeping")).unwrap();

        std::fs::write(dir.path().join(META_KEY), "version: 0\n").unwrap();
        let result = FileStateBackend::open(
            &file_url(&dir),
            BackendOptions::default(),
            Arc::new(StaticProjectLoader::none()),
        )
        .await;
        assert!(matches!(result, Err(BackendError::CorruptState(_))));

        std::fs::write(dir.path().join(META_KEY), "version: 2\n").unwrap();
        let result = FileStateBackend::open(
            &file_url(&dir),
            BackendOptions::default(),
            Arc::new(StaticProjectLoader::none()),
        )
        .await;
        assert!(matches!(
            result,
            Err(BackendError::UnsupportedStateVersion { found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_stack_lifecycle() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();

        assert!(backend.get_stack(&dev).await.unwrap().is_none());

        let created = backend.create_stack(&dev).await.unwrap();
        assert_eq!(created.path, ".bookkeeping/stacks/proj/dev.json");
        assert!(created.snapshot.is_none());
        assert!(backups(&dir, "proj").is_empty());
        assert!(matches!(
            backend.create_stack(&dev).await,
            Err(BackendError::StackAlreadyExists(_))
        ));

        let stacks = backend.list_stacks().await.unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].reference, dev);
        assert_eq!(stacks[0].resource_count, None);
        assert!(backend.does_project_exist("proj").await.unwrap());
        assert!(!backend.does_project_exist("other").await.unwrap());

        backend.remove_stack(&dev, false).await.unwrap();
        assert!(backend.get_stack(&dev).await.unwrap().is_none());
        assert_eq!(backups(&dir, "proj"), vec!["dev.json.bak".to_string()]);
        assert!(backend.list_stacks().await.unwrap().is_empty());

        // No lock is left behind by any of the above.
        let other = open(&dir).await;
        other.check_for_lock(&dev).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_refuses_stack_with_resources() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        backend.create_stack(&dev).await.unwrap();
        backend
            .update(&dev, &TestEngine { fail: false }, &UpdateOperation::default(), false)
            .await
            .unwrap();

        let before = backups(&dir, "proj");
        assert!(matches!(
            backend.remove_stack(&dev, false).await,
            Err(BackendError::StackNotEmpty { count: 1, .. })
        ));
        assert_eq!(backups(&dir, "proj"), before);
        let kept = backend.get_stack(&dev).await.unwrap().unwrap();
        assert_eq!(kept.snapshot.unwrap().resources.len(), 1);

        backend.remove_stack(&dev, true).await.unwrap();
        assert!(backend.get_stack(&dev).await.unwrap().is_none());

        assert!(matches!(
            backend.remove_stack(&dev, true).await,
            Err(BackendError::StackNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_project_must_match_workspace() {
        let dir = tempdir().unwrap();
        let backend = FileStateBackend::open(
            &file_url(&dir),
            BackendOptions::default(),
            Arc::new(StaticProjectLoader::named("proj")),
        )
        .await
        .unwrap();

        let inferred = backend.parse_stack_reference("dev").unwrap();
        assert_eq!(inferred.to_string(), "organization/proj/dev");
        backend.create_stack(&inferred).await.unwrap();

        let other = backend.parse_stack_reference("organization/other/dev").unwrap();
        assert!(matches!(
            backend.create_stack(&other).await,
            Err(BackendError::ProjectMismatch { .. })
        ));
        assert!(backend.get_stack(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_keeps_history() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let a = backend.parse_stack_reference("organization/proj/a").unwrap();
        backend.create_stack(&a).await.unwrap();
        backend
            .update(&a, &TestEngine { fail: false }, &UpdateOperation::default(), false)
            .await
            .unwrap();

        let b = backend.rename_stack(&a, "b").await.unwrap();
        assert_eq!(b.to_string(), "organization/proj/b");
        let c = backend.rename_stack(&b, "organization/proj/c").await.unwrap();

        assert!(backend.get_stack(&a).await.unwrap().is_none());
        assert!(backend.get_stack(&b).await.unwrap().is_none());
        let stack = backend.get_stack(&c).await.unwrap().unwrap();
        let snapshot = stack.snapshot.unwrap();
        assert_eq!(snapshot.resources[0].urn.stack(), Some("c"));

        let history = backend.get_history(&c, 0, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, UpdateKind::Update);

        let d = backend.parse_stack_reference("organization/proj/d").unwrap();
        backend.create_stack(&d).await.unwrap();
        assert!(matches!(
            backend.rename_stack(&c, "d").await,
            Err(BackendError::DestinationExists(_))
        ));
        assert!(backend.rename_stack(&c, "not valid").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_foreign_lock() {
        let dir = tempdir().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;
        let dev = first.parse_stack_reference("organization/proj/dev").unwrap();
        first.create_stack(&dev).await.unwrap();

        let guard = first.lock(&dev, "update").await.unwrap();
        assert!(matches!(
            second.check_for_lock(&dev).await,
            Err(BackendError::Locked { count: 1, .. })
        ));
        assert!(matches!(
            second.remove_stack(&dev, true).await,
            Err(BackendError::Locked { .. })
        ));

        second.cancel_current_update(&dev).await.unwrap();
        first.check_for_lock(&dev).await.unwrap();
        second.check_for_lock(&dev).await.unwrap();
        guard.release().await.unwrap();

        // Cancelling a stack that was never locked is a no-op.
        let never = first.parse_stack_reference("organization/proj/never").unwrap();
        first.cancel_current_update(&never).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_while_holding_lock_keeps_marker() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        backend.create_stack(&dev).await.unwrap();

        let guard = backend.lock(&dev, "refresh").await.unwrap();
        assert!(matches!(
            backend
                .update(&dev, &TestEngine { fail: false }, &UpdateOperation::default(), false)
                .await,
            Err(BackendError::Locked { count: 1, .. })
        ));

        // The outer lock is still held.
        let other = open(&dir).await;
        assert!(matches!(
            other.check_for_lock(&dev).await,
            Err(BackendError::Locked { .. })
        ));
        guard.release().await.unwrap();
        other.check_for_lock(&dev).await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_configuration_is_from_last_update() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        backend.create_stack(&dev).await.unwrap();

        for region in ["us-east-1", "eu-west-1"] {
            let operation = UpdateOperation {
                config: BTreeMap::from([
                    ("aws:region".to_string(), json!(region)),
                    ("proj:replicas".to_string(), json!(3)),
                ]),
                ..UpdateOperation::default()
            };
            backend
                .update(&dev, &TestEngine { fail: false }, &operation, false)
                .await
                .unwrap();
        }

        let config = backend.get_latest_configuration(&dev).await.unwrap();
        assert_eq!(config.get("aws:region"), Some(&json!("eu-west-1")));
        assert_eq!(config.get("proj:replicas"), Some(&json!(3)));

        let history = backend.get_history(&dev, 0, 1).await.unwrap();
        assert_eq!(history[1].config.get("aws:region"), Some(&json!("us-east-1")));
    }

    #[tokio::test]
    async fn test_update_records_history_and_backup() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        backend.create_stack(&dev).await.unwrap();

        let operation = UpdateOperation {
            message: "first deploy".to_string(),
            secrets: Some(Arc::new(Base64SecretsManager)),
            ..UpdateOperation::default()
        };
        let outcome = backend
            .update(&dev, &TestEngine { fail: false }, &operation, false)
            .await
            .unwrap();

        assert_eq!(outcome.changes.get(&OpType::Create), Some(&1));
        assert!(outcome.bookkeeping_error.is_none());
        let permalink = outcome.permalink.unwrap();
        assert!(permalink.starts_with("file:///"));
        assert!(permalink.ends_with("/.bookkeeping/stacks/proj/dev.json"));

        let stack = backend.get_stack(&dev).await.unwrap().unwrap();
        let snapshot = stack.snapshot.unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.secrets_providers.unwrap().provider_type, "b64");

        let history = backend.get_history(&dev, 10, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "first deploy");
        assert_eq!(history[0].result, UpdateResult::Succeeded);
        assert!(
            dir.path()
                .join(".bookkeeping/stacks/proj/dev.json.bak")
                .is_file()
        );

        let summary = &backend.list_stacks().await.unwrap()[0];
        assert_eq!(summary.resource_count, Some(1));
        assert!(summary.last_update.is_some());

        let other = open(&dir).await;
        other.check_for_lock(&dev).await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_failure_wins() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        backend.create_stack(&dev).await.unwrap();

        let result = backend
            .destroy(&dev, &TestEngine { fail: true }, &UpdateOperation::default(), false)
            .await;
        match result {
            Err(BackendError::Engine(err)) => assert_eq!(err.to_string(), "provider crashed"),
            _ => panic!("Expected Engine error"),
        }

        let history = backend.get_history(&dev, 0, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, UpdateKind::Destroy);
        assert_eq!(history[0].result, UpdateResult::Failed);

        let other = open(&dir).await;
        other.check_for_lock(&dev).await.unwrap();
    }

    #[tokio::test]
    async fn test_preview_takes_no_lock_and_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;
        let dev = first.parse_stack_reference("organization/proj/dev").unwrap();
        first.create_stack(&dev).await.unwrap();

        let guard = first.lock(&dev, "update").await.unwrap();
        let outcome = second
            .preview(&dev, &TestEngine { fail: false }, &UpdateOperation::default())
            .await
            .unwrap();
        assert!(outcome.permalink.is_none());
        guard.release().await.unwrap();

        assert!(second.get_history(&dev, 0, 1).await.unwrap().is_empty());
        let stack = second.get_stack(&dev).await.unwrap().unwrap();
        assert!(stack.snapshot.is_none());
        assert!(
            !dir.path()
                .join(".bookkeeping/stacks/proj/dev.json.bak")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_update_of_missing_stack() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        assert!(matches!(
            backend
                .update(&dev, &TestEngine { fail: false }, &UpdateOperation::default(), false)
                .await,
            Err(BackendError::StackNotFound(_))
        ));
        backend.check_for_lock(&dev).await.unwrap();
        assert!(matches!(
            backend.get_latest_configuration(&dev).await,
            Err(BackendError::NoPreviousDeployment)
        ));
    }

    #[tokio::test]
    async fn test_export_import_deployment() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();
        let prod = backend.parse_stack_reference("organization/proj/prod").unwrap();
        backend.create_stack(&dev).await.unwrap();
        backend
            .update(&dev, &TestEngine { fail: false }, &UpdateOperation::default(), false)
            .await
            .unwrap();

        let exported = backend.export_deployment(&dev).await.unwrap();
        assert_eq!(exported.version, 3);

        backend.import_deployment(&prod, &exported).await.unwrap();
        let imported = backend.get_stack(&prod).await.unwrap().unwrap();
        assert_eq!(imported.snapshot.unwrap().resources.len(), 1);

        let future = UntypedDeployment {
            version: 4,
            deployment: exported.deployment.clone(),
        };
        assert!(matches!(
            backend.import_deployment(&prod, &future).await,
            Err(BackendError::UnsupportedDeploymentVersion(4))
        ));
        assert!(matches!(
            backend
                .export_deployment(&backend.parse_stack_reference("organization/proj/x").unwrap())
                .await,
            Err(BackendError::StackNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_html_is_not_escaped() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();

        let snapshot = Snapshot::new(vec![
            resource("dev", "proj", "thing").with_input("html", json!("<html@tags>")),
        ]);
        let deployment = UntypedDeployment::from_snapshot(Some(&snapshot)).unwrap();
        backend.import_deployment(&dev, &deployment).await.unwrap();

        let text =
            std::fs::read_to_string(dir.path().join(".bookkeeping/stacks/proj/dev.json")).unwrap();
        assert!(text.contains("<html@tags>"));
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let dir = tempdir().unwrap();
        let backend = open_with(&dir, BackendOptions::default().with_gzip(true)).await;
        let dev = backend.parse_stack_reference("organization/proj/dev").unwrap();

        let created = backend.create_stack(&dev).await.unwrap();
        assert_eq!(created.path, ".bookkeeping/stacks/proj/dev.json.gz");
        backend
            .update(&dev, &TestEngine { fail: false }, &UpdateOperation::default(), false)
            .await
            .unwrap();

        // A backend without compression reads what was written.
        let plain = open(&dir).await;
        let stack = plain.get_stack(&dev).await.unwrap().unwrap();
        assert_eq!(stack.snapshot.unwrap().resources.len(), 1);
        assert_eq!(plain.get_history(&dev, 0, 1).await.unwrap().len(), 1);
        assert_eq!(plain.list_stacks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_stacks_with_different_secrets_providers() {
        let dir = tempdir().unwrap();
        let backend = open(&dir).await;

        for (name, provider) in [("one", "b64"), ("two", "passphrase"), ("three", "awskms")] {
            let reference = backend
                .parse_stack_reference(&format!("organization/proj/{name}"))
                .unwrap();
            let mut snapshot = Snapshot::new(vec![resource(name, "proj", "thing")]);
            snapshot.secrets_providers = Some(bookkeeper_core::deployment::SecretsProviders {
                provider_type: provider.to_string(),
                state: Some(json!({"salt": "unreadable without the provider"})),
            });
            let deployment = UntypedDeployment::from_snapshot(Some(&snapshot)).unwrap();
            backend.import_deployment(&reference, &deployment).await.unwrap();
        }

        let stacks = backend.list_stacks().await.unwrap();
        assert_eq!(stacks.len(), 3);
        assert!(stacks.iter().all(|s| s.resource_count == Some(1)));
    }

    fn write_legacy_stack(dir: &TempDir, name: &str, resources: Vec<ResourceState>) {
        let stacks = dir.path().join(".bookkeeping/stacks");
        std::fs::create_dir_all(&stacks).unwrap();
        let latest = if resources.is_empty() {
            None
        } else {
            Some(Snapshot::new(resources))
        };
        let checkpoint = Checkpoint::new(name, latest);
        std::fs::write(
            stacks.join(format!("{name}.json")),
            checkpoint.to_vec().unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_legacy_store_and_upgrade() {
        let dir = tempdir().unwrap();
        write_legacy_stack(&dir, "a", vec![resource("a", "proj", "thing")]);
        write_legacy_stack(&dir, "b", vec![resource("b", "other", "thing")]);

        let backend = open(&dir).await;
        assert!(!backend.is_project_mode());
        assert!(backend.parse_stack_reference("organization/proj/a").is_err());

        let a = backend.parse_stack_reference("a").unwrap();
        assert_eq!(a.to_string(), "a");
        let names: Vec<_> = backend
            .list_stacks()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.reference.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        // History written in the legacy layout follows the stack.
        backend
            .update(&a, &TestEngine { fail: false }, &UpdateOperation::default(), false)
            .await
            .unwrap();

        backend.upgrade().await.unwrap();
        assert!(backend.is_project_mode());
        assert_eq!(read_layout_version(backend.store.as_ref()).await.unwrap(), Some(1));

        let names: Vec<_> = backend
            .list_stacks()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.reference.to_string())
            .collect();
        assert_eq!(names, vec!["organization/other/b", "organization/proj/a"]);

        let moved = backend.parse_stack_reference("organization/proj/a").unwrap();
        assert_eq!(backend.get_history(&moved, 0, 1).await.unwrap().len(), 1);
        assert!(dir.path().join(".bookkeeping/stacks/a.json.bak").is_file());

        // Running the upgrade again changes nothing.
        backend.upgrade().await.unwrap();
        assert_eq!(backend.list_stacks().await.unwrap().len(), 2);

        // A reopened backend sees the project layout.
        assert!(open(&dir).await.is_project_mode());
    }

    #[tokio::test]
    async fn test_upgrade_needs_resources_to_find_project() {
        let dir = tempdir().unwrap();
        write_legacy_stack(&dir, "empty", Vec::new());

        let backend = open(&dir).await;
        assert!(matches!(
            backend.upgrade().await,
            Err(BackendError::Migration { .. })
        ));
        assert!(!backend.is_project_mode());
        assert_eq!(read_layout_version(backend.store.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upgrade_keeps_history_when_stack_is_named_like_project() {
        let dir = tempdir().unwrap();
        write_legacy_stack(&dir, "aaa", vec![resource("aaa", "alpha", "thing")]);
        write_legacy_stack(&dir, "alpha", vec![resource("alpha", "alpha", "thing")]);

        let backend = open(&dir).await;
        let engine = TestEngine { fail: false };
        let aaa = backend.parse_stack_reference("aaa").unwrap();
        let alpha = backend.parse_stack_reference("alpha").unwrap();
        for _ in 0..2 {
            backend
                .update(&aaa, &engine, &UpdateOperation::default(), false)
                .await
                .unwrap();
        }
        backend
            .update(&alpha, &engine, &UpdateOperation::default(), false)
            .await
            .unwrap();

        backend.upgrade().await.unwrap();

        let aaa = backend.parse_stack_reference("organization/alpha/aaa").unwrap();
        let alpha = backend.parse_stack_reference("organization/alpha/alpha").unwrap();
        assert_eq!(backend.get_history(&aaa, 0, 1).await.unwrap().len(), 2);
        assert_eq!(backend.get_history(&alpha, 0, 1).await.unwrap().len(), 1);
        assert!(!dir.path().join(".bookkeeping/history/alpha/alpha/aaa").exists());
    }
}
