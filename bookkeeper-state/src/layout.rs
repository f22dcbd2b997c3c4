//! Storage layout
//!
//! Stacks live under `.bookkeeping/` in one of two layouts. The legacy layout
//! keeps every stack file directly in `stacks/`; the project layout nests
//! them in one directory per project. The layout is recorded by a small
//! marker blob, `.bookkeeping/Pulumi.yaml`, that holds `version: 1` once a
//! store uses the project layout.

use bookkeeper_core::project::{ProjectError, ProjectLoader};
use bookkeeper_core::tokens::{MAX_NAME_LENGTH, is_name};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::blob::BlobStore;
use crate::encoding::stack_name_from_file;
use crate::reference::{ORGANIZATION, StackReference};

/// Root of everything the backend writes
pub const BOOKKEEPING_DIR: &str = ".bookkeeping";
pub const STACKS_DIR: &str = ".bookkeeping/stacks";
pub const HISTORY_DIR: &str = ".bookkeeping/history";
pub const LOCKS_DIR: &str = ".bookkeeping/locks";

/// Layout marker
pub const META_KEY: &str = ".bookkeeping/Pulumi.yaml";

/// Layout version written by this crate
pub const CURRENT_LAYOUT_VERSION: i64 = 1;

/// Contents of the layout marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutMetadata {
    #[serde(default)]
    pub version: i64,
}

/// How stacks are laid out in a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// `stacks/<name>.json`
    Legacy,
    /// `stacks/<project>/<name>.json`
    Project,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Project => "project",
        }
    }

    /// Parse a user-supplied stack reference
    ///
    /// In project mode `name`, `organization/name` and
    /// `organization/project/name` are accepted, a missing project being
    /// taken from `projects`. In legacy mode only a bare name is accepted.
    pub fn parse_reference(
        &self,
        reference: &str,
        projects: &dyn ProjectLoader,
    ) -> BackendResult<StackReference> {
        match self {
            Self::Legacy => {
                validate_stack_name(reference)?;
                Ok(StackReference::new(None, reference))
            }
            Self::Project => {
                let parts: Vec<&str> = reference.split('/').collect();
                let (org, project, name) = match parts.as_slice() {
                    [name] => ("", "", *name),
                    [org, name] => (*org, "", *name),
                    [org, project, name] => (*org, *project, *name),
                    _ => {
                        return Err(BackendError::invalid_reference(format!(
                            "could not parse stack reference '{reference}'"
                        )));
                    }
                };

                if !org.is_empty() && org != ORGANIZATION {
                    return Err(BackendError::invalid_reference(format!(
                        "organization name must be '{ORGANIZATION}'"
                    )));
                }

                let project = if project.is_empty() {
                    match projects.current_project() {
                        Ok(current) => current.name,
                        Err(err @ ProjectError::NotFound(_)) => {
                            return Err(BackendError::invalid_reference(format!(
                                "if you're using the --stack flag, pass the fully qualified name ({ORGANIZATION}/project/stack): {err}"
                            )));
                        }
                        Err(err) => return Err(err.into()),
                    }
                } else {
                    project.to_string()
                };

                validate_project_name(&project)?;
                validate_stack_name(name)?;
                Ok(StackReference::new(Some(project), name))
            }
        }
    }

    /// Check that a reference has the shape this layout expects
    pub fn validate_reference(&self, reference: &StackReference) -> BackendResult<()> {
        let valid = match self {
            Self::Legacy => reference.project().is_none(),
            Self::Project => reference.project().is_some(),
        };
        if valid {
            Ok(())
        } else {
            Err(BackendError::InvalidReferenceForLayout {
                reference: reference.to_string(),
                mode: self.as_str().to_string(),
            })
        }
    }

    /// Every stack stored in this layout
    pub async fn list_references(&self, store: &dyn BlobStore) -> BackendResult<Vec<StackReference>> {
        match self {
            Self::Legacy => list_legacy_stacks(store).await,
            Self::Project => {
                let mut references = Vec::new();
                for project in list_projects(store).await? {
                    let prefix = format!("{STACKS_DIR}/{project}/");
                    for entry in store.list(&prefix, Some("/")).await? {
                        if entry.is_dir {
                            continue;
                        }
                        if let Some(name) = stack_name_from_file(entry.file_name()) {
                            references.push(StackReference::new(Some(project.clone()), name));
                        }
                    }
                }
                references.sort();
                references.dedup();
                Ok(references)
            }
        }
    }
}

fn validate_project_name(project: &str) -> BackendResult<()> {
    if project.len() > MAX_NAME_LENGTH {
        return Err(BackendError::invalid_reference(format!(
            "project names must be less than {MAX_NAME_LENGTH} characters"
        )));
    }
    if !is_name(project) {
        return Err(BackendError::invalid_reference(format!(
            "project names may only contain alphanumerics, hyphens, underscores, and periods: {project}"
        )));
    }
    Ok(())
}

/// Check a bare stack name
pub fn validate_stack_name(name: &str) -> BackendResult<()> {
    if !is_name(name) || name.len() > MAX_NAME_LENGTH {
        return Err(BackendError::invalid_reference(format!(
            "stack names are limited to {MAX_NAME_LENGTH} characters and may only contain alphanumeric, hyphens, underscores, or periods: {name}"
        )));
    }
    Ok(())
}

/// Stack file path without extension
pub fn stack_base_path(reference: &StackReference) -> String {
    match reference.project() {
        Some(project) => format!("{STACKS_DIR}/{project}/{}", reference.name()),
        None => format!("{STACKS_DIR}/{}", reference.name()),
    }
}

/// Directory holding the history of a stack
pub fn history_dir(reference: &StackReference) -> String {
    match reference.project() {
        Some(project) => format!("{HISTORY_DIR}/{project}/{}", reference.name()),
        None => format!("{HISTORY_DIR}/{}", reference.name()),
    }
}

/// Directory holding the lock markers of a stack
pub fn lock_dir(reference: &StackReference) -> String {
    format!("{LOCKS_DIR}/{}", reference.fully_qualified_name())
}

/// Lock marker of one backend instance
pub fn lock_path(reference: &StackReference, lock_id: &str) -> String {
    format!("{}/{lock_id}.json", lock_dir(reference))
}

/// Read the layout version; `None` when there is no marker
pub async fn read_layout_version(store: &dyn BlobStore) -> BackendResult<Option<i64>> {
    let data = match store.read_all(META_KEY).await {
        Ok(data) => data,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let metadata: LayoutMetadata = serde_yaml::from_slice(&data)
        .map_err(|e| BackendError::CorruptState(format!("could not read {META_KEY}: {e}")))?;
    Ok(Some(metadata.version))
}

pub async fn write_layout_version(store: &dyn BlobStore, version: i64) -> BackendResult<()> {
    let data = serde_yaml::to_string(&LayoutMetadata { version })
        .map_err(|e| BackendError::Serialization(e.to_string()))?;
    store
        .write_all(META_KEY, data.as_bytes(), Some("application/x-yaml"))
        .await?;
    Ok(())
}

/// Work out which layout a store uses
///
/// A store without a marker is fresh when nothing at all lives under the
/// stacks directory; fresh stores get a marker and use the project layout.
/// Anything under the stacks directory means the store predates the
/// marker and stays in the legacy layout until upgraded.
pub async fn detect_layout(store: &dyn BlobStore) -> BackendResult<LayoutMode> {
    let mode = match read_layout_version(store).await? {
        Some(version) if version < 1 => {
            return Err(BackendError::CorruptState(format!(
                "{META_KEY} records layout version {version}"
            )));
        }
        Some(version) if version > CURRENT_LAYOUT_VERSION => {
            return Err(BackendError::UnsupportedStateVersion {
                found: version,
                max: CURRENT_LAYOUT_VERSION,
            });
        }
        Some(_) => LayoutMode::Project,
        None => {
            let entries = store.list(&format!("{STACKS_DIR}/"), Some("/")).await?;
            if entries.is_empty() {
                write_layout_version(store, CURRENT_LAYOUT_VERSION).await?;
                LayoutMode::Project
            } else {
                LayoutMode::Legacy
            }
        }
    };

    for legacy in list_legacy_stacks(store).await? {
        log::warn!(
            "Found legacy stack file '{}' in the state store; run `bookkeeper state upgrade` to move it into the project layout",
            legacy.name()
        );
    }

    log::debug!("state store uses the {} layout", mode.as_str());
    Ok(mode)
}

/// Stack files sitting directly in the stacks directory
pub async fn list_legacy_stacks(store: &dyn BlobStore) -> BackendResult<Vec<StackReference>> {
    let mut references: Vec<StackReference> = store
        .list(&format!("{STACKS_DIR}/"), Some("/"))
        .await?
        .iter()
        .filter(|entry| !entry.is_dir)
        .filter_map(|entry| stack_name_from_file(entry.file_name()))
        .map(|name| StackReference::new(None, name))
        .collect();
    references.sort();
    references.dedup();
    Ok(references)
}

/// Project directories of the project layout
pub async fn list_projects(store: &dyn BlobStore) -> BackendResult<Vec<String>> {
    let mut projects: Vec<String> = store
        .list(&format!("{STACKS_DIR}/"), Some("/"))
        .await?
        .iter()
        .filter(|entry| entry.is_dir)
        .map(|entry| entry.file_name())
        .filter(|name| is_name(name))
        .map(str::to_string)
        .collect();
    projects.sort();
    Ok(projects)
}
