//! Project - The project descriptor of the current workspace
//!
//! A project is described by a `Pulumi.yaml` file in the program directory.
//! The state backend uses it to infer the project of bare stack names and to
//! refuse stacks whose project contradicts the workspace.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the project descriptor
pub const PROJECT_FILE: &str = "Pulumi.yaml";

/// Errors raised while locating or loading a project
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("no {file} project file found (searching upwards from {0})", file = PROJECT_FILE)]
    NotFound(String),

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

pub type ProjectResult<T> = Result<T, ProjectError>;

/// Project descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub runtime: Option<serde_yaml::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Project {
    pub fn load(path: &Path) -> ProjectResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProjectError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| ProjectError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Source of the current project
pub trait ProjectLoader: Send + Sync {
    /// Path of the current project file, or `None` outside of a project
    fn project_path(&self) -> Option<PathBuf>;

    /// Load the current project
    fn current_project(&self) -> ProjectResult<Project>;
}

/// Finds the project by walking up from a directory
#[derive(Debug, Clone, Default)]
pub struct WorkspaceProjectLoader {
    /// Directory to start from; the working directory when `None`
    start: Option<PathBuf>,
}

impl WorkspaceProjectLoader {
    /// Search from the process working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Search from a fixed directory
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            start: Some(dir.into()),
        }
    }

    fn start_dir(&self) -> Option<PathBuf> {
        match &self.start {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_dir().ok(),
        }
    }
}

impl ProjectLoader for WorkspaceProjectLoader {
    fn project_path(&self) -> Option<PathBuf> {
        let start = self.start_dir()?;
        detect_project_path(&start)
    }

    fn current_project(&self) -> ProjectResult<Project> {
        match self.project_path() {
            Some(path) => Project::load(&path),
            None => Err(ProjectError::NotFound(
                self.start_dir()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            )),
        }
    }
}

/// A fixed project, or none at all
#[derive(Debug, Clone, Default)]
pub struct StaticProjectLoader {
    project: Option<Project>,
}

impl StaticProjectLoader {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            project: Some(Project {
                name: name.into(),
                runtime: None,
                description: None,
            }),
        }
    }
}

impl ProjectLoader for StaticProjectLoader {
    fn project_path(&self) -> Option<PathBuf> {
        self.project.as_ref().map(|_| PathBuf::from(PROJECT_FILE))
    }

    fn current_project(&self) -> ProjectResult<Project> {
        self.project
            .clone()
            .ok_or_else(|| ProjectError::NotFound("<static>".to_string()))
    }
}

/// Walk up from `start` looking for a project file
pub fn detect_project_path(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_FILE))
        .find(|candidate| candidate.is_file())
}
