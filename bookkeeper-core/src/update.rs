//! Update - Records describing operations performed against a stack

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of operation performed against a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Preview,
    Update,
    Import,
    Refresh,
    Destroy,
}

impl UpdateKind {
    /// Label shown to users for this kind of operation
    pub fn action_label(&self, dry_run: bool) -> &'static str {
        match (self, dry_run) {
            (Self::Preview, _) | (_, true) => "Previewing",
            (Self::Update, false) => "Updating",
            (Self::Import, false) => "Importing",
            (Self::Refresh, false) => "Refreshing",
            (Self::Destroy, false) => "Destroying",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preview => "preview",
            Self::Update => "update",
            Self::Import => "import",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// Outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateResult {
    InProgress,
    Succeeded,
    Failed,
}

/// Kind of change applied to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpType {
    Same,
    Create,
    Update,
    Delete,
    Replace,
    CreateReplacement,
    DeleteReplaced,
    Read,
    Refresh,
    Import,
}

/// Number of resources per kind of change
pub type ResourceChanges = BTreeMap<OpType, usize>;

/// History record of one completed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub kind: UpdateKind,
    /// Unix seconds
    pub start_time: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    pub result: UpdateResult,
    /// Unix seconds
    pub end_time: i64,
    #[serde(default)]
    pub resource_changes: ResourceChanges,
}

impl UpdateInfo {
    pub fn new(kind: UpdateKind, result: UpdateResult) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            kind,
            start_time: now,
            message: String::new(),
            environment: BTreeMap::new(),
            config: BTreeMap::new(),
            result,
            end_time: now,
            resource_changes: ResourceChanges::new(),
        }
    }
}
