//! Deployment - Checkpoint and snapshot documents persisted for each stack
//!
//! A [`Snapshot`] is the resource graph of a stack plus its metadata. It is
//! wrapped in a [`Checkpoint`] (stack name, config, latest snapshot) which is
//! itself stored inside a [`VersionedCheckpoint`] envelope on disk.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::secrets::SecretsManager;
use crate::tokens::Urn;

/// Checkpoint format version written by this crate
pub const CURRENT_CHECKPOINT_VERSION: u32 = 3;

/// Deployment format version written by exports
pub const CURRENT_DEPLOYMENT_VERSION: i64 = 3;

/// Oldest deployment version accepted by imports
pub const MIN_DEPLOYMENT_VERSION: i64 = 1;

/// Errors raised while decoding checkpoints and deployments
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to parse checkpoint: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(
        "unsupported checkpoint version {0}; this version supports up to {max}",
        max = CURRENT_CHECKPOINT_VERSION
    )]
    UnsupportedCheckpointVersion(u32),

    #[error(
        "unsupported deployment version {0}; expected a version between {min} and {max}",
        min = MIN_DEPLOYMENT_VERSION,
        max = CURRENT_DEPLOYMENT_VERSION
    )]
    UnsupportedDeploymentVersion(i64),
}

/// Information about the tool that wrote a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub magic: String,
    #[serde(default)]
    pub version: String,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            time: Utc::now(),
            magic: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Secrets manager configuration recorded alongside a snapshot
///
/// Only metadata is stored here; decrypting values requires the matching
/// [`SecretsManager`], which is never needed to load or list stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretsProviders {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl SecretsProviders {
    pub fn from_manager(manager: &dyn SecretsManager) -> Self {
        Self {
            provider_type: manager.type_name().to_string(),
            state: manager.state(),
        }
    }
}

/// State of a single resource within a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub urn: Urn,
    #[serde(default)]
    pub custom: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protect: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    /// Provider reference in the form `<provider urn>::<provider id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    /// Fields this crate does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceState {
    pub fn new(urn: Urn, resource_type: impl Into<String>) -> Self {
        Self {
            urn,
            custom: true,
            delete: false,
            id: None,
            resource_type: resource_type.into(),
            inputs: Map::new(),
            outputs: Map::new(),
            parent: None,
            protect: false,
            dependencies: Vec::new(),
            provider: None,
            property_dependencies: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent: Urn) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dependency(mut self, dependency: Urn) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// The resource graph of a stack at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub manifest: Manifest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_providers: Option<SecretsProviders>,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<Value>,
}

impl Snapshot {
    pub fn new(resources: Vec<ResourceState>) -> Self {
        Self {
            manifest: Manifest::new(),
            secrets_providers: None,
            resources,
            pending_operations: Vec::new(),
        }
    }

    pub fn with_secrets_manager(mut self, manager: &dyn SecretsManager) -> Self {
        self.secrets_providers = Some(SecretsProviders::from_manager(manager));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Project of the first resource whose URN names one
    pub fn project(&self) -> Option<&str> {
        self.resources
            .iter()
            .filter_map(|r| r.urn.project())
            .find(|p| !p.is_empty())
    }

    /// Rewrite every URN in the snapshot so it belongs to `stack`
    ///
    /// If `project` is given the project component is rewritten as well.
    /// Parents, dependencies, property dependencies and provider references
    /// are rewritten together with the resources they point at.
    pub fn rename_stack(&mut self, stack: &str, project: Option<&str>) {
        let rename = |urn: &Urn| urn.rename(stack, project);

        for resource in &mut self.resources {
            resource.urn = rename(&resource.urn);
            if let Some(parent) = &resource.parent {
                resource.parent = Some(rename(parent));
            }
            for dependency in &mut resource.dependencies {
                *dependency = rename(dependency);
            }
            for dependencies in resource.property_dependencies.values_mut() {
                for dependency in dependencies.iter_mut() {
                    *dependency = rename(dependency);
                }
            }
            if let Some(provider) = &resource.provider {
                resource.provider = Some(rename_provider_reference(provider, stack, project));
            }
        }
    }
}

/// Rewrite the URN half of a `<urn>::<id>` provider reference
fn rename_provider_reference(reference: &str, stack: &str, project: Option<&str>) -> String {
    match reference.rsplit_once("::") {
        Some((urn, id)) => match Urn::parse(urn) {
            Ok(urn) => format!("{}::{}", urn.rename(stack, project), id),
            Err(_) => reference.to_string(),
        },
        None => reference.to_string(),
    }
}

/// The current state of a stack: its name, config and latest snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub stack: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub latest: Option<Snapshot>,
}

impl Checkpoint {
    pub fn new(stack: impl Into<String>, latest: Option<Snapshot>) -> Self {
        Self {
            stack: stack.into(),
            config: BTreeMap::new(),
            latest,
        }
    }

    /// Number of resources in the latest snapshot, if any
    pub fn resource_count(&self) -> Option<usize> {
        self.latest.as_ref().map(|s| s.resources.len())
    }

    /// Time the latest snapshot was written, if any
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.latest.as_ref().map(|s| s.manifest.time)
    }

    /// Decode a checkpoint blob
    ///
    /// Documents without a `version` field predate versioning and are read
    /// as a bare checkpoint body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let versioned: VersionedCheckpoint = serde_json::from_slice(bytes)?;
        match versioned.version {
            0 => Ok(serde_json::from_slice(bytes)?),
            1..=CURRENT_CHECKPOINT_VERSION => match versioned.checkpoint {
                Some(body) => Ok(serde_json::from_value(body)?),
                None => Ok(Self::new("", None)),
            },
            other => Err(CheckpointError::UnsupportedCheckpointVersion(other)),
        }
    }

    /// Encode as a pretty-printed versioned checkpoint
    pub fn to_vec(&self) -> Result<Vec<u8>, CheckpointError> {
        let versioned = VersionedCheckpoint {
            version: CURRENT_CHECKPOINT_VERSION,
            checkpoint: Some(serde_json::to_value(self)?),
        };
        Ok(serde_json::to_vec_pretty(&versioned)?)
    }
}

/// On-disk envelope around a [`Checkpoint`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedCheckpoint {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
}

/// Language-agnostic envelope used to export and import deployments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntypedDeployment {
    pub version: i64,
    pub deployment: Value,
}

impl UntypedDeployment {
    /// Wrap a snapshot in the current deployment format
    pub fn from_snapshot(snapshot: Option<&Snapshot>) -> Result<Self, CheckpointError> {
        let deployment = match snapshot {
            Some(snapshot) => serde_json::to_value(snapshot)?,
            None => serde_json::to_value(Snapshot::new(Vec::new()))?,
        };
        Ok(Self {
            version: CURRENT_DEPLOYMENT_VERSION,
            deployment,
        })
    }

    /// Decode the deployment into a snapshot, checking its version
    pub fn to_snapshot(&self) -> Result<Snapshot, CheckpointError> {
        if !(MIN_DEPLOYMENT_VERSION..=CURRENT_DEPLOYMENT_VERSION).contains(&self.version) {
            return Err(CheckpointError::UnsupportedDeploymentVersion(self.version));
        }
        Ok(serde_json::from_value(self.deployment.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::Base64SecretsManager;
    use serde_json::json;

    fn resource(stack: &str, name: &str) -> ResourceState {
        ResourceState::new(Urn::new(stack, "proj", "", "a:b:c", name), "a:b:c")
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let snapshot = Snapshot::new(vec![resource("dev", "one")]);
        let checkpoint = Checkpoint::new("organization/proj/dev", Some(snapshot));

        let bytes = checkpoint.to_vec().unwrap();
        let decoded = Checkpoint::from_slice(&bytes).unwrap();

        assert_eq!(decoded, checkpoint);
        assert_eq!(decoded.resource_count(), Some(1));
    }

    #[test]
    fn test_unversioned_checkpoint() {
        let bytes = br#"{
            "latest": {
                "resources": [
                    {
                        "type": "package:module:resource",
                        "urn": "urn:pulumi:stack::project::package:module:resource::name"
                    }
                ]
            }
        }"#;

        let checkpoint = Checkpoint::from_slice(bytes).unwrap();
        let snapshot = checkpoint.latest.unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.project(), Some("project"));
    }

    #[test]
    fn test_empty_document_is_empty_checkpoint() {
        let checkpoint = Checkpoint::from_slice(b"{}").unwrap();
        assert!(checkpoint.latest.is_none());
        assert_eq!(checkpoint.resource_count(), None);
    }

    #[test]
    fn test_future_checkpoint_version_rejected() {
        let result = Checkpoint::from_slice(br#"{"version": 42, "checkpoint": {}}"#);
        assert!(matches!(
            result,
            Err(CheckpointError::UnsupportedCheckpointVersion(42))
        ));
    }

    #[test]
    fn test_unknown_resource_fields_preserved() {
        let value = json!({
            "urn": "urn:pulumi:dev::proj::a:b:c::name",
            "type": "a:b:c",
            "retainOnDelete": true,
        });
        let resource: ResourceState = serde_json::from_value(value).unwrap();
        assert_eq!(resource.extra.get("retainOnDelete"), Some(&json!(true)));

        let back = serde_json::to_value(&resource).unwrap();
        assert_eq!(back["retainOnDelete"], json!(true));
    }

    #[test]
    fn test_rename_stack_rewrites_references() {
        let provider = resource("a", "default");
        let parent = resource("a", "parent");
        let mut child = resource("a", "child")
            .with_parent(parent.urn.clone())
            .with_dependency(parent.urn.clone());
        child.provider = Some(format!("{}::1234-abcd", provider.urn));
        child
            .property_dependencies
            .insert("vpc".to_string(), vec![parent.urn.clone()]);

        let mut snapshot = Snapshot::new(vec![provider, parent, child]);
        snapshot.rename_stack("b", None);

        let child = &snapshot.resources[2];
        assert_eq!(child.urn.stack(), Some("b"));
        assert_eq!(child.parent.as_ref().unwrap().stack(), Some("b"));
        assert_eq!(child.dependencies[0].stack(), Some("b"));
        assert_eq!(child.property_dependencies["vpc"][0].stack(), Some("b"));
        assert_eq!(
            child.provider.as_deref(),
            Some("urn:pulumi:b::proj::a:b:c::default::1234-abcd")
        );
    }

    #[test]
    fn test_untyped_deployment_versions() {
        let snapshot = Snapshot::new(vec![resource("dev", "one")]);
        let deployment = UntypedDeployment::from_snapshot(Some(&snapshot)).unwrap();
        assert_eq!(deployment.version, CURRENT_DEPLOYMENT_VERSION);
        assert_eq!(deployment.to_snapshot().unwrap(), snapshot);

        let old = UntypedDeployment {
            version: 1,
            deployment: deployment.deployment.clone(),
        };
        assert!(old.to_snapshot().is_ok());

        let future = UntypedDeployment {
            version: 4,
            deployment: deployment.deployment,
        };
        assert!(matches!(
            future.to_snapshot(),
            Err(CheckpointError::UnsupportedDeploymentVersion(4))
        ));
    }

    #[test]
    fn test_html_characters_not_escaped() {
        let snapshot = Snapshot::new(vec![
            resource("dev", "name").with_input("html", json!("<html@tags&value>")),
        ]);
        let bytes = Checkpoint::new("dev", Some(snapshot)).to_vec().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("<html@tags&value>"));
    }

    #[test]
    fn test_secrets_providers_metadata() {
        let snapshot = Snapshot::new(Vec::new()).with_secrets_manager(&Base64SecretsManager);
        let providers = snapshot.secrets_providers.unwrap();
        assert_eq!(providers.provider_type, "b64");
    }
}
