//! Engine - Trait abstracting the deployment engine
//!
//! The engine computes resource diffs and performs the actual create, update
//! and delete calls. The state backend only hands it a target, waits for the
//! result, and persists what comes back.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::deployment::Snapshot;
use crate::update::{ResourceChanges, UpdateKind};

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error reported by the engine for a failed operation
#[derive(Debug)]
pub struct EngineError {
    pub message: String,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Progress event emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Free-form diagnostic output
    Diagnostic { message: String },
    /// A resource operation started
    ResourceStarted { urn: String, op: String },
    /// A resource operation finished
    ResourceFinished { urn: String, op: String },
    /// The operation summary
    Summary { changes: ResourceChanges },
}

/// Consumer of engine progress events (display, logs, callers)
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Resource to import into a stack
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpec {
    pub resource_type: String,
    pub name: String,
    pub id: String,
}

/// Engine options passed through unchanged from the caller
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Maximum number of concurrent resource operations (0 = unlimited)
    pub parallel: usize,
    /// Restrict the operation to these resource URNs
    pub targets: Vec<String>,
    /// Resources to import (import operations only)
    pub imports: Vec<ImportSpec>,
}

/// Everything the engine needs to operate on one stack
pub struct UpdateContext {
    /// Fully qualified stack name
    pub stack: String,
    /// Current project name, if known
    pub project: Option<String>,
    /// Stack configuration
    pub config: BTreeMap<String, Value>,
    /// Snapshot the operation starts from; `None` for a never-deployed stack
    pub snapshot: Option<Snapshot>,
    /// Where progress events go, if anywhere
    pub events: Option<Arc<dyn EventSink>>,
}

impl UpdateContext {
    pub fn publish(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Result of running the engine
#[derive(Debug)]
pub struct EngineOutput {
    /// Snapshot to persist; `None` leaves the stored state untouched
    pub snapshot: Option<Snapshot>,
    pub changes: ResourceChanges,
    /// Engine-specific plan produced by previews
    pub plan: Option<Value>,
    pub result: Result<(), EngineError>,
}

impl EngineOutput {
    pub fn succeeded(snapshot: Option<Snapshot>, changes: ResourceChanges) -> Self {
        Self {
            snapshot,
            changes,
            plan: None,
            result: Ok(()),
        }
    }

    pub fn failed(snapshot: Option<Snapshot>, changes: ResourceChanges, error: EngineError) -> Self {
        Self {
            snapshot,
            changes,
            plan: None,
            result: Err(error),
        }
    }
}

/// Main Engine trait
///
/// Cancellation belongs to the engine: dropping the returned future must
/// abandon the operation. The backend guarantees the stack lock is released
/// however the future completes or is dropped.
pub trait Engine: Send + Sync {
    fn run<'a>(
        &'a self,
        kind: UpdateKind,
        context: UpdateContext,
        options: &'a UpdateOptions,
        dry_run: bool,
    ) -> BoxFuture<'a, EngineOutput>;
}
