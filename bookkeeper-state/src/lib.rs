//! Bookkeeper State Management
//!
//! This crate stores stack state in a blob store (a local directory or an S3
//! bucket) with no server in between. Concurrent access is coordinated with
//! advisory lock markers kept next to the state.
//!
//! # Overview
//!
//! The state management system consists of:
//!
//! - **BlobStore**: A trait for the storage the state lives in (local, S3)
//! - **LayoutMode**: Where stacks live inside the store (legacy or per-project)
//! - **LockManager**: Advisory per-stack locks for concurrent access control
//! - **StackStore**: Checkpoints, backups and update history of stacks
//! - **FileStateBackend**: The stack lifecycle built from the above
//!
//! # Example
//!
//! ```ignore
//! use bookkeeper_state::{FileStateBackend, UpdateOperation};
//!
//! let backend = FileStateBackend::login("file://~/.bookkeeper-state").await?;
//!
//! let stack = backend.parse_stack_reference("organization/infra/prod")?;
//! backend.create_stack(&stack).await?;
//!
//! // Runs the engine under the stack lock and records history
//! let outcome = backend
//!     .update(&stack, &engine, &UpdateOperation::default(), false)
//!     .await?;
//! ```

pub mod backend;
pub mod blob;
pub mod encoding;
pub mod filestate;
pub mod layout;
pub mod lock;
pub mod persist;
pub mod reference;

// Re-export main types for convenience
pub use backend::{BackendError, BackendOptions, BackendResult};
pub use blob::{BlobError, BlobStore, LocalBlobStore, S3BlobStore, open_bucket};
pub use filestate::{ApplyOutcome, FileStateBackend, Stack, StackSummary, UpdateOperation};
pub use layout::LayoutMode;
pub use lock::{LockGuard, LockInfo, LockManager};
pub use persist::StackStore;
pub use reference::StackReference;
