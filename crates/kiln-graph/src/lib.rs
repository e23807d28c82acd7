//! Build graph for kiln.
//!
//! Builds are described as an immutable DAG of operations: image and context
//! sources, command executions with mounts, and file writes. A [`State`] is a
//! handle to one node output. Marshalling a state yields a [`Definition`]
//! that an engine executes, deduplicating identical nodes by digest.

pub mod definition;
pub mod op;
pub mod state;

pub use definition::{Definition, NodeDef};
pub use op::{CacheSharing, ExecOp, FileAction, FileOp, Mount, MountKind, Op, Security};
pub use state::{ExecState, Files, Node, OutputRef, Run, State};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("definition serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("exec has no mount at '{0}'")]
    NoSuchMount(String),
    #[error("mount at '{0}' is read-only or a cache and has no output")]
    MountWithoutOutput(String),
    #[error("node {node} references unknown input {input}")]
    UnknownInput { node: String, input: String },
    #[error("node digest mismatch: recorded {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("definition root {0} is not among its nodes")]
    UnknownRoot(String),
}
