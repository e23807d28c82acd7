//! Operation payloads carried by graph nodes.
//!
//! Everything in this module is part of a node's digest, so every map is
//! ordered and every field serializes deterministically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    /// Root filesystem of a container image, pulled by reference.
    Image { reference: String },
    /// A named build context supplied by the caller.
    Context { name: String },
    Exec(ExecOp),
    File(FileOp),
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Image { .. } => "image",
            Op::Context { .. } => "context",
            Op::Exec(_) => "exec",
            Op::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    #[default]
    Sandbox,
    /// Needed by tools that manipulate mounts or devices, such as mmdebstrap.
    Insecure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSharing {
    #[default]
    Shared,
    Private,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountKind {
    /// Contents come from the node input at `input`.
    Bind { input: usize },
    /// Persistent cache shared across builds, keyed by `id`.
    Cache { id: String, sharing: CacheSharing },
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub dest: String,
    pub kind: MountKind,
    #[serde(default)]
    pub readonly: bool,
    /// Path inside the mounted input to expose at `dest`. A file selector
    /// mounts a single file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Output index of this mount, for writable bind mounts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub security: Security,
    /// Commands the engine runs, in the same mounts, when `args` fails. Their
    /// output is attached to the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub actions: Vec<FileAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    Mkfile {
        path: String,
        mode: u32,
        data: Vec<u8>,
    },
    Mkdir {
        path: String,
        mode: u32,
        parents: bool,
    },
}

impl FileAction {
    pub fn path(&self) -> &str {
        match self {
            FileAction::Mkfile { path, .. } | FileAction::Mkdir { path, .. } => path,
        }
    }
}
