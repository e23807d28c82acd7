use crate::image_config::Platform;
use crate::RuntimeError;
use kiln_graph::{Definition, State};
use kiln_schema::{ContentDigest, Spec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Handle to a solved definition, valid for the engine that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolvedRef {
    /// Digest of the definition root.
    pub definition: ContentDigest,
    /// Digest of the resulting filesystem content.
    pub content: ContentDigest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            args: vec!["/bin/sh".to_owned(), "-c".to_owned(), script.into()],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Permission bits only.
    pub mode: u32,
}

/// Executes graph definitions.
///
/// Implementations must execute each distinct node digest at most once and
/// may evaluate independent subgraphs concurrently.
pub trait BuildEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Platform that exec nodes run on.
    fn platform(&self) -> Platform {
        Platform::default()
    }

    fn solve(&self, definition: &Definition) -> Result<SolvedRef, RuntimeError>;

    fn read_file(&self, solved: &SolvedRef, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// `None` when the path does not exist.
    fn stat(&self, solved: &SolvedRef, path: &str) -> Result<Option<FileStat>, RuntimeError>;

    fn exists(&self, solved: &SolvedRef, path: &str) -> Result<bool, RuntimeError> {
        Ok(self.stat(solved, path)?.is_some())
    }

    /// Names of the entries directly under `path`, sorted.
    fn read_dir(&self, solved: &SolvedRef, path: &str) -> Result<Vec<String>, RuntimeError>;

    /// Run a command in a container started from `solved`. A non-zero exit
    /// is reported in the output, not as an error.
    fn exec(&self, solved: &SolvedRef, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;
}

/// Source of named build contexts supplied by the caller.
pub trait ContextProvider: Send + Sync {
    /// `Ok(None)` when no context with that name was supplied.
    fn get_context(&self, name: &str) -> Result<Option<State>, RuntimeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoContexts;

impl ContextProvider for NoContexts {
    fn get_context(&self, _name: &str) -> Result<Option<State>, RuntimeError> {
        Ok(None)
    }
}

/// Contexts registered up front by name.
#[derive(Debug, Clone, Default)]
pub struct NamedContexts {
    contexts: BTreeMap<String, State>,
}

impl NamedContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, state: State) -> Self {
        self.contexts.insert(name.into(), state);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }
}

impl ContextProvider for NamedContexts {
    fn get_context(&self, name: &str) -> Result<Option<State>, RuntimeError> {
        Ok(self.contexts.get(name).cloned())
    }
}

pub trait ImageMetaResolver: Send + Sync {
    /// Raw OCI image config JSON for `reference` on `platform`.
    fn resolve_image_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<Vec<u8>, RuntimeError>;
}

pub trait Signer: Send + Sync {
    /// Return `archive` unchanged, or a state holding signed replacements.
    fn maybe_sign(&self, archive: State, spec: &Spec, target: &str) -> Result<State, RuntimeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn maybe_sign(&self, archive: State, _spec: &Spec, _target: &str) -> Result<State, RuntimeError> {
        Ok(archive)
    }
}
