//! Runtime collaborators for kiln.
//!
//! The orchestration core never executes anything itself. It hands graph
//! definitions to a [`BuildEngine`], looks up named build contexts through a
//! [`ContextProvider`], fetches base image configuration through an
//! [`ImageMetaResolver`] and passes built archives to a [`Signer`]. This crate
//! defines those seams, the table of supported distributions, the OCI image
//! config model, and [`mock::MockEngine`], an in-process engine that
//! interprets definitions against an in-memory filesystem with a simulated
//! apt/dpkg toolchain.

pub mod backend;
pub mod image;
pub mod image_config;
pub mod mock;

pub use backend::{
    BuildEngine, ContextProvider, ExecOutput, ExecRequest, FileStat, ImageMetaResolver,
    NamedContexts, NoContexts, NoopSigner, Signer, SolvedRef,
};
pub use image::{resolve_distro, DistroConfig, FOCAL, JAMMY, SUPPORTED_DISTROS};
pub use image_config::{ContainerConfig, ImageConfig, Platform};

use kiln_graph::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("build context '{name}' could not be resolved: {reason}")]
    Context { name: String, reason: String },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("invalid image config for '{reference}': {reason}")]
    ImageConfig { reference: String, reason: String },
    #[error("unknown distribution '{0}'")]
    UnknownDistro(String),
    #[error("invalid platform '{0}': expected os/arch[/variant]")]
    InvalidPlatform(String),
    #[error("process '{command}' did not complete successfully: exit code {status}\n{output}")]
    ExecFailed {
        /// Digest of the failing exec node.
        digest: String,
        command: String,
        status: i32,
        output: String,
        /// Output of the node's diagnostic commands, run after the failure.
        diagnostics: Option<String>,
    },
    #[error("file not found in result: {0}")]
    FileNotFound(String),
    #[error("unknown solved reference: {0}")]
    UnknownRef(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("engine error: {0}")]
    Engine(String),
}
