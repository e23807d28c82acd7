//! Build orchestration for kiln.
//!
//! This crate turns a validated [`Spec`](kiln_schema::Spec) into build graphs:
//! it resolves a worker environment, installs build dependencies without
//! letting the solver override version constraints, builds the binary
//! package, assembles a root filesystem from it and runs the declared tests
//! against the result. All execution is delegated to a
//! [`BuildEngine`](kiln_runtime::BuildEngine); nothing here spawns processes.

pub mod builder;
pub mod debian;
pub mod harness;
pub mod installer;
pub mod options;
pub mod pipeline;
pub mod rootfs;
pub mod worker;

pub use builder::PackageBuilder;
pub use harness::{TestFailure, TestHarness};
pub use installer::{AptBackend, ConstraintPreservingInstaller, InstallBackend};
pub use options::{BuildConfig, BuildOptions, ImplicitPackages};
pub use pipeline::{ContainerArtifact, PackageArtifact, Pipeline};
pub use rootfs::{Assembly, InstallOutcome, RootfsAssembler};
pub use worker::{Worker, WorkerResolver, WorkerSource, WorkerTier};

use kiln_graph::GraphError;
use kiln_runtime::RuntimeError;
use kiln_schema::SpecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("spec error: {0}")]
    Spec(#[from] SpecError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("worker resolution failed: {0}")]
    Resolution(String),
    #[error("cannot detect the worker release: {0}")]
    Release(String),
    #[error("building build dependencies of '{package}' failed: {source}")]
    BuildDeps {
        package: String,
        #[source]
        source: Box<CoreError>,
    },
    #[error("package installation failed\n{diagnostics}")]
    Install { diagnostics: String },
    #[error("{} test(s) failed:\n{}", .0.len(), harness::format_failures(.0))]
    Tests(Vec<TestFailure>),
    #[error("invalid build config: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True when the error comes from the spec itself rather than the build.
    pub fn is_spec_error(&self) -> bool {
        match self {
            CoreError::Spec(_) => true,
            CoreError::BuildDeps { source, .. } => source.is_spec_error(),
            _ => false,
        }
    }
}
