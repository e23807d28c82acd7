//! Spec model for kiln.
//!
//! This crate owns everything that can be known about a build before any
//! graph is constructed: TOML parsing of a [`Spec`], validation, per-target
//! resolution of dependencies, images and tests, Debian version ordering and
//! dependency constraints, and the content identity of a spec.

pub mod checks;
pub mod identity;
pub mod resolve;
pub mod spec;
pub mod types;
pub mod validate;
pub mod version;

pub use checks::{FileCheck, OutputCheck, TestSpec, TestStep};
pub use identity::{compute_spec_id, SpecIdentity};
pub use spec::{
    parse_spec_file, parse_spec_str, ArtifactConfig, Artifacts, BuildSection, BuildStep,
    ImageSpec, PackageConstraints, PackageDependencies, PostInstall, SourceSpec, Spec, SpecError,
    SymlinkTarget, SystemdConfig, SystemdUnit, Target,
};
pub use types::{ContentDigest, ShortId, SpecId};
pub use validate::validate_package_name;
pub use version::{DebVersion, Relation, VersionConstraint, VersionError};
