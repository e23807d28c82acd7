use crate::checks::TestSpec;
use crate::version::{VersionConstraint, VersionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse spec: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("{0} must not start or end with whitespace")]
    SurroundingWhitespace(&'static str),
    #[error("invalid package name '{0}': expected lowercase alphanumerics, '.', '+' or '-'")]
    InvalidPackageName(String),
    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: VersionError,
    },
    #[error("invalid constraint for '{package}': {source}")]
    InvalidConstraint {
        package: String,
        #[source]
        source: VersionError,
    },
    #[error("symlink path must be absolute: '{0}'")]
    RelativeSymlink(String),
    #[error("source '{0}' must declare exactly one of 'inline' or 'context'")]
    InvalidSource(String),
    #[error("duplicate test name '{0}'")]
    DuplicateTest(String),
    #[error("target key must not be empty")]
    EmptyTargetKey,
}

/// Declarative description of a package to build.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Spec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub packager: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSpec>,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub dependencies: Option<PackageDependencies>,
    #[serde(default)]
    pub targets: BTreeMap<String, Target>,
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

fn default_revision() -> String {
    "1".to_owned()
}

/// Build-time and runtime dependency declarations.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDependencies {
    #[serde(default)]
    pub build: BTreeMap<String, PackageConstraints>,
    #[serde(default)]
    pub runtime: BTreeMap<String, PackageConstraints>,
    #[serde(default)]
    pub test: Vec<String>,
}

/// Version and architecture constraints attached to a dependency name.
///
/// Accepts `name = ">= 2.0"`, `name = [">= 2.0", "<< 3.0"]`, or the full table
/// form `name = { version = [...], arch = [...] }`. An empty table means any version.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "ConstraintsRepr")]
pub struct PackageConstraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub version: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arch: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConstraintsRepr {
    Single(String),
    List(Vec<String>),
    Full {
        #[serde(default)]
        version: Vec<String>,
        #[serde(default)]
        arch: Vec<String>,
    },
}

impl From<ConstraintsRepr> for PackageConstraints {
    fn from(repr: ConstraintsRepr) -> Self {
        match repr {
            ConstraintsRepr::Single(v) => Self {
                version: vec![v],
                arch: Vec::new(),
            },
            ConstraintsRepr::List(version) => Self {
                version,
                arch: Vec::new(),
            },
            ConstraintsRepr::Full { version, arch } => Self { version, arch },
        }
    }
}

impl PackageConstraints {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn versions(versions: &[&str]) -> Self {
        Self {
            version: versions.iter().map(|v| (*v).to_owned()).collect(),
            arch: Vec::new(),
        }
    }

    /// Parse every version expression.
    pub fn parsed(&self) -> Result<Vec<VersionConstraint>, VersionError> {
        self.version.iter().map(|v| v.parse()).collect()
    }
}

/// A named input to the package build.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// File content written under the source name.
    #[serde(default)]
    pub inline: Option<String>,
    /// Name of a build context provided by the caller.
    #[serde(default)]
    pub context: Option<String>,
    /// Octal file mode for inline sources.
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<BuildStep>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildStep {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Artifacts {
    /// Build output path (relative to the source root) → install options.
    #[serde(default)]
    pub binaries: BTreeMap<String, ArtifactConfig>,
    #[serde(default)]
    pub systemd: Option<SystemdConfig>,
}

impl Artifacts {
    pub fn has_systemd_units(&self) -> bool {
        self.systemd.as_ref().is_some_and(|s| !s.units.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactConfig {
    /// Subdirectory under the install prefix (`/usr/bin`).
    #[serde(default)]
    pub subpath: String,
    /// Rename the artifact on install.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SystemdConfig {
    #[serde(default)]
    pub units: BTreeMap<String, SystemdUnit>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SystemdUnit {
    #[serde(default)]
    pub enable: bool,
}

/// A named build variant that may override dependencies, image and tests.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Target {
    #[serde(default)]
    pub dependencies: Option<PackageDependencies>,
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

/// Image configuration declared by the spec or a target.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Base image reference for the produced container.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub post: Option<PostInstall>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PostInstall {
    /// Existing path → link to create.
    #[serde(default)]
    pub symlinks: BTreeMap<String, SymlinkTarget>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SymlinkTarget {
    pub path: String,
}

pub fn parse_spec_str(input: &str) -> Result<Spec, SpecError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_spec_file(path: impl AsRef<Path>) -> Result<Spec, SpecError> {
    let content = fs::read_to_string(path)?;
    parse_spec_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let input = r#"
name = "foo"
version = "1.0"
revision = "2"
packager = "Kiln Maintainers"
description = "The foo tool"

[sources.main]
context = "src"

[build]
env = { CGO_ENABLED = "0" }
steps = [{ command = "make" }]

[artifacts.binaries."bin/foo"]
subpath = ""

[artifacts.systemd.units."foo.service"]
enable = true

[dependencies]
test = ["curl"]

[dependencies.build]
libbar-dev = ">= 2.0"
golang = { version = [">= 1.21", "<< 1.23"], arch = ["amd64"] }
make = {}

[dependencies.runtime]
libbar2 = [">= 2.0"]

[image]
entrypoint = ["/usr/bin/foo"]
env = { FOO = "1" }

[image.post.symlinks."/usr/bin/foo"]
path = "/bin/foo"

[targets.jammy.image]
base = "example.com/ubuntu:jammy"

[[tests]]
name = "version"
steps = [{ command = "foo --version", stdout = { contains = ["1.0"] } }]
"#;
        let spec = parse_spec_str(input).expect("should parse");
        assert_eq!(spec.name, "foo");
        assert_eq!(spec.revision, "2");
        let deps = spec.dependencies.as_ref().unwrap();
        assert_eq!(deps.build["libbar-dev"].version, vec![">= 2.0"]);
        assert_eq!(deps.build["golang"].arch, vec!["amd64"]);
        assert!(deps.build["make"].version.is_empty());
        assert_eq!(deps.runtime["libbar2"].version, vec![">= 2.0"]);
        assert_eq!(deps.test, vec!["curl"]);
        assert!(spec.artifacts.has_systemd_units());
        assert_eq!(spec.tests.len(), 1);
        assert_eq!(
            spec.targets["jammy"].image.as_ref().unwrap().base.as_deref(),
            Some("example.com/ubuntu:jammy")
        );
    }

    #[test]
    fn parses_minimal_spec_with_defaults() {
        let spec = parse_spec_str("name = \"foo\"\nversion = \"1.0\"\n").expect("should parse");
        assert_eq!(spec.revision, "1");
        assert!(spec.dependencies.is_none());
        assert!(spec.targets.is_empty());
        assert!(!spec.artifacts.has_systemd_units());
    }

    #[test]
    fn empty_systemd_section_has_no_units() {
        let spec = parse_spec_str(
            r#"
name = "foo"
version = "1.0"
[artifacts.systemd]
"#,
        )
        .unwrap();
        assert!(spec.artifacts.systemd.is_some());
        assert!(!spec.artifacts.has_systemd_units());
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
name = "foo"
version = "1.0"
unknown_field = true
"#;
        assert!(parse_spec_str(input).is_err());
    }

    #[test]
    fn rejects_missing_version() {
        assert!(parse_spec_str("name = \"foo\"\n").is_err());
    }

    #[test]
    fn parses_spec_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        fs::write(&path, "name = \"foo\"\nversion = \"1.0\"\n").unwrap();
        let spec = parse_spec_file(&path).unwrap();
        assert_eq!(spec.name, "foo");
    }

    #[test]
    fn missing_spec_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_spec_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, SpecError::Io(_)));
    }

    #[test]
    fn constraints_parse_to_relations() {
        let c = PackageConstraints::versions(&[">= 2.0", "<< 3.0"]);
        let parsed = c.parsed().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].to_string(), "<< 3.0");
    }
}
