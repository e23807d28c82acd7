//! Build options: target distribution, platform and the implicit-package
//! policy. Options come from CLI flags or from the `[build]` table of a
//! TOML config file.

use crate::CoreError;
use kiln_runtime::{resolve_distro, DistroConfig, Platform, JAMMY};
use kiln_schema::Spec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const BASE_PACKAGES: &[&str] = &["base-files", "base-passwd", "usrmerge"];
const SYSTEMD_PACKAGES: &[&str] = &["init-system-helpers", "bash", "systemctl", "dash"];

/// Packages installed into a produced rootfs alongside the built package.
///
/// Debian images expect some packages that nothing depends on explicitly.
/// Both groups are off unless requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImplicitPackages {
    #[serde(default)]
    pub base: bool,
    /// Only applies to specs that declare systemd units.
    #[serde(default)]
    pub systemd: bool,
}

impl ImplicitPackages {
    pub fn packages(&self, spec: &Spec) -> Vec<&'static str> {
        let mut packages = Vec::new();
        if self.base {
            packages.extend_from_slice(BASE_PACKAGES);
        }
        if self.systemd && spec.artifacts.has_systemd_units() {
            packages.extend_from_slice(SYSTEMD_PACKAGES);
        }
        packages
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Distribution used when the target key does not name one.
    pub distro: &'static DistroConfig,
    /// `None` means the engine's platform.
    pub platform: Option<Platform>,
    pub implicit: ImplicitPackages,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            distro: &JAMMY,
            platform: None,
            implicit: ImplicitPackages::default(),
        }
    }
}

impl BuildOptions {
    /// The distribution a target builds for: the one its key names, else the
    /// configured default.
    pub fn distro_for(&self, target: &str) -> &'static DistroConfig {
        resolve_distro(target).unwrap_or(self.distro)
    }
}

/// The `[build]` table of a kiln config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub implicit: ImplicitPackages,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    build: BuildConfig,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(file.build)
    }

    pub fn into_options(self) -> Result<BuildOptions, CoreError> {
        let mut options = BuildOptions::default();
        if let Some(distro) = &self.distro {
            options.distro = resolve_distro(distro)?;
        }
        if let Some(platform) = &self.platform {
            options.platform = Some(platform.parse()?);
        }
        options.implicit = self.implicit;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::FOCAL;
    use kiln_schema::parse_spec_str;

    const WITH_UNITS: &str = r#"
name = "foo"
version = "1.0"
[artifacts.systemd.units."foo.service"]
enable = true
"#;

    #[test]
    fn implicit_packages_default_off() {
        let spec = parse_spec_str(WITH_UNITS).unwrap();
        assert!(ImplicitPackages::default().packages(&spec).is_empty());
    }

    #[test]
    fn systemd_packages_need_units() {
        let policy = ImplicitPackages {
            base: true,
            systemd: true,
        };
        let plain = parse_spec_str("name = \"foo\"\nversion = \"1.0\"\n").unwrap();
        assert_eq!(policy.packages(&plain), BASE_PACKAGES);

        let units = parse_spec_str(WITH_UNITS).unwrap();
        let packages = policy.packages(&units);
        assert_eq!(packages.len(), BASE_PACKAGES.len() + SYSTEMD_PACKAGES.len());
        assert!(packages.contains(&"systemctl"));
    }

    #[test]
    fn target_key_selects_distro() {
        let options = BuildOptions::default();
        assert_eq!(options.distro_for("focal"), &FOCAL);
        assert_eq!(options.distro_for("custom"), &JAMMY);
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln-config.toml");
        fs::write(
            &path,
            r#"
[build]
distro = "focal"
platform = "linux/arm64"
implicit = { base = true }
"#,
        )
        .unwrap();

        let options = BuildConfig::load(&path).unwrap().into_options().unwrap();
        assert_eq!(options.distro, &FOCAL);
        assert_eq!(options.platform.unwrap().architecture, "arm64");
        assert!(options.implicit.base);
        assert!(!options.implicit.systemd);
    }

    #[test]
    fn missing_build_table_gives_defaults() {
        let options = BuildConfig::parse("").unwrap().into_options().unwrap();
        assert_eq!(options.distro, &JAMMY);
        assert!(options.platform.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            BuildConfig::parse("[build]\nflavour = \"x\"\n"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn unknown_distro_is_a_runtime_error() {
        let config = BuildConfig {
            distro: Some("bookworm".to_owned()),
            ..BuildConfig::default()
        };
        assert!(matches!(config.into_options(), Err(CoreError::Runtime(_))));
    }
}
