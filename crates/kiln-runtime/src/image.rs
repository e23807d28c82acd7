//! Supported target distributions and their fixed image references.

use crate::RuntimeError;

/// debhelper compatibility level requested by generated packaging.
pub const DEBHELPER_COMPAT: &str = "11";

/// Per-distribution constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistroConfig {
    /// Default target key, also the suite name passed to bootstrap tools.
    pub codename: &'static str,
    /// Canonical base image, also the "default distro image" context name.
    pub image_ref: &'static str,
    /// Prefix for the apt cache mount ids.
    pub apt_cache_prefix: &'static str,
    /// Named worker context.
    pub worker_context: &'static str,
    /// Base for produced images when the spec does not choose one.
    pub default_output_image: &'static str,
    /// Toolchain installed on a worker bootstrapped from `image_ref`.
    builder_packages: &'static [&'static str],
}

const UBUNTU_BUILDER_PACKAGES: &[&str] = &[
    "aptitude",
    "dpkg-dev",
    "devscripts",
    "equivs",
    "fakeroot",
    "dh-make",
    "build-essential",
    "dh-apparmor",
    "dh-exec",
];

pub static JAMMY: DistroConfig = DistroConfig {
    codename: "jammy",
    image_ref: "mcr.microsoft.com/mirror/docker/library/ubuntu:jammy",
    apt_cache_prefix: "jammy",
    worker_context: "kiln-jammy-worker",
    default_output_image: "mcr.microsoft.com/mirror/docker/library/ubuntu:jammy",
    builder_packages: UBUNTU_BUILDER_PACKAGES,
};

pub static FOCAL: DistroConfig = DistroConfig {
    codename: "focal",
    image_ref: "mcr.microsoft.com/mirror/docker/library/ubuntu:focal",
    apt_cache_prefix: "focal",
    worker_context: "kiln-focal-worker",
    default_output_image: "mcr.microsoft.com/mirror/docker/library/ubuntu:focal",
    builder_packages: UBUNTU_BUILDER_PACKAGES,
};

pub static SUPPORTED_DISTROS: &[&DistroConfig] = &[&JAMMY, &FOCAL];

impl DistroConfig {
    /// Builder toolchain as apt install arguments, including the pinned
    /// debhelper compatibility package.
    pub fn builder_packages(&self) -> Vec<String> {
        self.builder_packages
            .iter()
            .map(|p| (*p).to_owned())
            .chain(std::iter::once(format!("debhelper-compat={DEBHELPER_COMPAT}")))
            .collect()
    }

    pub fn apt_cache_id(&self) -> String {
        format!("{}-var-cache-apt", self.apt_cache_prefix)
    }

    pub fn apt_lib_id(&self) -> String {
        format!("{}-var-lib-apt", self.apt_cache_prefix)
    }
}

pub fn resolve_distro(name: &str) -> Result<&'static DistroConfig, RuntimeError> {
    match name.trim().to_lowercase().as_str() {
        "jammy" | "ubuntu/jammy" | "ubuntu/22.04" | "ubuntu22.04" => Ok(&JAMMY),
        "focal" | "ubuntu/focal" | "ubuntu/20.04" | "ubuntu20.04" => Ok(&FOCAL),
        other => Err(RuntimeError::UnknownDistro(format!(
            "{other}. Supported: jammy, ubuntu/22.04, focal, ubuntu/20.04"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_aliases() {
        assert_eq!(resolve_distro("jammy").unwrap(), &JAMMY);
        assert_eq!(resolve_distro("Ubuntu/20.04").unwrap(), &FOCAL);
        assert!(matches!(
            resolve_distro("bookworm"),
            Err(RuntimeError::UnknownDistro(_))
        ));
    }

    #[test]
    fn focal_constants() {
        assert_eq!(FOCAL.worker_context, "kiln-focal-worker");
        assert_eq!(FOCAL.image_ref, FOCAL.default_output_image);
    }

    #[test]
    fn builder_packages_pin_debhelper_compat() {
        let pkgs = JAMMY.builder_packages();
        assert_eq!(pkgs.first().map(String::as_str), Some("aptitude"));
        assert_eq!(pkgs.last().map(String::as_str), Some("debhelper-compat=11"));
        assert!(pkgs.iter().any(|p| p == "equivs"));
    }

    #[test]
    fn cache_ids_are_scoped_by_prefix() {
        assert_eq!(JAMMY.apt_cache_id(), "jammy-var-cache-apt");
        assert_eq!(FOCAL.apt_lib_id(), "focal-var-lib-apt");
    }
}
