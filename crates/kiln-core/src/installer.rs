//! Constraint-preserving installation of build dependencies.
//!
//! Asking apt for `libbar-dev (>= 2.0)` makes it pick the newest candidate
//! and give up when that candidate is broken, even though an older one would
//! satisfy the constraint. Instead the build dependencies are expressed as
//! the runtime dependencies of a synthetic `<name>-deps` package. It is
//! force-installed with dpkg, leaving the system broken but with the
//! constraints registered, and a solver fix-broken pass that may not remove
//! the meta package then has to find versions that satisfy them.

use crate::builder::PackageBuilder;
use crate::worker::{with_apt_cache, Worker};
use crate::CoreError;
use kiln_graph::{Run, State};
use kiln_schema::{Artifacts, BuildSection, PackageDependencies, Spec};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Where the meta-package archive is mounted during the install.
pub const DEPS_DIR: &str = "/tmp/kiln/internal/build/deps";
pub const META_PACKAGER: &str = "kiln build dependencies <kiln@localhost>";

/// The two commands of the install. The first must register every archive
/// in a directory without resolving dependencies, the second must repair
/// the system without uninstalling the named package.
pub trait InstallBackend: Send + Sync {
    fn force_install(&self, archive_dir: &str) -> String;

    fn reconcile(&self, keep: &str) -> String;

    fn script(&self, archive_dir: &str, keep: &str) -> String {
        format!(
            "set -ex; {}; {}",
            self.force_install(archive_dir),
            self.reconcile(keep)
        )
    }
}

/// dpkg + aptitude, for Debian and Ubuntu workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AptBackend;

impl InstallBackend for AptBackend {
    fn force_install(&self, archive_dir: &str) -> String {
        format!("dpkg -i --force-depends {archive_dir}/*.deb")
    }

    fn reconcile(&self, keep: &str) -> String {
        format!(
            "apt update; aptitude install -y -f -o \"Aptitude::ProblemResolver::Hints::=reject {keep} :UNINST\""
        )
    }
}

/// The synthetic package whose runtime dependencies are `spec`'s build
/// dependencies for `target`.
pub fn meta_package(spec: &Spec, target: &str) -> Spec {
    Spec {
        name: format!("{}-deps", spec.name),
        description: format!("Build dependencies for {}", spec.name),
        version: spec.version.clone(),
        revision: spec.revision.clone(),
        packager: META_PACKAGER.to_owned(),
        license: spec.license.clone(),
        website: String::new(),
        sources: BTreeMap::new(),
        build: BuildSection::default(),
        artifacts: Artifacts::default(),
        dependencies: Some(PackageDependencies {
            runtime: spec.build_deps(target).clone(),
            ..PackageDependencies::default()
        }),
        targets: BTreeMap::new(),
        image: None,
        tests: Vec::new(),
    }
}

pub struct ConstraintPreservingInstaller<'a> {
    builder: &'a PackageBuilder<'a>,
    backend: &'a dyn InstallBackend,
}

impl<'a> ConstraintPreservingInstaller<'a> {
    pub fn new(builder: &'a PackageBuilder<'a>, backend: &'a dyn InstallBackend) -> Self {
        Self { builder, backend }
    }

    /// The worker with `spec`'s build dependencies installed. A spec without
    /// build dependencies gets the worker back unchanged.
    pub fn install(&self, worker: &Worker, spec: &Spec, target: &str) -> Result<State, CoreError> {
        let deps = spec.build_deps(target);
        if deps.is_empty() {
            debug!("{} has no build dependencies for {target}", spec.name);
            return Ok(worker.state().clone());
        }
        info!(
            "installing {} build dependencies of {}",
            deps.len(),
            spec.name
        );

        let meta = meta_package(spec, target);
        let archive = self
            .builder
            .build_archive(worker.state(), &meta, target, None, worker.distro().codename)
            .map_err(|e| CoreError::BuildDeps {
                package: spec.name.clone(),
                source: Box::new(e),
            })?;

        let run = Run::shell(self.backend.script(DEPS_DIR, &meta.name))
            .env("DEBIAN_FRONTEND", "noninteractive")
            .mount_readonly(DEPS_DIR, &archive);
        let run = with_apt_cache(run, worker.distro())
            .group(format!("Install build dependencies of {}", spec.name));
        Ok(worker.state().run(run).root())
    }
}
