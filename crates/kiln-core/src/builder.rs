use crate::debian;
use crate::installer::{AptBackend, ConstraintPreservingInstaller, InstallBackend};
use crate::worker::Worker;
use crate::CoreError;
use kiln_graph::{Files, Run, State};
use kiln_runtime::{BuildEngine, ContextProvider, NoopSigner, RuntimeError, Signer};
use kiln_schema::Spec;
use tracing::{debug, info};

const OS_RELEASE: &str = "/etc/os-release";
/// Scratch mount collecting the built archives.
const OUT_DIR: &str = "/tmp/out";

/// Builds binary Debian packages from a spec on a worker.
pub struct PackageBuilder<'a> {
    engine: &'a dyn BuildEngine,
    contexts: &'a dyn ContextProvider,
    signer: &'a dyn Signer,
    backend: &'a dyn InstallBackend,
}

impl<'a> PackageBuilder<'a> {
    pub fn new(engine: &'a dyn BuildEngine, contexts: &'a dyn ContextProvider) -> Self {
        Self {
            engine,
            contexts,
            signer: &NoopSigner,
            backend: &AptBackend,
        }
    }

    pub fn with_signer(mut self, signer: &'a dyn Signer) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_install_backend(mut self, backend: &'a dyn InstallBackend) -> Self {
        self.backend = backend;
        self
    }

    /// `<ID><VERSION_ID>` of the worker, e.g. `ubuntu22.04`. Solves the worker.
    pub fn detect_release(&self, worker: &Worker) -> Result<String, CoreError> {
        let solved = self.engine.solve(&worker.state().marshal())?;
        let raw = match self.engine.read_file(&solved, OS_RELEASE) {
            Ok(raw) => raw,
            Err(RuntimeError::FileNotFound(path)) => {
                return Err(CoreError::Release(format!("{path} not found in worker")))
            }
            Err(e) => return Err(e.into()),
        };
        parse_release(&String::from_utf8_lossy(&raw))
    }

    /// The package archive state for `spec`: build dependencies installed
    /// without losing their constraints, the package built with the release
    /// suffix, then handed to the signer.
    pub fn build(&self, worker: &Worker, spec: &Spec, target: &str) -> Result<State, CoreError> {
        info!("building package {} for target {target}", spec.name);
        let release = self.detect_release(worker)?;
        debug!("worker release {release}");

        let installer = ConstraintPreservingInstaller::new(self, self.backend);
        let base = installer.install(worker, spec, target)?;
        let archive = self.build_archive(
            &base,
            spec,
            target,
            Some(&release),
            worker.distro().codename,
        )?;
        Ok(self.signer.maybe_sign(archive, spec, target)?)
    }

    /// Run `dpkg-buildpackage` for `spec` on `base` and return a state
    /// holding only the produced archives.
    pub(crate) fn build_archive(
        &self,
        base: &State,
        spec: &Spec,
        target: &str,
        release: Option<&str>,
        distribution: &str,
    ) -> Result<State, CoreError> {
        let work_dir = format!("/build/{}", spec.name);
        let version = debian::deb_version(spec, release);

        let mut files = Files::new()
            .mkdir("/debian/source", 0o755)
            .group(format!("Prepare {} sources", spec.name));
        for file in debian::debian_dir(spec, target, &version, distribution)? {
            files = files.mkfile(format!("/{}", file.path), file.mode, file.content);
        }
        for (name, source) in &spec.sources {
            if let Some(inline) = &source.inline {
                files = files.mkfile(
                    format!("/{name}"),
                    source.mode.unwrap_or(0o644),
                    inline.as_str(),
                );
            }
        }
        let sources = State::scratch().file(files);

        let mut run = Run::shell(format!(
            "set -e; dpkg-buildpackage -b -uc -us; mkdir -p {OUT_DIR}; mv /build/*.deb {OUT_DIR}/"
        ))
        .cwd(&work_dir)
        .mount(&work_dir, &sources)
        .mount(OUT_DIR, &State::scratch());
        for (name, source) in &spec.sources {
            let Some(context) = &source.context else {
                continue;
            };
            let state = self
                .contexts
                .get_context(context)?
                .ok_or_else(|| RuntimeError::Context {
                    name: context.clone(),
                    reason: format!("required by source '{name}' but not provided"),
                })?;
            run = run.mount_readonly(&format!("{work_dir}/{name}"), &state);
        }

        let exec = base.run(run.group(format!("Build {} package", spec.name)));
        Ok(exec.mount_output(OUT_DIR)?)
    }
}

/// Release identifier from os-release content.
pub fn parse_release(os_release: &str) -> Result<String, CoreError> {
    let field = |key: &str| {
        os_release.lines().find_map(|line| {
            line.split_once('=')
                .filter(|(k, _)| k.trim() == key)
                .map(|(_, v)| v.trim().trim_matches(['"', '\'']).to_owned())
        })
    };
    match (field("ID"), field("VERSION_ID")) {
        (Some(id), Some(version)) if !id.is_empty() && !version.is_empty() => {
            Ok(format!("{id}{version}"))
        }
        _ => Err(CoreError::Release(
            "os-release lacks ID or VERSION_ID".to_owned(),
        )),
    }
}
