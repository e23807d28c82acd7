//! Root filesystem assembly: the built package installed into the output
//! base image, followed by the spec's post-install symlinks.

use crate::debian::shell_quote;
use crate::options::ImplicitPackages;
use crate::worker::{with_apt_cache, Worker};
use crate::CoreError;
use kiln_graph::{Files, Run, State};
use kiln_runtime::{BuildEngine, RuntimeError, SolvedRef};
use kiln_schema::{ContentDigest, PostInstall, Spec};
use tracing::debug;

/// A local apt repository some workers carry for testing.
pub const FIXTURE_REPO: &str = "/opt/testrepo";
pub const FIXTURE_SOURCE_LIST: &str = "/etc/apt/sources.list.d/test-kiln-local-repo.list";

const PKG_DIR: &str = "/tmp/pkg";
const DPKG_DEBUG_PATH: &str = "/etc/dpkg/dpkg.cfg.d/99-kiln-debug";
const DPKG_EXCLUDES_PATH: &str = "/etc/dpkg/dpkg.cfg.d/excludes";
const ROOTFS_MOUNT: &str = "/tmp/rootfs";

const DIAGNOSTICS: &[&str] = &["ls -lh /etc/apt/sources.list.d", "ls -lh /opt/testrepo", "mount"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(SolvedRef),
    /// The package install step failed. Carries its output and the output of
    /// the diagnostic commands.
    Failed { diagnostics: String },
}

/// The assembled rootfs graph and the digest of its install step.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub state: State,
    install: ContentDigest,
}

impl Assembly {
    pub fn install_digest(&self) -> &ContentDigest {
        &self.install
    }

    /// Solve the rootfs. Only a failure of the install step becomes
    /// [`InstallOutcome::Failed`]; every other error propagates.
    pub fn solve(&self, engine: &dyn BuildEngine) -> Result<InstallOutcome, CoreError> {
        match engine.solve(&self.state.marshal()) {
            Ok(solved) => Ok(InstallOutcome::Installed(solved)),
            Err(RuntimeError::ExecFailed {
                digest,
                output,
                diagnostics,
                status,
                ..
            }) if digest == self.install.as_str() => {
                let mut report = format!("install exited with status {status}\n{output}");
                if let Some(diagnostics) = diagnostics {
                    report.push_str("\ndiagnostics:\n");
                    report.push_str(&diagnostics);
                }
                Ok(InstallOutcome::Failed { diagnostics: report })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RootfsAssembler {
    implicit: ImplicitPackages,
}

impl RootfsAssembler {
    pub fn new(implicit: ImplicitPackages) -> Self {
        Self { implicit }
    }

    /// True when the solved worker carries both the fixture repository and
    /// its source list.
    pub fn detect_fixture(engine: &dyn BuildEngine, worker: &Worker) -> Result<bool, CoreError> {
        let solved = engine.solve(&worker.state().marshal())?;
        Ok(engine.exists(&solved, FIXTURE_REPO)? && engine.exists(&solved, FIXTURE_SOURCE_LIST)?)
    }

    pub fn assemble(
        &self,
        worker: &Worker,
        spec: &Spec,
        archive: &State,
        target: &str,
        include_fixture: bool,
    ) -> Result<Assembly, CoreError> {
        let base = spec
            .base_output_image(target)
            .unwrap_or(worker.distro().default_output_image);
        debug!("output base image {base}");

        let mut packages = vec![format!("{PKG_DIR}/*.deb")];
        packages.extend(self.implicit.packages(spec).into_iter().map(str::to_owned));

        let debug_file = State::scratch().file(Files::new().mkfile("/debug", 0o644, "debug=2\n"));
        let empty_file = State::scratch().file(Files::new().mkfile("/tmp", 0o644, ""));

        let mut run = Run::shell(format!(
            "set -e; apt update; apt install -y {}",
            packages.join(" ")
        ))
        .env("DEBIAN_FRONTEND", "noninteractive")
        .mount_readonly(PKG_DIR, archive)
        .mount_path(DPKG_DEBUG_PATH, &debug_file, "/debug", true)
        .mount_path(DPKG_EXCLUDES_PATH, &empty_file, "/tmp", true);
        if include_fixture {
            run = run
                .mount_path(FIXTURE_REPO, worker.state(), FIXTURE_REPO, true)
                .mount_path(FIXTURE_SOURCE_LIST, worker.state(), FIXTURE_SOURCE_LIST, true);
        }
        for command in DIAGNOSTICS {
            run = run.diagnostic(*command);
        }
        let run = with_apt_cache(run, worker.distro()).group(format!("Install {} package", spec.name));

        let install = State::image(base).run(run);
        let install_digest = install.node().digest().clone();
        let state = apply_symlinks(worker, install.root(), spec.image_post(target))?;
        Ok(Assembly {
            state,
            install: install_digest,
        })
    }
}

/// Create the post-install symlinks in `rootfs` from the worker. Without any
/// symlinks `rootfs` is returned as is.
pub fn apply_symlinks(
    worker: &Worker,
    rootfs: State,
    post: Option<&PostInstall>,
) -> Result<State, CoreError> {
    let Some(post) = post.filter(|p| !p.symlinks.is_empty()) else {
        return Ok(rootfs);
    };

    let mut script = String::from("set -ex");
    for (existing, link) in &post.symlinks {
        let dest = format!("{ROOTFS_MOUNT}{}", link.path);
        let parent = dest.rsplit_once('/').map_or(ROOTFS_MOUNT, |(dir, _)| dir);
        script.push_str(&format!(
            "; mkdir -p {}; ln -sf {} {}",
            shell_quote(parent),
            shell_quote(existing),
            shell_quote(&dest)
        ));
    }
    let exec = worker.state().run(
        Run::shell(script)
            .mount(ROOTFS_MOUNT, &rootfs)
            .group("Install post symlinks"),
    );
    Ok(exec.mount_output(ROOTFS_MOUNT)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerTier;
    use kiln_graph::{MountKind, Op};
    use kiln_runtime::mock::deb::DebPackage;
    use kiln_runtime::mock::{fixtures, MockEngine};
    use kiln_runtime::JAMMY;
    use kiln_schema::parse_spec_str;

    fn archive_of(pkg: &DebPackage) -> State {
        State::scratch().file(Files::new().mkfile(
            format!("/{}", pkg.archive_name()),
            0o644,
            pkg.to_archive(),
        ))
    }

    fn foo_archive() -> State {
        archive_of(
            &DebPackage::new("foo", "1.0-1~ubuntu22.04")
                .arch("amd64")
                .with_file("/usr/bin/foo", "#!/bin/sh\necho foo 1.0\n", 0o755)
                .with_file("/usr/share/doc/foo/changelog.Debian", "foo (1.0-1)", 0o644),
        )
    }

    fn foo() -> Spec {
        parse_spec_str("name = \"foo\"\nversion = \"1.0\"\n").unwrap()
    }

    fn image_worker() -> Worker {
        Worker::new(State::image(JAMMY.image_ref), &JAMMY, WorkerTier::Bootstrap)
    }

    fn fixture_worker_fs() -> kiln_runtime::mock::fs::MockFs {
        let mut fs = fixtures::ubuntu_image("jammy", "22.04");
        let lib = DebPackage::new("fixture-lib", "0.1").with_file("/usr/lib/fixture.so", "", 0o644);
        fs.write_file(
            &format!("{FIXTURE_REPO}/{}", lib.archive_name()),
            lib.to_archive(),
            0o644,
        );
        fs.write_file(
            FIXTURE_SOURCE_LIST,
            format!("deb [trusted=yes] file:{FIXTURE_REPO} ./\n"),
            0o644,
        );
        fs
    }

    #[test]
    fn install_exec_shape() {
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &foo(), &foo_archive(), "jammy", false)
            .unwrap();
        let def = assembly.state.marshal();
        let (node, exec) = def.execs().next().unwrap();
        assert_eq!(&node.digest, assembly.install_digest());
        assert_eq!(exec.args[2], "set -e; apt update; apt install -y /tmp/pkg/*.deb");
        assert_eq!(exec.env["DEBIAN_FRONTEND"], "noninteractive");
        assert_eq!(exec.diagnostics, DIAGNOSTICS);

        let pkg = exec.mounts.iter().find(|m| m.dest == PKG_DIR).unwrap();
        assert!(pkg.readonly);
        let debug = exec.mounts.iter().find(|m| m.dest == DPKG_DEBUG_PATH).unwrap();
        assert_eq!(debug.selector.as_deref(), Some("/debug"));
        assert!(exec.mounts.iter().any(|m| m.dest == DPKG_EXCLUDES_PATH));
        assert!(exec
            .mounts
            .iter()
            .any(|m| matches!(&m.kind, MountKind::Cache { id, .. } if id == "jammy-var-lib-apt")));

        assert_eq!(
            def.nodes[0].op,
            Op::Image {
                reference: JAMMY.default_output_image.to_owned()
            }
        );
    }

    #[test]
    fn spec_base_image_overrides_default() {
        let spec = parse_spec_str(
            "name = \"foo\"\nversion = \"1.0\"\n[image]\nbase = \"example.com/base:1\"\n",
        )
        .unwrap();
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &spec, &foo_archive(), "jammy", false)
            .unwrap();
        let def = assembly.state.marshal();
        assert!(def.nodes.iter().any(|n| n.op
            == Op::Image {
                reference: "example.com/base:1".to_owned()
            }));
    }

    #[test]
    fn implicit_packages_follow_policy() {
        let assembler = RootfsAssembler::new(ImplicitPackages {
            base: true,
            systemd: true,
        });
        let assembly = assembler
            .assemble(&image_worker(), &foo(), &foo_archive(), "jammy", false)
            .unwrap();
        let def = assembly.state.marshal();
        let (_, exec) = def.execs().next().unwrap();
        assert!(exec.args[2].ends_with("/tmp/pkg/*.deb base-files base-passwd usrmerge"));
    }

    #[test]
    fn no_fixture_mounts_without_flag() {
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &foo(), &foo_archive(), "jammy", false)
            .unwrap();
        let def = assembly.state.marshal();
        let (_, exec) = def.execs().next().unwrap();
        assert!(!exec
            .mounts
            .iter()
            .any(|m| m.dest == FIXTURE_REPO || m.dest == FIXTURE_SOURCE_LIST));
    }

    #[test]
    fn fixture_detection_needs_both_paths() {
        let engine = MockEngine::ubuntu()
            .with_context("with-fixture", fixture_worker_fs())
            .with_context("plain", fixtures::ubuntu_image("jammy", "22.04"));
        let with_fixture = Worker::new(State::context("with-fixture"), &JAMMY, WorkerTier::WorkerContext);
        let plain = Worker::new(State::context("plain"), &JAMMY, WorkerTier::WorkerContext);
        assert!(RootfsAssembler::detect_fixture(&engine, &with_fixture).unwrap());
        assert!(!RootfsAssembler::detect_fixture(&engine, &plain).unwrap());

        let mut repo_only = fixture_worker_fs();
        repo_only.remove(FIXTURE_SOURCE_LIST);
        let engine = engine.with_context("repo-only", repo_only);
        let repo_only = Worker::new(State::context("repo-only"), &JAMMY, WorkerTier::WorkerContext);
        assert!(!RootfsAssembler::detect_fixture(&engine, &repo_only).unwrap());
    }

    #[test]
    fn installs_package_and_keeps_docs() {
        let engine = MockEngine::ubuntu();
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &foo(), &foo_archive(), "jammy", false)
            .unwrap();
        let InstallOutcome::Installed(solved) = assembly.solve(&engine).unwrap() else {
            panic!("install failed");
        };
        assert!(engine.exists(&solved, "/usr/bin/foo").unwrap());
        assert!(engine.exists(&solved, "/usr/share/doc/foo/changelog.Debian").unwrap());
        // the excludes and debug files are only masked during the install
        let excludes = engine.read_file(&solved, DPKG_EXCLUDES_PATH).unwrap();
        assert!(String::from_utf8_lossy(&excludes).contains("path-exclude"));
        assert!(!engine.exists(&solved, DPKG_DEBUG_PATH).unwrap());
    }

    #[test]
    fn fixture_repository_satisfies_runtime_deps() {
        let engine = MockEngine::ubuntu().with_context("with-fixture", fixture_worker_fs());
        let worker = Worker::new(State::context("with-fixture"), &JAMMY, WorkerTier::WorkerContext);
        let archive = archive_of(
            &DebPackage::new("foo", "1.0-1")
                .depends_on("fixture-lib")
                .with_file("/usr/bin/foo", "", 0o755),
        );

        let without = RootfsAssembler::default()
            .assemble(&worker, &foo(), &archive, "jammy", false)
            .unwrap();
        assert!(matches!(
            without.solve(&engine).unwrap(),
            InstallOutcome::Failed { .. }
        ));

        let with = RootfsAssembler::default()
            .assemble(&worker, &foo(), &archive, "jammy", true)
            .unwrap();
        let InstallOutcome::Installed(solved) = with.solve(&engine).unwrap() else {
            panic!("install with fixture failed");
        };
        assert!(engine.exists(&solved, "/usr/lib/fixture.so").unwrap());
        // fixture mounts do not leak into the result
        assert!(!engine.exists(&solved, FIXTURE_SOURCE_LIST).unwrap());
    }

    #[test]
    fn failed_install_carries_diagnostics() {
        let engine = MockEngine::ubuntu();
        let archive = archive_of(&DebPackage::new("foo", "1.0-1").depends_on("libmissing (>= 1.0)"));
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &foo(), &archive, "jammy", false)
            .unwrap();
        let InstallOutcome::Failed { diagnostics } = assembly.solve(&engine).unwrap() else {
            panic!("install should fail");
        };
        assert!(diagnostics.contains("libmissing"));
        assert!(diagnostics.contains("$ ls -lh /etc/apt/sources.list.d"));
        assert!(diagnostics.contains("$ mount"));
        assert!(diagnostics.contains("/tmp/pkg"));
    }

    #[test]
    fn failure_outside_install_propagates() {
        let engine = MockEngine::ubuntu();
        let spec = parse_spec_str(
            r#"
name = "foo"
version = "1.0"
[image.post.symlinks."/usr/bin/foo"]
path = "/bin/foo"
"#,
        )
        .unwrap();
        // the symlink step runs on a worker image the engine does not know
        let worker = Worker::new(State::image("missing/worker"), &JAMMY, WorkerTier::Bootstrap);
        let assembly = RootfsAssembler::default()
            .assemble(&worker, &spec, &foo_archive(), "jammy", false)
            .unwrap();
        assert!(matches!(
            assembly.solve(&engine),
            Err(CoreError::Runtime(RuntimeError::ImageNotFound(_)))
        ));
    }

    #[test]
    fn assembly_is_deterministic() {
        let engine = MockEngine::ubuntu();
        let assemble = || {
            RootfsAssembler::default()
                .assemble(&image_worker(), &foo(), &foo_archive(), "jammy", false)
                .unwrap()
        };
        let (a, b) = (assemble(), assemble());
        assert_eq!(a.state.marshal().digest(), b.state.marshal().digest());
        assert_eq!(a.install_digest(), b.install_digest());

        let (InstallOutcome::Installed(x), InstallOutcome::Installed(y)) =
            (a.solve(&engine).unwrap(), b.solve(&engine).unwrap())
        else {
            panic!("install failed");
        };
        assert_eq!(x, y);
        assert_eq!(engine.executions(), 1);
    }

    #[test]
    fn empty_symlinks_is_identity() {
        let rootfs = State::image(JAMMY.image_ref);
        let post = PostInstall::default();
        assert_eq!(apply_symlinks(&image_worker(), rootfs.clone(), Some(&post)).unwrap(), rootfs);
        assert_eq!(apply_symlinks(&image_worker(), rootfs.clone(), None).unwrap(), rootfs);
    }

    #[test]
    fn symlinks_are_created_in_rootfs() {
        let engine = MockEngine::ubuntu();
        let spec = parse_spec_str(
            r#"
name = "foo"
version = "1.0"
[image.post.symlinks."/usr/bin/foo"]
path = "/usr/local/sbin/foo"
"#,
        )
        .unwrap();
        let assembly = RootfsAssembler::default()
            .assemble(&image_worker(), &spec, &foo_archive(), "jammy", false)
            .unwrap();
        let def = assembly.state.marshal();
        let last = def.root_node().unwrap();
        assert_eq!(last.group.as_deref(), Some("Install post symlinks"));

        let InstallOutcome::Installed(solved) = assembly.solve(&engine).unwrap() else {
            panic!("install failed");
        };
        let stat = engine.stat(&solved, "/usr/local/sbin/foo").unwrap().unwrap();
        assert!(stat.is_symlink);
        assert!(engine.exists(&solved, "/usr/bin/foo").unwrap());
    }
}
