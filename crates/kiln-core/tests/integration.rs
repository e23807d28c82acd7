use kiln_core::installer::{ConstraintPreservingInstaller, InstallBackend, DEPS_DIR};
use kiln_core::rootfs::{apply_symlinks, FIXTURE_REPO, FIXTURE_SOURCE_LIST};
use kiln_core::worker::ResolveRequest;
use kiln_core::{
    AptBackend, Assembly, CoreError, InstallOutcome, PackageBuilder, RootfsAssembler, TestHarness, Worker,
    WorkerResolver,
};
use kiln_graph::{Files, State};
use kiln_runtime::mock::deb::{DebPackage, StatusDb};
use kiln_runtime::mock::{fixtures, MockEngine};
use kiln_runtime::{BuildEngine, NoContexts, Platform, RuntimeError, JAMMY};
use kiln_schema::{parse_spec_file, parse_spec_str, PostInstall, Spec};
use std::fs;

const FOO: &str = r#"
name = "foo"
version = "1.0"
description = "Links against libbar"

[dependencies.build]
libbar-dev = ">= 2.0"
"#;

fn pinning_engine() -> MockEngine {
    MockEngine::ubuntu().with_archive(fixtures::pinning_archive())
}

fn bootstrap_worker(engine: &MockEngine) -> Worker {
    let platform = Platform::default();
    WorkerResolver::new()
        .resolve(&ResolveRequest {
            distro: &JAMMY,
            contexts: &NoContexts,
            images: engine,
            platform: &platform,
        })
        .unwrap()
}

fn foo_archive() -> State {
    let pkg = DebPackage::new("foo", "1.0-1~ubuntu22.04")
        .arch("amd64")
        .with_file("/usr/bin/foo", "echo foo 1.0\n", 0o755);
    State::scratch().file(Files::new().mkfile(
        format!("/{}", pkg.archive_name()),
        0o644,
        pkg.to_archive(),
    ))
}

/// Destinations of the install exec's mounts that expose the fixture repo.
fn fixture_mounts(assembly: &Assembly) -> Vec<String> {
    let definition = assembly.state.marshal();
    let (_, exec) = definition
        .execs()
        .find(|(node, _)| &node.digest == assembly.install_digest())
        .unwrap();
    exec.mounts
        .iter()
        .filter(|m| m.dest == FIXTURE_REPO || m.dest == FIXTURE_SOURCE_LIST)
        .map(|m| m.dest.clone())
        .collect()
}

/// Force-installs the meta package with apt alone, letting the solver pick
/// the newest candidate.
struct NaiveBackend;

impl InstallBackend for NaiveBackend {
    fn force_install(&self, archive_dir: &str) -> String {
        format!("apt install -y {archive_dir}/*.deb")
    }

    fn reconcile(&self, _keep: &str) -> String {
        "true".to_owned()
    }

    fn script(&self, archive_dir: &str, _keep: &str) -> String {
        format!("set -ex; apt update; {}", self.force_install(archive_dir))
    }
}

// Spec files are read from disk
#[test]
fn spec_file_is_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.toml");
    fs::write(&path, FOO).unwrap();
    let spec = parse_spec_file(&path).unwrap();
    assert_eq!(spec.name, "foo");
    assert!(spec.build_deps("jammy").contains_key("libbar-dev"));
}

// Empty build dependencies leave the worker untouched
#[test]
fn empty_build_deps_is_identity() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec = parse_spec_str("name = \"foo\"\nversion = \"1.0\"\n").unwrap();
    let builder = PackageBuilder::new(&engine, &NoContexts);

    let state = ConstraintPreservingInstaller::new(&builder, &AptBackend)
        .install(&worker, &spec, "jammy")
        .unwrap();
    assert_eq!(&state, worker.state());
    assert_eq!(state.marshal().digest(), worker.state().marshal().digest());
    assert_eq!(engine.executions(), 0);
}

// The pinned constraint survives a broken newest candidate
#[test]
fn two_phase_install_keeps_satisfiable_version() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec = parse_spec_str(FOO).unwrap();
    let builder = PackageBuilder::new(&engine, &NoContexts);

    let state = ConstraintPreservingInstaller::new(&builder, &AptBackend)
        .install(&worker, &spec, "jammy")
        .unwrap();
    let solved = engine.solve(&state.marshal()).unwrap();

    let fs = engine.filesystem(&solved).unwrap();
    let db = StatusDb::load(&fs, "/");
    assert_eq!(db.get("libbar-dev").unwrap().version, "2.5");
    assert_eq!(db.get("libbaz").unwrap().version, "4.0");
    assert!(db.get("foo-deps").is_some());
    assert!(db.broken("amd64").is_empty());

    let header = engine.read_file(&solved, "/usr/include/bar.h").unwrap();
    assert_eq!(String::from_utf8_lossy(&header), "#define BAR_VERSION 25\n");
    // the meta archive is only mounted for the install
    assert!(!engine.exists(&solved, DEPS_DIR).unwrap());
}

#[test]
fn single_phase_install_fails_on_broken_newest() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec = parse_spec_str(FOO).unwrap();
    let builder = PackageBuilder::new(&engine, &NoContexts);

    let state = ConstraintPreservingInstaller::new(&builder, &NaiveBackend)
        .install(&worker, &spec, "jammy")
        .unwrap();
    let err = engine.solve(&state.marshal()).unwrap_err();
    let RuntimeError::ExecFailed { output, status, .. } = &err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(*status, 100);
    assert!(output.contains("libbar-dev : Depends: libbaz (>= 5.0) but 4.0 is to be installed"));
}

#[test]
fn unsatisfiable_constraint_fails_the_fix_pass() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec = parse_spec_str(&FOO.replace(">= 2.0", ">= 3.0")).unwrap();
    let builder = PackageBuilder::new(&engine, &NoContexts);

    let state = ConstraintPreservingInstaller::new(&builder, &AptBackend)
        .install(&worker, &spec, "jammy")
        .unwrap();
    assert!(matches!(
        engine.solve(&state.marshal()),
        Err(RuntimeError::ExecFailed { .. })
    ));
}

// Assembly is a pure function of its inputs
#[test]
fn assembly_is_deterministic() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec = parse_spec_str(FOO).unwrap();
    let assembler = RootfsAssembler::default();

    let first = assembler.assemble(&worker, &spec, &foo_archive(), "jammy", false).unwrap();
    let second = assembler.assemble(&worker, &spec, &foo_archive(), "jammy", false).unwrap();
    assert_eq!(first.state.marshal().to_json().unwrap(), second.state.marshal().to_json().unwrap());

    let (InstallOutcome::Installed(a), InstallOutcome::Installed(b)) =
        (first.solve(&engine).unwrap(), second.solve(&engine).unwrap())
    else {
        panic!("install failed");
    };
    assert_eq!(a.content, b.content);
}

#[test]
fn worker_without_fixture_gets_no_fixture_mounts() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    assert!(!RootfsAssembler::detect_fixture(&engine, &worker).unwrap());

    let spec = parse_spec_str(FOO).unwrap();
    let assembly = RootfsAssembler::default()
        .assemble(&worker, &spec, &foo_archive(), "jammy", false)
        .unwrap();
    assert!(fixture_mounts(&assembly).is_empty());

    let with_fixture = RootfsAssembler::default()
        .assemble(&worker, &spec, &foo_archive(), "jammy", true)
        .unwrap();
    assert_eq!(fixture_mounts(&with_fixture), [FIXTURE_REPO, FIXTURE_SOURCE_LIST]);
}

#[test]
fn empty_symlinks_is_identity() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let rootfs = State::image(JAMMY.default_output_image);
    let state = apply_symlinks(&worker, rootfs.clone(), Some(&PostInstall::default())).unwrap();
    assert_eq!(state.marshal().digest(), rootfs.marshal().digest());
}

#[test]
fn harness_without_deps_or_tests_is_a_no_op() {
    let engine = pinning_engine();
    let worker = bootstrap_worker(&engine);
    let spec: Spec = parse_spec_str(FOO).unwrap();
    let rootfs = State::image(JAMMY.default_output_image);
    let harness = TestHarness::new(&engine);

    let state = harness.with_test_deps(&worker, &spec, "jammy", rootfs.clone()).unwrap();
    assert_eq!(state, rootfs);
    harness.run(&worker, &spec, "jammy", &rootfs).unwrap();
    assert_eq!(engine.executions(), 0);
    assert_eq!(engine.exec_requests(), 0);
}

#[test]
fn build_dependency_failure_names_the_package() {
    let engine = pinning_engine();
    let worker = Worker::new(
        State::image(JAMMY.image_ref),
        &JAMMY,
        kiln_core::WorkerTier::Bootstrap,
    );
    let spec = parse_spec_str(
        "name = \"foo\"\nversion = \"1.0\"\n[dependencies.build]\nlibbar-dev = \">= 1 0\"\n",
    )
    .unwrap();
    let builder = PackageBuilder::new(&engine, &NoContexts);
    let err = ConstraintPreservingInstaller::new(&builder, &AptBackend)
        .install(&worker, &spec, "jammy")
        .unwrap_err();
    assert!(matches!(err, CoreError::BuildDeps { ref package, .. } if package == "foo"));
    assert!(err.is_spec_error());
}
