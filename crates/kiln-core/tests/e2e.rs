//! End-to-end builds on the in-process engine.
//!
//! `foo` 1.0 build-depends on `libbar-dev (>= 2.0)`. The archive's newest
//! `libbar-dev` (3.0) is uninstallable, so the build only succeeds when the
//! constraint survives the dependency install and 2.5 is picked.

use kiln_core::{BuildConfig, CoreError, Pipeline};
use kiln_runtime::mock::deb::DebPackage;
use kiln_runtime::mock::{fixtures, MockEngine};
use kiln_runtime::{BuildEngine, NamedContexts};
use kiln_schema::parse_spec_str;
use kiln_graph::State;

const FOO: &str = r##"
name = "foo"
version = "1.0"
description = "Reports the libbar it was built against"
license = "MIT"
website = "https://example.com/foo"

[sources."foo.sh"]
inline = "echo foo 1.0\n"

[sources.extra]
context = "foo-extra"

[dependencies.build]
libbar-dev = ">= 2.0"

[build]
env = { PREFIX = "/usr" }
steps = [
    { command = "cp foo.sh foo" },
    { command = "cat /usr/include/bar.h >> foo" },
    { command = "cat extra/NOTICE >> foo" },
]

[artifacts.binaries.foo]

[image]
entrypoint = ["/usr/bin/foo"]
labels = { "org.opencontainers.image.title" = "foo" }

[image.post.symlinks."/usr/bin/foo"]
path = "/usr/local/bin/foo"

[[tests]]
name = "runs"
steps = [{ command = "sh /usr/bin/foo", stdout = { equals = "foo 1.0\n" } }]

[tests.files."/usr/bin/foo"]
contains = ["BAR_VERSION 25", "# notice"]
permissions = 0o755

[tests.files."/usr/local/bin/foo"]
contains = ["foo 1.0"]
"##;

fn extra_context() -> kiln_runtime::mock::fs::MockFs {
    let mut fs = kiln_runtime::mock::fs::MockFs::new();
    fs.write_file("/NOTICE", "# notice\n", 0o644);
    fs
}

fn engine() -> MockEngine {
    MockEngine::ubuntu()
        .with_archive(fixtures::pinning_archive())
        .with_context("foo-extra", extra_context())
}

fn contexts() -> NamedContexts {
    NamedContexts::new().with("foo-extra", State::context("foo-extra"))
}

#[test]
fn package_builds_against_pinned_library() {
    let engine = engine();
    let contexts = contexts();
    let spec = parse_spec_str(FOO).unwrap();
    let artifact = Pipeline::new(&engine, &engine)
        .with_contexts(&contexts)
        .build_package(&spec, "jammy")
        .unwrap();

    assert_eq!(artifact.archives, ["foo_1.0-1~ubuntu22.04_amd64.deb"]);
    let raw = engine
        .read_file(&artifact.solved, "/foo_1.0-1~ubuntu22.04_amd64.deb")
        .unwrap();
    let pkg = DebPackage::from_archive(&raw).unwrap();
    assert_eq!(pkg.version, "1.0-1~ubuntu22.04");
    assert!(pkg.files["/usr/bin/foo"].data.contains("BAR_VERSION 25"));
    // build dependencies are not runtime dependencies
    assert!(pkg.depends.is_empty());
}

#[test]
fn container_is_assembled_and_tested() {
    let engine = engine();
    let contexts = contexts();
    let spec = parse_spec_str(FOO).unwrap();
    let artifact = Pipeline::new(&engine, &engine)
        .with_contexts(&contexts)
        .build_container(&spec, "jammy")
        .unwrap();

    let link = engine.stat(&artifact.solved, "/usr/local/bin/foo").unwrap().unwrap();
    assert!(link.is_symlink);
    assert_eq!(
        artifact.image.config.labels["org.opencontainers.image.title"],
        "foo"
    );
    assert_eq!(
        artifact.image.config.entrypoint.as_deref(),
        Some(&["/usr/bin/foo".to_owned()][..])
    );
    assert_eq!(engine.exec_requests(), 1);
}

#[test]
fn rebuilding_reuses_every_step() {
    let engine = engine();
    let contexts = contexts();
    let spec = parse_spec_str(FOO).unwrap();
    let pipeline = Pipeline::new(&engine, &engine).with_contexts(&contexts);

    let first = pipeline.build_container(&spec, "jammy").unwrap();
    let executions = engine.executions();
    let second = pipeline.build_container(&spec, "jammy").unwrap();
    assert_eq!(first.solved, second.solved);
    assert_eq!(engine.executions(), executions);
}

#[test]
fn build_config_drives_implicit_packages() {
    let engine = engine();
    let contexts = contexts();
    let spec = parse_spec_str(FOO).unwrap();
    let options = BuildConfig::parse("[build]\ndistro = \"jammy\"\nimplicit = { base = true }\n")
        .unwrap()
        .into_options()
        .unwrap();
    let artifact = Pipeline::new(&engine, &engine)
        .with_contexts(&contexts)
        .with_options(options)
        .build_container(&spec, "jammy")
        .unwrap();
    assert!(engine
        .exists(&artifact.solved, "/usr/lib/usrmerge/convert-usrmerge")
        .unwrap());
}

#[test]
fn missing_source_context_stops_the_build() {
    let engine = engine();
    let spec = parse_spec_str(FOO).unwrap();
    let err = Pipeline::new(&engine, &engine)
        .build_package(&spec, "jammy")
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Runtime(kiln_runtime::RuntimeError::Context { ref name, .. }) if name == "foo-extra"
    ));
}

#[test]
fn unsatisfiable_constraint_fails_the_build() {
    let spec = parse_spec_str(&FOO.replace(">= 2.0", ">= 3.0")).unwrap();
    let engine = engine();
    let contexts = contexts();
    let err = Pipeline::new(&engine, &engine)
        .with_contexts(&contexts)
        .build_package(&spec, "jammy")
        .unwrap_err();
    let CoreError::Runtime(kiln_runtime::RuntimeError::ExecFailed { output, .. }) = &err else {
        panic!("unexpected error {err}");
    };
    assert!(output.contains("no solution keeps foo-deps installed"));
}
