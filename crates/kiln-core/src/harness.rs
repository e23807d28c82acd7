//! Runs the spec's tests against a built rootfs.

use crate::worker::{with_apt_cache, Worker};
use crate::CoreError;
use kiln_graph::{Run, Security, State};
use kiln_runtime::{BuildEngine, ExecRequest, SolvedRef};
use kiln_schema::{FileCheck, Spec, TestSpec, TestStep};
use std::fmt::Write as _;
use tracing::{debug, info};

const ROOTFS_MOUNT: &str = "/tmp/rootfs";

/// One failing test and everything that went wrong in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    pub test: String,
    pub problems: Vec<String>,
}

pub fn format_failures(failures: &[TestFailure]) -> String {
    let mut out = String::new();
    for failure in failures {
        let _ = writeln!(out, "  {}:", failure.test);
        for problem in &failure.problems {
            let _ = writeln!(out, "    - {problem}");
        }
    }
    out
}

pub struct TestHarness<'a> {
    engine: &'a dyn BuildEngine,
}

impl<'a> TestHarness<'a> {
    pub fn new(engine: &'a dyn BuildEngine) -> Self {
        Self { engine }
    }

    /// `rootfs` with the target's test dependencies installed.
    ///
    /// The stock output image has no usable apt state once assembled, so the
    /// dependencies are bootstrapped into it from the worker with mmdebstrap.
    /// A custom base image is assumed to carry apt and installs them itself.
    pub fn with_test_deps(
        &self,
        worker: &Worker,
        spec: &Spec,
        target: &str,
        rootfs: State,
    ) -> Result<State, CoreError> {
        let deps = spec.test_deps(target);
        if deps.is_empty() {
            return Ok(rootfs);
        }
        let distro = worker.distro();

        if spec.base_output_image(target).is_some() {
            let run = Run::shell(format!(
                "apt-get update && apt-get install -y --no-install-recommends {}",
                deps.join(" ")
            ))
            .env("DEBIAN_FRONTEND", "noninteractive");
            let run = with_apt_cache(run, distro).group(format!("Install test dependencies of {}", spec.name));
            return Ok(rootfs.run(run).root());
        }

        let tooling = with_apt_cache(
            Run::shell("set -ex; apt update; apt install -y apt-utils mmdebstrap"),
            distro,
        )
        .group("Prepare test dependency worker");
        let apt_worker = worker.state().run(tooling).root();

        let script = format!(
            "set -ex; apt-get update; mmdebstrap --variant=essential --mode=chrootless \
             --skip=check/empty --include={} {} {ROOTFS_MOUNT} /etc/apt/sources.list; \
             rm -rf {ROOTFS_MOUNT}/var/lib/apt; rm -rf {ROOTFS_MOUNT}/var/cache/apt",
            deps.join(","),
            distro.codename
        );
        let exec = apt_worker.run(
            Run::shell(script)
                .env("DEBIAN_FRONTEND", "noninteractive")
                .mount(ROOTFS_MOUNT, &rootfs)
                .security(Security::Insecure)
                .group(format!("Install test dependencies of {}", spec.name)),
        );
        Ok(exec.mount_output(ROOTFS_MOUNT)?)
    }

    /// Run every test declared for `target` against `rootfs`. A target
    /// without tests executes nothing, test dependencies included.
    pub fn run(
        &self,
        worker: &Worker,
        spec: &Spec,
        target: &str,
        rootfs: &State,
    ) -> Result<(), CoreError> {
        let tests = spec.tests_for(target);
        if tests.is_empty() {
            debug!("no tests for {} on {target}", spec.name);
            return Ok(());
        }
        info!("running {} test(s) for {}", tests.len(), spec.name);

        let state = self.with_test_deps(worker, spec, target, rootfs.clone())?;
        let solved = self.engine.solve(&state.marshal())?;

        let mut failures = Vec::new();
        for test in tests {
            let problems = self.run_test(&solved, test)?;
            if problems.is_empty() {
                debug!("test {} passed", test.name);
            } else {
                failures.push(TestFailure {
                    test: test.name.clone(),
                    problems,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Tests(failures))
        }
    }

    fn run_test(&self, solved: &SolvedRef, test: &TestSpec) -> Result<Vec<String>, CoreError> {
        let mut problems = Vec::new();
        for step in &test.steps {
            problems.extend(self.run_step(solved, test, step)?);
        }
        for (path, check) in &test.files {
            problems.extend(self.check_file(solved, path, check)?);
        }
        Ok(problems)
    }

    fn run_step(
        &self,
        solved: &SolvedRef,
        test: &TestSpec,
        step: &TestStep,
    ) -> Result<Vec<String>, CoreError> {
        let mut request = ExecRequest::shell(&step.command);
        request.env = test.env.clone();
        request.env.extend(step.env.clone());
        let output = self.engine.exec(solved, &request)?;

        let mut problems = Vec::new();
        if !output.success() {
            problems.push(format!(
                "`{}` exited with status {}: {}",
                step.command,
                output.status,
                output.stderr.trim_end()
            ));
        }
        let streams = [("stdout", &step.stdout, &output.stdout), ("stderr", &step.stderr, &output.stderr)];
        for (stream, check, actual) in streams {
            if let Some(check) = check {
                problems.extend(
                    check
                        .check(actual)
                        .into_iter()
                        .map(|p| format!("`{}` {stream}: {p}", step.command)),
                );
            }
        }
        Ok(problems)
    }

    fn check_file(
        &self,
        solved: &SolvedRef,
        path: &str,
        check: &FileCheck,
    ) -> Result<Vec<String>, CoreError> {
        let stat = self.engine.stat(solved, path)?;
        if check.not_exist {
            return Ok(stat
                .map(|_| vec![format!("{path}: expected not to exist")])
                .unwrap_or_default());
        }
        let Some(stat) = stat else {
            return Ok(vec![format!("{path}: does not exist")]);
        };

        let mut problems = Vec::new();
        if check.is_dir && !stat.is_dir {
            problems.push(format!("{path}: expected a directory"));
        }
        if let Some(expected) = check.permissions {
            if stat.mode != expected {
                problems.push(format!(
                    "{path}: expected permissions {expected:o}, got {:o}",
                    stat.mode
                ));
            }
        }
        if check.checks_content() {
            if stat.is_dir {
                problems.push(format!("{path}: is a directory, cannot check content"));
            } else {
                let content = self.engine.read_file(solved, path)?;
                problems.extend(
                    check
                        .content
                        .check(&String::from_utf8_lossy(&content))
                        .into_iter()
                        .map(|p| format!("{path}: {p}")),
                );
            }
        }
        Ok(problems)
    }
}
