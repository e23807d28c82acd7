pub mod check;
pub mod completions;
pub mod graph;
pub mod plan;
pub mod targets;

use clap::Args;
use kiln_core::rootfs::RootfsAssembler;
use kiln_core::{BuildConfig, BuildOptions, CoreError, ImplicitPackages, Pipeline, Worker};
use kiln_graph::{Definition, State};
use kiln_runtime::mock::fs::MockFs;
use kiln_runtime::mock::MockEngine;
use kiln_runtime::{resolve_distro, NamedContexts, RuntimeError};
use kiln_schema::{parse_spec_file, Spec, SpecError};
use std::path::{Path, PathBuf};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_SPEC_ERROR: u8 = 2;

/// A failed command: what to print and the exit code to leave with.
#[derive(Debug)]
pub struct CommandError {
    pub message: String,
    pub code: u8,
}

impl CommandError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: EXIT_FAILURE,
        }
    }
}

impl From<SpecError> for CommandError {
    fn from(e: SpecError) -> Self {
        Self {
            message: format!("spec error: {e}"),
            code: EXIT_SPEC_ERROR,
        }
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        Self {
            code: if e.is_spec_error() {
                EXIT_SPEC_ERROR
            } else {
                EXIT_FAILURE
            },
            message: e.to_string(),
        }
    }
}

impl From<RuntimeError> for CommandError {
    fn from(e: RuntimeError) -> Self {
        CoreError::from(e).into()
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CommandError::failure(format!("JSON serialization failed: {e}")))
}

/// Parse and validate the spec at `path`.
pub fn load_spec(path: &Path) -> Result<Spec, CommandError> {
    let spec = parse_spec_file(path)?;
    spec.validate()?;
    Ok(spec)
}

/// Options shared by the commands that construct build graphs.
#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// Target to build. A distro codename selects that distro.
    #[arg(short, long, default_value = "jammy")]
    pub target: String,
    /// Config file with a [build] table.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Distro for targets that do not name one (overrides the config file).
    #[arg(long)]
    pub distro: Option<String>,
    /// Build platform, e.g. linux/arm64 (overrides the config file).
    #[arg(long)]
    pub platform: Option<String>,
    /// Install base-files, base-passwd and usrmerge into the rootfs.
    #[arg(long, default_value_t = false)]
    pub implicit_base: bool,
    /// Install systemd helper packages for specs with systemd units.
    #[arg(long, default_value_t = false)]
    pub implicit_systemd: bool,
    /// Named build context, as NAME or NAME=DIR. Repeatable. DIR supplies
    /// the context's files; without it the context is only referenced.
    #[arg(long = "context", value_name = "NAME[=DIR]")]
    pub contexts: Vec<String>,
    /// Include the rootfs assembly, not only the package build.
    #[arg(long, default_value_t = false)]
    pub container: bool,
}

impl BuildArgs {
    pub fn options(&self) -> Result<BuildOptions, CommandError> {
        let config = match &self.config {
            Some(path) => BuildConfig::load(path)?,
            None => BuildConfig::default(),
        };
        let mut options = config.into_options()?;
        if let Some(distro) = &self.distro {
            options.distro = resolve_distro(distro)?;
        }
        if let Some(platform) = &self.platform {
            options.platform = Some(platform.parse()?);
        }
        options.implicit = ImplicitPackages {
            base: options.implicit.base || self.implicit_base,
            systemd: options.implicit.systemd || self.implicit_systemd,
        };
        Ok(options)
    }

    /// The in-process engine with the stock Ubuntu images, and the named
    /// contexts it can resolve. Graphs are planned against it without
    /// starting any container.
    pub fn engine(&self) -> Result<(MockEngine, NamedContexts), CommandError> {
        let mut engine = MockEngine::ubuntu();
        let mut contexts = NamedContexts::new();
        for arg in &self.contexts {
            let (name, dir) = match arg.split_once('=') {
                Some((name, dir)) => (name.trim(), Some(dir)),
                None => (arg.trim(), None),
            };
            if name.is_empty() {
                return Err(CommandError::failure(format!("invalid --context '{arg}': empty name")));
            }
            if let Some(dir) = dir {
                let root = MockFs::load_dir(Path::new(dir)).map_err(|e| {
                    CommandError::failure(format!("cannot load context '{name}' from {dir}: {e}"))
                })?;
                engine = engine.with_context(name, root);
            }
            contexts = contexts.with(name, State::context(name));
        }
        Ok((engine, contexts))
    }
}

/// Build graph for `spec` on `args.target` and the worker it runs on.
pub fn build_graph(spec: &Spec, args: &BuildArgs) -> Result<(Worker, Definition), CommandError> {
    let options = args.options()?;
    let implicit = options.implicit;
    let (engine, contexts) = args.engine()?;
    let pipeline = Pipeline::new(&engine, &engine)
        .with_contexts(&contexts)
        .with_options(options);
    let (worker, archive) = pipeline.package_graph(spec, &args.target)?;
    if !args.container {
        return Ok((worker, archive.marshal()));
    }

    let fixture = RootfsAssembler::detect_fixture(&engine, &worker)?;
    let assembly =
        RootfsAssembler::new(implicit).assemble(&worker, spec, &archive, &args.target, fixture)?;
    Ok((worker, assembly.state.marshal()))
}
