//! Worker resolution: the base environment that build and install commands
//! run in.
//!
//! Sources are tried in order and the first one that produces a state wins.
//! The default order prefers a caller-supplied context named after the
//! distro image, then the distro's worker context, and finally bootstraps a
//! worker from the canonical distro image.

use crate::CoreError;
use kiln_graph::{CacheSharing, Run, State};
use kiln_runtime::{ContextProvider, DistroConfig, ImageConfig, ImageMetaResolver, Platform};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTier {
    DistroImageContext,
    WorkerContext,
    Bootstrap,
}

impl fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerTier::DistroImageContext => "distro image context",
            WorkerTier::WorkerContext => "worker context",
            WorkerTier::Bootstrap => "bootstrapped image",
        })
    }
}

/// A resolved build environment. Stages derive new states from it.
#[derive(Debug, Clone)]
pub struct Worker {
    state: State,
    distro: &'static DistroConfig,
    tier: WorkerTier,
}

impl Worker {
    pub fn new(state: State, distro: &'static DistroConfig, tier: WorkerTier) -> Self {
        Self {
            state,
            distro,
            tier,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn distro(&self) -> &'static DistroConfig {
        self.distro
    }

    pub fn tier(&self) -> WorkerTier {
        self.tier
    }
}

/// What a [`WorkerSource`] may consult.
#[derive(Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub distro: &'static DistroConfig,
    pub contexts: &'a dyn ContextProvider,
    pub images: &'a dyn ImageMetaResolver,
    pub platform: &'a Platform,
}

pub trait WorkerSource: Send + Sync {
    fn tier(&self) -> WorkerTier;

    /// `Ok(None)` passes resolution on to the next source.
    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<State>, CoreError>;
}

fn lookup_context(request: &ResolveRequest<'_>, name: &str) -> Result<Option<State>, CoreError> {
    request
        .contexts
        .get_context(name)
        .map_err(|e| CoreError::Resolution(format!("looking up context '{name}': {e}")))
}

/// A context whose name is the distro's image reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistroImageContext;

impl WorkerSource for DistroImageContext {
    fn tier(&self) -> WorkerTier {
        WorkerTier::DistroImageContext
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<State>, CoreError> {
        lookup_context(request, request.distro.image_ref)
    }
}

/// The distro's named worker context, e.g. `kiln-jammy-worker`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerContext;

impl WorkerSource for WorkerContext {
    fn tier(&self) -> WorkerTier {
        WorkerTier::WorkerContext
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<State>, CoreError> {
        lookup_context(request, request.distro.worker_context)
    }
}

/// The canonical distro image with the builder toolchain installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapWorker;

impl WorkerSource for BootstrapWorker {
    fn tier(&self) -> WorkerTier {
        WorkerTier::Bootstrap
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<State>, CoreError> {
        let distro = request.distro;
        let raw = request
            .images
            .resolve_image_config(distro.image_ref, request.platform)
            .map_err(|e| CoreError::Resolution(format!("resolving {}: {e}", distro.image_ref)))?;
        let config = ImageConfig::from_json(distro.image_ref, &raw)
            .map_err(|e| CoreError::Resolution(e.to_string()))?;

        let mut run = Run::shell(format!(
            "set -ex; apt update; apt install -y {}",
            distro.builder_packages().join(" ")
        ));
        for (key, value) in config.config.env.iter().filter_map(|kv| kv.split_once('=')) {
            run = run.env(key, value);
        }
        let run = with_apt_cache(run, distro).group(format!("Prepare {} worker", distro.codename));
        Ok(Some(State::image(distro.image_ref).run(run).root()))
    }
}

/// Attach the distro's shared apt cache mounts.
pub fn with_apt_cache(run: Run, distro: &DistroConfig) -> Run {
    run.cache("/var/cache/apt", distro.apt_cache_id(), CacheSharing::Shared)
        .cache("/var/lib/apt", distro.apt_lib_id(), CacheSharing::Shared)
}

pub struct WorkerResolver {
    sources: Vec<Box<dyn WorkerSource>>,
}

impl Default for WorkerResolver {
    fn default() -> Self {
        Self::with_sources(vec![
            Box::new(DistroImageContext),
            Box::new(WorkerContext),
            Box::new(BootstrapWorker),
        ])
    }
}

impl WorkerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<Box<dyn WorkerSource>>) -> Self {
        Self { sources }
    }

    pub fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Worker, CoreError> {
        for source in &self.sources {
            if let Some(state) = source.resolve(request)? {
                info!(
                    "using {} worker from {}",
                    request.distro.codename,
                    source.tier()
                );
                if let Some(node) = state.node() {
                    debug!("worker digest {}", node.digest().short());
                }
                return Ok(Worker::new(state, request.distro, source.tier()));
            }
        }
        Err(CoreError::Resolution(format!(
            "no worker source for '{}'",
            request.distro.codename
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::{MountKind, Op};
    use kiln_runtime::mock::MockEngine;
    use kiln_runtime::{BuildEngine, NamedContexts, NoContexts, RuntimeError, JAMMY};

    struct BrokenContexts;

    impl ContextProvider for BrokenContexts {
        fn get_context(&self, name: &str) -> Result<Option<State>, RuntimeError> {
            Err(RuntimeError::Context {
                name: name.to_owned(),
                reason: "session closed".to_owned(),
            })
        }
    }

    fn resolve(contexts: &dyn ContextProvider, images: &dyn ImageMetaResolver) -> Result<Worker, CoreError> {
        let platform = Platform::default();
        WorkerResolver::new().resolve(&ResolveRequest {
            distro: &JAMMY,
            contexts,
            images,
            platform: &platform,
        })
    }

    #[test]
    fn distro_image_context_wins() {
        let image_ctx = State::context(JAMMY.image_ref);
        let contexts = NamedContexts::new()
            .with(JAMMY.image_ref, image_ctx.clone())
            .with(JAMMY.worker_context, State::context(JAMMY.worker_context));
        let worker = resolve(&contexts, &MockEngine::ubuntu()).unwrap();
        assert_eq!(worker.tier(), WorkerTier::DistroImageContext);
        assert_eq!(worker.state(), &image_ctx);
        assert_eq!(worker.distro(), &JAMMY);
    }

    #[test]
    fn worker_context_is_second() {
        let ctx = State::context(JAMMY.worker_context);
        let contexts = NamedContexts::new().with(JAMMY.worker_context, ctx.clone());
        let worker = resolve(&contexts, &MockEngine::ubuntu()).unwrap();
        assert_eq!(worker.tier(), WorkerTier::WorkerContext);
        assert_eq!(worker.state(), &ctx);
    }

    #[test]
    fn bootstrap_installs_toolchain_with_apt_cache() {
        let worker = resolve(&NoContexts, &MockEngine::ubuntu()).unwrap();
        assert_eq!(worker.tier(), WorkerTier::Bootstrap);

        let def = worker.state().marshal();
        let (node, exec) = def.execs().next().unwrap();
        assert!(exec.args[2].contains("apt install -y aptitude dpkg-dev"));
        assert!(exec.args[2].ends_with("debhelper-compat=11"));
        assert!(exec.env.contains_key("PATH"));
        assert_eq!(node.group.as_deref(), Some("Prepare jammy worker"));

        let caches: Vec<&str> = exec
            .mounts
            .iter()
            .filter_map(|m| match &m.kind {
                MountKind::Cache { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(caches, ["jammy-var-cache-apt", "jammy-var-lib-apt"]);

        let base = &def.nodes[0];
        assert_eq!(
            base.op,
            Op::Image {
                reference: JAMMY.image_ref.to_owned()
            }
        );
    }

    #[test]
    fn bootstrap_worker_solves_on_mock() {
        let engine = MockEngine::ubuntu();
        let worker = resolve(&NoContexts, &engine).unwrap();
        let solved = engine.solve(&worker.state().marshal()).unwrap();
        assert!(engine.exists(&solved, "/usr/bin/dpkg-buildpackage").unwrap());
        assert!(engine.exists(&solved, "/usr/bin/aptitude").unwrap());
    }

    #[test]
    fn context_errors_abort() {
        let err = resolve(&BrokenContexts, &MockEngine::ubuntu()).unwrap_err();
        assert!(matches!(err, CoreError::Resolution(ref m) if m.contains("session closed")));
    }

    #[test]
    fn image_metadata_errors_abort() {
        let err = resolve(&NoContexts, &MockEngine::new()).unwrap_err();
        assert!(matches!(err, CoreError::Resolution(ref m) if m.contains("image not found")));
    }

    #[test]
    fn empty_source_list_fails() {
        let platform = Platform::default();
        let err = WorkerResolver::with_sources(Vec::new())
            .resolve(&ResolveRequest {
                distro: &JAMMY,
                contexts: &NoContexts,
                images: &MockEngine::ubuntu(),
                platform: &platform,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Resolution(_)));
    }
}
