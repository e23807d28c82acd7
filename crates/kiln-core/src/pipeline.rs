//! Entry points: build a package, or a container image around it.

use crate::builder::PackageBuilder;
use crate::harness::TestHarness;
use crate::installer::{AptBackend, InstallBackend};
use crate::options::BuildOptions;
use crate::rootfs::{InstallOutcome, RootfsAssembler};
use crate::worker::{ResolveRequest, Worker, WorkerResolver};
use crate::CoreError;
use kiln_graph::State;
use kiln_runtime::{
    BuildEngine, ContextProvider, ImageConfig, ImageMetaResolver, NoContexts, NoopSigner,
    Platform, Signer, SolvedRef,
};
use kiln_schema::Spec;
use tracing::{debug, info, warn};

/// A solved package build. `archives` lists the `.deb` files at its root.
#[derive(Debug, Clone)]
pub struct PackageArtifact {
    pub solved: SolvedRef,
    pub archives: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerArtifact {
    pub solved: SolvedRef,
    pub image: ImageConfig,
}

pub struct Pipeline<'a> {
    engine: &'a dyn BuildEngine,
    images: &'a dyn ImageMetaResolver,
    contexts: &'a dyn ContextProvider,
    signer: &'a dyn Signer,
    backend: &'a dyn InstallBackend,
    resolver: WorkerResolver,
    options: BuildOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(engine: &'a dyn BuildEngine, images: &'a dyn ImageMetaResolver) -> Self {
        Self {
            engine,
            images,
            contexts: &NoContexts,
            signer: &NoopSigner,
            backend: &AptBackend,
            resolver: WorkerResolver::default(),
            options: BuildOptions::default(),
        }
    }

    pub fn with_contexts(mut self, contexts: &'a dyn ContextProvider) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_signer(mut self, signer: &'a dyn Signer) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_install_backend(mut self, backend: &'a dyn InstallBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_resolver(mut self, resolver: WorkerResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    fn platform(&self) -> Platform {
        self.options
            .platform
            .clone()
            .unwrap_or_else(|| self.engine.platform())
    }

    fn builder(&self) -> PackageBuilder<'_> {
        PackageBuilder::new(self.engine, self.contexts)
            .with_signer(self.signer)
            .with_install_backend(self.backend)
    }

    pub fn resolve_worker(&self, target: &str) -> Result<Worker, CoreError> {
        let platform = self.platform();
        self.resolver.resolve(&ResolveRequest {
            distro: self.options.distro_for(target),
            contexts: self.contexts,
            images: self.images,
            platform: &platform,
        })
    }

    /// The unsolved package graph for `spec` and the worker it builds on.
    /// Detecting the worker release solves the worker itself.
    pub fn package_graph(&self, spec: &Spec, target: &str) -> Result<(Worker, State), CoreError> {
        spec.validate()?;
        let worker = self.resolve_worker(target)?;
        let archive = self.builder().build(&worker, spec, target)?;
        Ok((worker, archive))
    }

    pub fn build_package(&self, spec: &Spec, target: &str) -> Result<PackageArtifact, CoreError> {
        info!("building package {} {} for {target}", spec.name, spec.version);
        let (_, archive) = self.package_graph(spec, target)?;
        let definition = archive.marshal();
        debug!("package graph {} ({} nodes)", definition.digest().short(), definition.nodes.len());

        let solved = self.engine.solve(&definition)?;
        let archives = self.engine.read_dir(&solved, "/")?;
        info!("built {}", archives.join(", "));
        Ok(PackageArtifact { solved, archives })
    }

    pub fn build_container(&self, spec: &Spec, target: &str) -> Result<ContainerArtifact, CoreError> {
        info!("building container for {} on {target}", spec.name);
        let (worker, archive) = self.package_graph(spec, target)?;

        let include_fixture = RootfsAssembler::detect_fixture(self.engine, &worker)?;
        if include_fixture {
            warn!("worker carries a local test repository, mounting it for the install");
        }
        let assembly = RootfsAssembler::new(self.options.implicit).assemble(
            &worker,
            spec,
            &archive,
            target,
            include_fixture,
        )?;
        debug!("rootfs install step {}", assembly.install_digest().short());

        let image = self.image_config(&worker, spec, target)?;

        let solved = match assembly.solve(self.engine)? {
            InstallOutcome::Installed(solved) => solved,
            InstallOutcome::Failed { diagnostics } => return Err(CoreError::Install { diagnostics }),
        };
        debug!("rootfs content {}", solved.content.short());

        TestHarness::new(self.engine).run(&worker, spec, target, &assembly.state)?;
        info!("container for {} ready", spec.name);
        Ok(ContainerArtifact { solved, image })
    }

    /// The base image config with the build platform and the spec's image
    /// declarations applied.
    fn image_config(&self, worker: &Worker, spec: &Spec, target: &str) -> Result<ImageConfig, CoreError> {
        let base = spec
            .base_output_image(target)
            .unwrap_or(worker.distro().default_output_image);
        let platform = self.platform();
        let raw = self.images.resolve_image_config(base, &platform)?;
        let mut config = ImageConfig::from_json(base, &raw)?;
        config.set_platform(&platform);
        config.merge_spec(&spec.image_for(target));
        Ok(config)
    }
}
