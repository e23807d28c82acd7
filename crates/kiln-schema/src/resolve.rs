//! Per-target views of a spec.
//!
//! A target may override its dependency block, image and tests. Every lookup
//! falls back to the spec-level value when the target does not override it.

use crate::checks::TestSpec;
use crate::spec::{ImageSpec, PackageConstraints, PackageDependencies, PostInstall, Spec, Target};
use std::collections::BTreeMap;

static NO_CONSTRAINTS: BTreeMap<String, PackageConstraints> = BTreeMap::new();

impl Spec {
    pub fn target(&self, key: &str) -> Option<&Target> {
        self.targets.get(key)
    }

    /// The dependency block in effect for `target`. A target's block replaces
    /// the spec's block wholesale.
    pub fn dependencies_for(&self, target: &str) -> Option<&PackageDependencies> {
        self.target(target)
            .and_then(|t| t.dependencies.as_ref())
            .or(self.dependencies.as_ref())
    }

    pub fn build_deps(&self, target: &str) -> &BTreeMap<String, PackageConstraints> {
        self.dependencies_for(target)
            .map_or(&NO_CONSTRAINTS, |d| &d.build)
    }

    pub fn runtime_deps(&self, target: &str) -> &BTreeMap<String, PackageConstraints> {
        self.dependencies_for(target)
            .map_or(&NO_CONSTRAINTS, |d| &d.runtime)
    }

    pub fn test_deps(&self, target: &str) -> &[String] {
        self.dependencies_for(target)
            .map(|d| d.test.as_slice())
            .unwrap_or(&[])
    }

    /// Base image for the produced container, if the spec or target set one.
    pub fn base_output_image(&self, target: &str) -> Option<&str> {
        let from_target = self
            .target(target)
            .and_then(|t| t.image.as_ref())
            .and_then(|i| i.base.as_deref());
        let from_spec = self.image.as_ref().and_then(|i| i.base.as_deref());
        from_target
            .or(from_spec)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn image_post(&self, target: &str) -> Option<&PostInstall> {
        self.target(target)
            .and_then(|t| t.image.as_ref())
            .and_then(|i| i.post.as_ref())
            .or_else(|| self.image.as_ref().and_then(|i| i.post.as_ref()))
    }

    /// Image declaration with target fields layered over spec fields.
    pub fn image_for(&self, target: &str) -> ImageSpec {
        let mut merged = self.image.clone().unwrap_or_default();
        let Some(over) = self.target(target).and_then(|t| t.image.as_ref()) else {
            return merged;
        };

        if over.base.is_some() {
            merged.base.clone_from(&over.base);
        }
        if over.entrypoint.is_some() {
            merged.entrypoint.clone_from(&over.entrypoint);
        }
        if over.cmd.is_some() {
            merged.cmd.clone_from(&over.cmd);
        }
        if over.working_dir.is_some() {
            merged.working_dir.clone_from(&over.working_dir);
        }
        if over.user.is_some() {
            merged.user.clone_from(&over.user);
        }
        if over.post.is_some() {
            merged.post.clone_from(&over.post);
        }
        merged
            .env
            .extend(over.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .labels
            .extend(over.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Spec-level tests followed by the target's own tests.
    pub fn tests_for(&self, target: &str) -> Vec<&TestSpec> {
        let mut tests: Vec<&TestSpec> = self.tests.iter().collect();
        if let Some(t) = self.target(target) {
            tests.extend(t.tests.iter());
        }
        tests
    }
}
