use crate::checks::TestSpec;
use crate::spec::{PackageDependencies, PostInstall, Spec, SpecError};
use crate::version::DebVersion;
use std::collections::BTreeSet;

impl Spec {
    /// Check the spec for values that would only fail later, deep inside a build.
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_package_name(&self.name)?;

        for (field, value) in [("version", &self.version), ("revision", &self.revision)] {
            if value.trim().is_empty() {
                return Err(SpecError::EmptyField(field));
            }
            // packaging uses both verbatim
            if value.trim() != value.as_str() {
                return Err(SpecError::SurroundingWhitespace(field));
            }
        }
        let full = format!("{}-{}", self.version, self.revision);
        DebVersion::parse(&full).map_err(|source| SpecError::InvalidVersion {
            version: full.clone(),
            source,
        })?;

        for (name, source) in &self.sources {
            if source.inline.is_some() == source.context.is_some() {
                return Err(SpecError::InvalidSource(name.clone()));
            }
        }

        if let Some(deps) = &self.dependencies {
            validate_dependencies(deps)?;
        }
        if let Some(post) = self.image.as_ref().and_then(|i| i.post.as_ref()) {
            validate_post(post)?;
        }
        validate_test_names(self.tests.iter())?;

        for (key, target) in &self.targets {
            if key.trim().is_empty() {
                return Err(SpecError::EmptyTargetKey);
            }
            if let Some(deps) = &target.dependencies {
                validate_dependencies(deps)?;
            }
            if let Some(post) = target.image.as_ref().and_then(|i| i.post.as_ref()) {
                validate_post(post)?;
            }
            validate_test_names(self.tests_for(key).into_iter())?;
        }

        Ok(())
    }
}

/// Debian package names: at least two characters, lowercase alphanumerics,
/// `+`, `-` and `.`, starting with an alphanumeric.
pub fn validate_package_name(name: &str) -> Result<(), SpecError> {
    if name.is_empty() {
        return Err(SpecError::EmptyField("name"));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.')
    });
    if name.len() < 2 || !first_ok || !rest_ok {
        return Err(SpecError::InvalidPackageName(name.to_owned()));
    }
    Ok(())
}

fn validate_dependencies(deps: &PackageDependencies) -> Result<(), SpecError> {
    for (package, constraints) in deps.build.iter().chain(deps.runtime.iter()) {
        validate_package_name(package)?;
        constraints
            .parsed()
            .map_err(|source| SpecError::InvalidConstraint {
                package: package.clone(),
                source,
            })?;
    }
    for package in &deps.test {
        validate_package_name(package)?;
    }
    Ok(())
}

fn validate_post(post: &PostInstall) -> Result<(), SpecError> {
    for (existing, link) in &post.symlinks {
        for path in [existing, &link.path] {
            if !path.starts_with('/') {
                return Err(SpecError::RelativeSymlink(path.clone()));
            }
        }
    }
    Ok(())
}

fn validate_test_names<'a>(tests: impl Iterator<Item = &'a TestSpec>) -> Result<(), SpecError> {
    let mut seen = BTreeSet::new();
    for test in tests {
        if test.name.trim().is_empty() {
            return Err(SpecError::EmptyField("test name"));
        }
        if !seen.insert(test.name.as_str()) {
            return Err(SpecError::DuplicateTest(test.name.clone()));
        }
    }
    Ok(())
}
