//! Debian packaging sources generated from a spec: `debian/control`,
//! `changelog`, `rules`, the source format and the build and install
//! scripts that the rules file delegates to.

use kiln_runtime::image::DEBHELPER_COMPAT;
use kiln_schema::{PackageConstraints, Spec, SpecError};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Changelog trailer date. Fixed so that identical specs produce identical
/// packaging.
pub const CHANGELOG_DATE: &str = "Thu, 01 Jan 1970 00:00:00 +0000";
pub const DEFAULT_MAINTAINER: &str = "kiln <kiln@localhost>";

pub const BUILD_SCRIPT: &str = "debian/kiln_build.sh";
pub const INSTALL_SCRIPT: &str = "debian/kiln_install.sh";

const SYSTEMD_UNIT_DIR: &str = "lib/systemd/system";
const SYSTEMD_WANTS_DIR: &str = "etc/systemd/system/multi-user.target.wants";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagingFile {
    /// Relative to the source root.
    pub path: String,
    pub mode: u32,
    pub content: String,
}

impl PackagingFile {
    fn new(path: &str, mode: u32, content: String) -> Self {
        Self {
            path: path.to_owned(),
            mode,
            content,
        }
    }
}

/// `<version>-<revision>`, plus `~<release>` when the release is known.
pub fn deb_version(spec: &Spec, release: Option<&str>) -> String {
    match release {
        Some(release) => format!("{}-{}~{release}", spec.version, spec.revision),
        None => format!("{}-{}", spec.version, spec.revision),
    }
}

pub fn maintainer(spec: &Spec) -> String {
    let packager = spec.packager.trim();
    if packager.is_empty() {
        DEFAULT_MAINTAINER.to_owned()
    } else if packager.contains('<') {
        packager.to_owned()
    } else {
        format!("{packager} <kiln@localhost>")
    }
}

/// Render a dependency mapping as Debian relations, one entry per version
/// expression, with an architecture restriction when one is set.
pub fn relations(deps: &BTreeMap<String, PackageConstraints>) -> Result<Vec<String>, SpecError> {
    let mut out = Vec::new();
    for (name, constraints) in deps {
        let arch = if constraints.arch.is_empty() {
            String::new()
        } else {
            format!(" [{}]", constraints.arch.join(" "))
        };
        let parsed = constraints
            .parsed()
            .map_err(|source| SpecError::InvalidConstraint {
                package: name.clone(),
                source,
            })?;
        if parsed.is_empty() {
            out.push(format!("{name}{arch}"));
        }
        for constraint in parsed {
            out.push(format!("{name} ({constraint}){arch}"));
        }
    }
    Ok(out)
}

fn description(spec: &Spec) -> String {
    let mut lines = spec.description.trim().lines();
    let summary = lines.next().map_or(spec.name.as_str(), str::trim);
    let mut text = summary.to_owned();
    for line in lines {
        let line = line.trim();
        text.push_str("\n ");
        text.push_str(if line.is_empty() { "." } else { line });
    }
    text
}

pub fn control(spec: &Spec, target: &str) -> Result<String, SpecError> {
    let mut build_depends = vec![format!("debhelper-compat (= {DEBHELPER_COMPAT})")];
    build_depends.extend(relations(spec.build_deps(target))?);

    let mut depends = vec!["${misc:Depends}".to_owned()];
    depends.extend(relations(spec.runtime_deps(target))?);

    let architecture = if spec.artifacts.binaries.is_empty() {
        "all"
    } else {
        "any"
    };

    let mut out = String::new();
    let _ = writeln!(out, "Source: {}", spec.name);
    let _ = writeln!(out, "Section: misc");
    let _ = writeln!(out, "Priority: optional");
    let _ = writeln!(out, "Maintainer: {}", maintainer(spec));
    let _ = writeln!(out, "Build-Depends: {}", build_depends.join(", "));
    let _ = writeln!(out, "Standards-Version: 4.6.0");
    if !spec.website.is_empty() {
        let _ = writeln!(out, "Homepage: {}", spec.website);
    }
    out.push('\n');
    let _ = writeln!(out, "Package: {}", spec.name);
    let _ = writeln!(out, "Architecture: {architecture}");
    let _ = writeln!(out, "Depends: {}", depends.join(", "));
    let _ = writeln!(out, "Description: {}", description(spec));
    Ok(out)
}

pub fn changelog(spec: &Spec, version: &str, distribution: &str) -> String {
    format!(
        "{} ({version}) {distribution}; urgency=medium\n\n  * Automated build of {} {}\n\n -- {}  {CHANGELOG_DATE}\n",
        spec.name,
        spec.name,
        spec.version,
        maintainer(spec)
    )
}

pub fn rules() -> String {
    format!(
        "#!/usr/bin/make -f\n\n%:\n\tdh $@\n\n\
         override_dh_auto_build:\n\tsh {BUILD_SCRIPT}\n\n\
         override_dh_auto_install:\n\tsh {INSTALL_SCRIPT}\n"
    )
}

/// Quote `word` for sh unless it is made of safe characters only.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./+:=@%,-".contains(c));
    if safe {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub fn build_script(spec: &Spec) -> String {
    let mut out = String::from("#!/bin/sh\nset -e\n");
    for (key, value) in &spec.build.env {
        let _ = writeln!(out, "export {key}={}", shell_quote(value));
    }
    for step in &spec.build.steps {
        if step.env.is_empty() {
            let _ = writeln!(out, "{}", step.command);
            continue;
        }
        for (key, value) in &step.env {
            let _ = write!(out, "{key}={} ", shell_quote(value));
        }
        let _ = writeln!(out, "sh -c {}", shell_quote(&step.command));
    }
    out
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn install_script(spec: &Spec) -> String {
    let root = format!("debian/{}", spec.name);
    let mut out = String::from("#!/bin/sh\nset -e\n");

    for (source, artifact) in &spec.artifacts.binaries {
        let subpath = artifact.subpath.trim_matches('/');
        let dir = if subpath.is_empty() {
            format!("{root}/usr/bin")
        } else {
            format!("{root}/usr/bin/{subpath}")
        };
        let dest = format!(
            "{dir}/{}",
            artifact.name.as_deref().unwrap_or_else(|| file_name(source))
        );
        let _ = writeln!(out, "mkdir -p {}", shell_quote(&dir));
        let _ = writeln!(out, "cp {} {}", shell_quote(source), shell_quote(&dest));
        let _ = writeln!(out, "chmod 0755 {}", shell_quote(&dest));
    }

    if let Some(systemd) = spec.artifacts.systemd.as_ref().filter(|s| !s.units.is_empty()) {
        let unit_dir = format!("{root}/{SYSTEMD_UNIT_DIR}");
        let _ = writeln!(out, "mkdir -p {}", shell_quote(&unit_dir));
        for (source, unit) in &systemd.units {
            let name = file_name(source);
            let _ = writeln!(
                out,
                "cp {} {}",
                shell_quote(source),
                shell_quote(&format!("{unit_dir}/{name}"))
            );
            if unit.enable {
                let wants = format!("{root}/{SYSTEMD_WANTS_DIR}");
                let _ = writeln!(out, "mkdir -p {}", shell_quote(&wants));
                let _ = writeln!(
                    out,
                    "ln -sf {} {}",
                    shell_quote(&format!("/{SYSTEMD_UNIT_DIR}/{name}")),
                    shell_quote(&format!("{wants}/{name}"))
                );
            }
        }
    }
    out
}

/// Every file of the `debian/` directory for `spec` at `version`.
pub fn debian_dir(
    spec: &Spec,
    target: &str,
    version: &str,
    distribution: &str,
) -> Result<Vec<PackagingFile>, SpecError> {
    Ok(vec![
        PackagingFile::new("debian/control", 0o644, control(spec, target)?),
        PackagingFile::new("debian/changelog", 0o644, changelog(spec, version, distribution)),
        PackagingFile::new("debian/rules", 0o755, rules()),
        PackagingFile::new("debian/source/format", 0o644, "3.0 (quilt)\n".to_owned()),
        PackagingFile::new(BUILD_SCRIPT, 0o755, build_script(spec)),
        PackagingFile::new(INSTALL_SCRIPT, 0o755, install_script(spec)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::parse_spec_str;

    const FOO: &str = r#"
name = "foo"
version = "1.0"
packager = "Foo Maintainers <foo@example.com>"
description = "The foo tool"
website = "https://example.com/foo"

[build]
env = { GOFLAGS = "-trimpath" }
steps = [
  { command = "make" },
  { command = "echo \"$MSG\" > out.txt", env = { MSG = "it's done" } },
]

[artifacts.binaries."bin/foo"]
[artifacts.binaries."tools/foo-helper"]
subpath = "foo"
name = "helper"

[artifacts.systemd.units."units/foo.service"]
enable = true

[dependencies.build]
libbar-dev = ">= 2.0"
golang = { version = [">= 1.21", "<< 1.23"], arch = ["amd64", "arm64"] }

[dependencies.runtime]
libbar = {}
"#;

    fn foo() -> Spec {
        parse_spec_str(FOO).unwrap()
    }

    #[test]
    fn version_string() {
        let spec = foo();
        assert_eq!(deb_version(&spec, Some("ubuntu22.04")), "1.0-1~ubuntu22.04");
        assert_eq!(deb_version(&spec, None), "1.0-1");
    }

    #[test]
    fn relations_cover_every_expression() {
        let spec = foo();
        assert_eq!(
            relations(spec.build_deps("jammy")).unwrap(),
            [
                "golang (>= 1.21) [amd64 arm64]",
                "golang (<< 1.23) [amd64 arm64]",
                "libbar-dev (>= 2.0)",
            ]
        );
        assert_eq!(relations(spec.runtime_deps("jammy")).unwrap(), ["libbar"]);
    }

    #[test]
    fn invalid_constraint_names_package() {
        let mut deps = BTreeMap::new();
        deps.insert("libbar".to_owned(), PackageConstraints::versions(&[">="]));
        let err = relations(&deps).unwrap_err();
        assert!(matches!(err, SpecError::InvalidConstraint { ref package, .. } if package == "libbar"));
    }

    #[test]
    fn control_has_source_and_binary_stanzas() {
        let control = control(&foo(), "jammy").unwrap();
        let (source, binary) = control.split_once("\n\n").unwrap();
        assert!(source.contains("Source: foo\n"));
        assert!(source.contains("Maintainer: Foo Maintainers <foo@example.com>\n"));
        assert!(source.contains(
            "Build-Depends: debhelper-compat (= 11), golang (>= 1.21) [amd64 arm64], \
             golang (<< 1.23) [amd64 arm64], libbar-dev (>= 2.0)\n"
        ));
        // the stanza separator consumes the last field's newline
        assert!(source.ends_with("\nHomepage: https://example.com/foo"));
        assert!(binary.starts_with("Package: foo\nArchitecture: any\n"));
        assert!(binary.contains("Depends: ${misc:Depends}, libbar\n"));
        assert!(binary.contains("Description: The foo tool\n"));
    }

    #[test]
    fn packages_without_binaries_are_arch_all() {
        let spec = parse_spec_str("name = \"foo-deps\"\nversion = \"1.0\"\n").unwrap();
        let control = control(&spec, "jammy").unwrap();
        assert!(control.contains("Architecture: all\n"));
        assert!(control.contains("Maintainer: kiln <kiln@localhost>\n"));
        assert!(control.contains("Description: foo-deps\n"));
    }

    #[test]
    fn multi_line_description_is_folded() {
        let mut spec = foo();
        spec.description = "Summary\n\nLonger text".to_owned();
        let control = control(&spec, "jammy").unwrap();
        assert!(control.contains("Description: Summary\n .\n Longer text\n"));
    }

    #[test]
    fn changelog_heading_and_trailer() {
        let text = changelog(&foo(), "1.0-1~ubuntu22.04", "jammy");
        assert!(text.starts_with("foo (1.0-1~ubuntu22.04) jammy; urgency=medium\n"));
        assert!(text.contains(" -- Foo Maintainers <foo@example.com>  Thu, 01 Jan 1970"));
    }

    #[test]
    fn rules_delegate_to_scripts() {
        let rules = rules();
        assert!(rules.contains("override_dh_auto_build:\n\tsh debian/kiln_build.sh\n"));
        assert!(rules.contains("override_dh_auto_install:\n\tsh debian/kiln_install.sh\n"));
    }

    #[test]
    fn build_script_exports_env_and_scopes_step_env() {
        let script = build_script(&foo());
        assert_eq!(
            script,
            "#!/bin/sh\nset -e\nexport GOFLAGS=-trimpath\nmake\n\
             MSG='it'\\''s done' sh -c 'echo \"$MSG\" > out.txt'\n"
        );
    }

    #[test]
    fn install_script_places_binaries_and_units() {
        let script = install_script(&foo());
        assert!(script.contains("mkdir -p debian/foo/usr/bin\ncp bin/foo debian/foo/usr/bin/foo\n"));
        assert!(script.contains("chmod 0755 debian/foo/usr/bin/foo\n"));
        assert!(script.contains("cp tools/foo-helper debian/foo/usr/bin/foo/helper\n"));
        assert!(script.contains("cp units/foo.service debian/foo/lib/systemd/system/foo.service\n"));
        assert!(script.contains(
            "ln -sf /lib/systemd/system/foo.service \
             debian/foo/etc/systemd/system/multi-user.target.wants/foo.service\n"
        ));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("bin/foo"), "bin/foo");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn debian_dir_is_complete() {
        let files = debian_dir(&foo(), "jammy", "1.0-1", "jammy").unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "debian/control",
                "debian/changelog",
                "debian/rules",
                "debian/source/format",
                BUILD_SCRIPT,
                INSTALL_SCRIPT,
            ]
        );
        assert_eq!(files[2].mode, 0o755);
    }
}
