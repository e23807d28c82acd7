//! Debian package model for the simulated toolchain: archives, dependency
//! fields, repository indexes and the dpkg status database.

use super::fs::{normalize, wildcard_match, MockFs};
use kiln_schema::{DebVersion, Relation, VersionConstraint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const STATUS_PATH: &str = "/var/lib/dpkg/status";
pub const DPKG_CONFIG_DIR: &str = "/etc/dpkg/dpkg.cfg.d";

fn default_mode() -> u32 {
    0o644
}

fn arch_all() -> String {
    "all".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebFile {
    pub data: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Set for symbolic links; `data` is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// A binary package. Mock archives are this struct serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebPackage {
    pub package: String,
    pub version: String,
    #[serde(default = "arch_all")]
    pub architecture: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, DebFile>,
}

impl DebPackage {
    pub fn new(package: &str, version: &str) -> Self {
        Self {
            package: package.to_owned(),
            version: version.to_owned(),
            architecture: arch_all(),
            depends: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.depends.push(dep.to_owned());
        self
    }

    pub fn arch(mut self, arch: &str) -> Self {
        arch.clone_into(&mut self.architecture);
        self
    }

    pub fn with_file(mut self, path: &str, data: &str, mode: u32) -> Self {
        self.files.insert(
            path.to_owned(),
            DebFile {
                data: data.to_owned(),
                mode,
                link: None,
            },
        );
        self
    }

    /// `<name>_<version>_<arch>.deb`, with any epoch dropped.
    pub fn archive_name(&self) -> String {
        let version = self
            .version
            .split_once(':')
            .map_or(self.version.as_str(), |(_, v)| v);
        format!("{}_{}_{}.deb", self.package, version, self.architecture)
    }

    pub fn to_archive(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    pub fn from_archive(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("not a debian format archive: {e}"))
    }

    pub fn deb_version(&self) -> Result<DebVersion, String> {
        DebVersion::parse(&self.version).map_err(|e| format!("{}: {e}", self.package))
    }

    pub fn dependencies(&self, arch: &str) -> Result<Vec<Dependency>, String> {
        parse_depends(&self.depends.join(", "), arch)
    }
}

/// One entry of a Depends field: a package and an optional version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<VersionConstraint>,
}

impl Dependency {
    pub fn any(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            constraint: None,
        }
    }

    pub fn accepts(&self, version: &DebVersion) -> bool {
        self.constraint
            .as_ref()
            .map_or(true, |c| c.satisfied_by(version))
    }

    /// An apt command line argument: `name` or `name=version`.
    pub fn from_request(arg: &str) -> Result<Self, String> {
        match arg.split_once('=') {
            Some((name, version)) => Ok(Self {
                name: name.to_owned(),
                constraint: Some(VersionConstraint::new(
                    Relation::Exactly,
                    DebVersion::parse(version).map_err(|e| format!("{arg}: {e}"))?,
                )),
            }),
            None => Ok(Self::any(arg)),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{} ({c})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Parse a Depends or Build-Depends field. Substitution variables are
/// dropped, entries restricted to other architectures are skipped, and of a
/// set of alternatives only the first is considered.
pub fn parse_depends(field: &str, arch: &str) -> Result<Vec<Dependency>, String> {
    let mut deps = Vec::new();
    for raw in field.split(',') {
        let entry = raw.split('|').next().unwrap_or_default().trim();
        if entry.is_empty() || entry.starts_with("${") {
            continue;
        }

        let (entry, arches) = match entry.split_once('[') {
            Some((head, tail)) => (head.trim(), Some(tail.trim_end_matches(']').trim())),
            None => (entry, None),
        };
        if let Some(list) = arches {
            if !list.split_whitespace().any(|a| a == arch || a == "any") {
                continue;
            }
        }

        let dep = match entry.split_once('(') {
            Some((name, rest)) => {
                let expr = rest.trim_end().trim_end_matches(')');
                let constraint = expr
                    .parse::<VersionConstraint>()
                    .map_err(|e| format!("invalid dependency '{entry}': {e}"))?;
                Dependency {
                    name: name.trim().to_owned(),
                    constraint: Some(constraint),
                }
            }
            None => Dependency::any(entry),
        };
        deps.push(dep);
    }
    Ok(deps)
}

/// Packages available from configured apt sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageIndex {
    packages: BTreeMap<String, Vec<DebPackage>>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pkg: DebPackage) {
        let versions = self.packages.entry(pkg.package.clone()).or_default();
        versions.retain(|p| p.version != pkg.version);
        versions.push(pkg);
    }

    pub fn with(mut self, pkg: DebPackage) -> Self {
        self.add(pkg);
        self
    }

    pub fn extend(&mut self, other: &PackageIndex) {
        for pkg in other.packages.values().flatten() {
            self.add(pkg.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Versions of `name`, newest first.
    pub fn candidates(&self, name: &str) -> Vec<(&DebPackage, DebVersion)> {
        let mut out: Vec<(&DebPackage, DebVersion)> = self
            .packages
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|p| p.deb_version().ok().map(|v| (p, v)))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    pub fn newest(&self, name: &str) -> Option<(&DebPackage, DebVersion)> {
        self.candidates(name).into_iter().next()
    }

    pub fn to_json(&self) -> Vec<u8> {
        let all: Vec<&DebPackage> = self.packages.values().flatten().collect();
        serde_json::to_vec(&all).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let all: Vec<DebPackage> =
            serde_json::from_slice(bytes).map_err(|e| format!("corrupt package list: {e}"))?;
        let mut index = Self::new();
        for pkg in all {
            index.add(pkg);
        }
        Ok(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub version: String,
    pub architecture: String,
    pub depends: String,
}

impl InstalledPackage {
    pub fn deb_version(&self) -> Option<DebVersion> {
        DebVersion::parse(&self.version).ok()
    }
}

/// Prefix `path` with a root directory other than `/`.
pub fn rooted(root: &str, path: &str) -> String {
    if root == "/" {
        normalize("/", path)
    } else {
        normalize(root, path.trim_start_matches('/'))
    }
}

/// The dpkg status database of the filesystem rooted at `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDb {
    packages: BTreeMap<String, InstalledPackage>,
}

impl StatusDb {
    pub fn load(fs: &MockFs, root: &str) -> Self {
        let mut db = Self::default();
        let Some(text) = fs.read_string(&rooted(root, STATUS_PATH)) else {
            return db;
        };
        for stanza in text.split("\n\n") {
            let fields = parse_stanza(stanza);
            if let (Some(name), Some(version)) = (fields.get("Package"), fields.get("Version")) {
                db.packages.insert(
                    name.clone(),
                    InstalledPackage {
                        version: version.clone(),
                        architecture: fields.get("Architecture").cloned().unwrap_or_default(),
                        depends: fields.get("Depends").cloned().unwrap_or_default(),
                    },
                );
            }
        }
        db
    }

    pub fn save(&self, fs: &mut MockFs, root: &str) {
        let mut out = String::new();
        for (name, pkg) in &self.packages {
            out.push_str(&format!(
                "Package: {name}\nStatus: install ok installed\nArchitecture: {}\nVersion: {}\n",
                pkg.architecture, pkg.version
            ));
            if !pkg.depends.is_empty() {
                out.push_str(&format!("Depends: {}\n", pkg.depends));
            }
            out.push('\n');
        }
        fs.write_file(&rooted(root, STATUS_PATH), out, 0o644);
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn satisfies(&self, dep: &Dependency) -> bool {
        self.get(&dep.name)
            .and_then(InstalledPackage::deb_version)
            .is_some_and(|v| dep.accepts(&v))
    }

    /// Installed packages whose dependencies are not met, with the unmet entries.
    pub fn broken(&self, arch: &str) -> Vec<(String, Vec<Dependency>)> {
        self.packages
            .iter()
            .filter_map(|(name, pkg)| {
                let unmet: Vec<Dependency> = parse_depends(&pkg.depends, arch)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|d| !self.satisfies(d))
                    .collect();
                (!unmet.is_empty()).then(|| (name.clone(), unmet))
            })
            .collect()
    }

    /// Every dependency entry on `name` declared by installed packages,
    /// ignoring packages listed in `except`.
    pub fn constraints_on(&self, name: &str, arch: &str, except: &[&str]) -> Vec<Dependency> {
        self.packages
            .iter()
            .filter(|(n, _)| !except.contains(&n.as_str()))
            .flat_map(|(_, pkg)| parse_depends(&pkg.depends, arch).unwrap_or_default())
            .filter(|d| d.name == name)
            .collect()
    }

    /// Unpack `pkg` into `root` and record it. Paths matched by dpkg
    /// `path-exclude` settings are skipped.
    pub fn unpack(&mut self, fs: &mut MockFs, root: &str, pkg: &DebPackage) -> Vec<String> {
        let config = DpkgConfig::load(fs, root);
        let mut log = Vec::new();
        if config.debug > 0 {
            log.push(format!("D{:06}: unpacking {}", config.debug, pkg.package));
        }

        self.remove_files(fs, root, &pkg.package);
        let mut installed = Vec::new();
        for (path, file) in &pkg.files {
            let path = normalize("/", path);
            if config.excluded(&path) {
                continue;
            }
            match &file.link {
                Some(target) => fs.symlink(&rooted(root, &path), target),
                None => fs.write_file(&rooted(root, &path), file.data.clone(), file.mode),
            }
            installed.push(path);
        }
        fs.write_file(
            &rooted(root, &format!("/var/lib/dpkg/info/{}.list", pkg.package)),
            installed.join("\n"),
            0o644,
        );

        self.packages.insert(
            pkg.package.clone(),
            InstalledPackage {
                version: pkg.version.clone(),
                architecture: pkg.architecture.clone(),
                depends: pkg.depends.join(", "),
            },
        );
        log.push(format!(
            "Setting up {} ({}) ...",
            pkg.package, pkg.version
        ));
        log
    }

    fn remove_files(&self, fs: &mut MockFs, root: &str, name: &str) {
        let list = rooted(root, &format!("/var/lib/dpkg/info/{name}.list"));
        if let Some(files) = fs.read_string(&list) {
            for path in files.lines().filter(|l| !l.is_empty()) {
                fs.remove(&rooted(root, path));
            }
        }
        fs.remove(&list);
    }

    pub fn purge(&mut self, fs: &mut MockFs, root: &str, name: &str) -> bool {
        self.remove_files(fs, root, name);
        self.packages.remove(name).is_some()
    }
}

fn parse_stanza(stanza: &str) -> BTreeMap<String, String> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut last: Option<String> = None;
    for line in stanza.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(field) = last.as_ref().and_then(|k| fields.get_mut(k)) {
                field.push('\n');
                field.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_owned(), value.trim().to_owned());
            last = Some(key.trim().to_owned());
        }
    }
    fields
}

/// Parse a deb822 control file into its stanzas.
pub fn parse_control(text: &str) -> Vec<BTreeMap<String, String>> {
    text.split("\n\n")
        .map(parse_stanza)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Settings read from `dpkg.cfg.d`.
#[derive(Debug, Default)]
pub struct DpkgConfig {
    pub debug: u32,
    excludes: Vec<String>,
    includes: Vec<String>,
}

impl DpkgConfig {
    pub fn load(fs: &MockFs, root: &str) -> Self {
        let mut config = Self::default();
        let dir = rooted(root, DPKG_CONFIG_DIR);
        for name in fs.list(&dir) {
            let Some(text) = fs.read_string(&format!("{dir}/{name}")) else {
                continue;
            };
            for line in text.lines().map(str::trim) {
                if let Some(p) = line.strip_prefix("path-exclude=") {
                    config.excludes.push(p.to_owned());
                } else if let Some(p) = line.strip_prefix("path-include=") {
                    config.includes.push(p.to_owned());
                } else if let Some(level) = line.strip_prefix("debug=") {
                    config.debug = level.trim().parse().unwrap_or(0);
                }
            }
        }
        config
    }

    pub fn excluded(&self, path: &str) -> bool {
        self.excludes.iter().any(|p| wildcard_match(p, path))
            && !self.includes.iter().any(|p| wildcard_match(p, path))
    }
}
