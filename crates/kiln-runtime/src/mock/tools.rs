//! Package tooling understood by the mock shell: `apt`/`apt-get`, `dpkg`,
//! `aptitude`, `mmdebstrap` and `dpkg-buildpackage`.
//!
//! Repository metadata lives in `/var/lib/apt/lists/*_Packages` as JSON
//! written by `apt update`, so a missing update step fails the same way it
//! would on a real system.

use super::deb::{
    parse_control, parse_depends, rooted, DebFile, DebPackage, Dependency, PackageIndex, StatusDb,
};
use super::fs::{normalize, Entry, MockFs};
use super::shell::Shell;
use super::solver::{apt_plan, aptitude_fix, FixAction, Request};
use std::fmt::Write as _;

pub const LISTS_DIR: &str = "/var/lib/apt/lists";
const SOURCES_LIST: &str = "/etc/apt/sources.list";
const SOURCES_DIR: &str = "/etc/apt/sources.list.d";
const HINTS_OPTION: &str = "Aptitude::ProblemResolver::Hints::";

/// Command line split into flags, `-o`/`--key=value` options and operands.
#[derive(Debug, Default)]
struct Args<'a> {
    flags: Vec<&'a str>,
    options: Vec<(&'a str, &'a str)>,
    operands: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn parse(args: &'a [String]) -> Self {
        let mut parsed = Self::default();
        let mut iter = args.iter().map(String::as_str);
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                if let Some((k, v)) = iter.next().and_then(|o| o.split_once('=')) {
                    parsed.options.push((k, v));
                }
            } else if let Some((k, v)) = arg.strip_prefix("--").and_then(|o| o.split_once('=')) {
                parsed.options.push((k, v));
            } else if arg.len() > 1 && arg.starts_with('-') {
                parsed.flags.push(arg);
            } else {
                parsed.operands.push(arg);
            }
        }
        parsed
    }

    fn has(&self, flag: &str) -> bool {
        self.flags.contains(&flag)
    }

    /// Single-letter flag, alone or bundled (`-fy`).
    fn has_short(&self, letter: char) -> bool {
        self.flags
            .iter()
            .any(|f| !f.starts_with("--") && f[1..].contains(letter))
    }

    fn values(&self, key: &str) -> impl Iterator<Item = &'a str> + '_ {
        let key = key.to_owned();
        self.options
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Source {
    uri: String,
    suite: String,
}

fn parse_sources(text: &str) -> Vec<Source> {
    let mut sources = Vec::new();
    for line in text.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix("deb ") else {
            continue;
        };
        let rest = rest.trim_start();
        let rest = match rest.strip_prefix('[') {
            Some(opts) => opts.split_once(']').map_or("", |(_, r)| r),
            None => rest,
        };
        let mut fields = rest.split_whitespace();
        if let (Some(uri), Some(suite)) = (fields.next(), fields.next()) {
            sources.push(Source {
                uri: uri.to_owned(),
                suite: suite.to_owned(),
            });
        }
    }
    sources
}

fn read_sources(fs: &MockFs, root: &str) -> Vec<Source> {
    let mut text = fs
        .read_string(&rooted(root, SOURCES_LIST))
        .unwrap_or_default();
    let dir = rooted(root, SOURCES_DIR);
    for name in fs.list(&dir) {
        if name.ends_with(".list") {
            text.push('\n');
            text.push_str(&fs.read_string(&format!("{dir}/{name}")).unwrap_or_default());
        }
    }
    parse_sources(&text)
}

fn list_file(source: &Source) -> String {
    let raw = format!("{}_{}", source.uri, source.suite);
    let name: String = raw
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    format!("{}_Packages", name.trim_matches('_'))
}

/// Every package known from the lists under `root`.
pub fn load_lists(fs: &MockFs, root: &str) -> Result<PackageIndex, String> {
    let dir = rooted(root, LISTS_DIR);
    let mut index = PackageIndex::new();
    for name in fs.list(&dir) {
        if !name.ends_with("_Packages") {
            continue;
        }
        let bytes = fs.read(&format!("{dir}/{name}")).unwrap_or_default();
        index.extend(&PackageIndex::from_json(bytes)?);
    }
    Ok(index)
}

/// Archives in a flat `file:` repository.
fn local_repository(fs: &MockFs, dir: &str) -> Option<PackageIndex> {
    if !fs.is_dir(dir) {
        return None;
    }
    let mut index = PackageIndex::new();
    for path in fs.glob(&format!("{dir}/*.deb")) {
        if let Some(pkg) = fs.read(&path).and_then(|b| DebPackage::from_archive(b).ok()) {
            index.add(pkg);
        }
    }
    Some(index)
}

fn is_archive_arg(arg: &str) -> bool {
    arg.contains('/') || arg.ends_with(".deb")
}

impl Shell<'_> {
    fn tool_fail(&mut self, msg: impl AsRef<str>, status: i32) -> i32 {
        let _ = writeln!(self.stderr, "{}", msg.as_ref());
        status
    }

    /// Tools shipped by optional packages exist only once installed.
    fn require(&mut self, tool: &str, package: &str) -> Option<i32> {
        if StatusDb::load(self.fs, "/").get(package).is_some() {
            None
        } else {
            Some(self.tool_fail(format!("sh: 1: {tool}: not found"), 127))
        }
    }

    fn unpack_all(&mut self, root: &str, db: &mut StatusDb, packages: &[DebPackage], out: &mut String) {
        for pkg in packages {
            let _ = writeln!(out, "Unpacking {} ({}) ...", pkg.package, pkg.version);
            for line in db.unpack(self.fs, root, pkg) {
                let _ = writeln!(out, "{line}");
            }
        }
        db.save(self.fs, root);
    }

    pub(super) fn apt(&mut self, args: &[String], out: &mut String) -> i32 {
        let parsed = Args::parse(args);
        match parsed.operands.split_first() {
            Some((&"update", _)) => self.apt_update(out),
            Some((&"install", packages)) => {
                let fix = parsed.has_short('f') || parsed.has("--fix-broken");
                self.apt_install(packages, fix, out)
            }
            Some((other, _)) => self.tool_fail(format!("E: Invalid operation {other}"), 100),
            None => self.tool_fail("E: No operation given", 100),
        }
    }

    fn apt_update(&mut self, out: &mut String) -> i32 {
        let mut status = 0;
        for (n, source) in read_sources(self.fs, "/").iter().enumerate() {
            let index = match source.uri.strip_prefix("file:") {
                Some(dir) => {
                    let dir = normalize("/", dir);
                    match local_repository(self.fs, &dir) {
                        Some(index) => index,
                        None => {
                            let _ = writeln!(
                                self.stderr,
                                "Err:{} {} {} Release\n  File not found - {dir}/Release",
                                n + 1,
                                source.uri,
                                source.suite
                            );
                            status = 100;
                            continue;
                        }
                    }
                }
                None => self.world.archive.clone(),
            };
            let _ = writeln!(out, "Get:{} {} {} InRelease", n + 1, source.uri, source.suite);
            let path = format!("{LISTS_DIR}/{}", list_file(source));
            self.fs.write_file(&path, index.to_json(), 0o644);
        }
        let _ = writeln!(out, "Reading package lists... Done");
        if status != 0 {
            let _ = writeln!(self.stderr, "E: Some index files failed to download.");
        }
        status
    }

    fn apt_install(&mut self, packages: &[&str], fix: bool, out: &mut String) -> i32 {
        let index = match load_lists(self.fs, "/") {
            Ok(index) => index,
            Err(e) => return self.tool_fail(format!("E: {e}"), 100),
        };
        let mut db = StatusDb::load(self.fs, "/");

        let mut requests = Vec::new();
        for arg in packages {
            if is_archive_arg(arg) {
                let parsed = self
                    .fs
                    .read(&self.path(arg))
                    .map(DebPackage::from_archive);
                match parsed {
                    Some(Ok(pkg)) => requests.push(Request::Archive(pkg)),
                    Some(Err(e)) => return self.tool_fail(format!("E: {arg}: {e}"), 100),
                    None => {
                        return self.tool_fail(
                            format!("E: Unsupported file {arg} given on commandline"),
                            100,
                        )
                    }
                }
            } else {
                match Dependency::from_request(arg) {
                    Ok(dep) => requests.push(Request::Named(dep)),
                    Err(e) => return self.tool_fail(format!("E: {e}"), 100),
                }
            }
        }
        if requests.is_empty() && fix {
            requests = db
                .broken(self.world.arch)
                .into_iter()
                .flat_map(|(_, deps)| deps)
                .map(Request::Named)
                .collect();
        }

        let _ = writeln!(out, "Reading package lists...\nBuilding dependency tree...");
        match apt_plan(&index, &db, &requests, self.world.arch) {
            Ok(plan) => {
                self.unpack_all("/", &mut db, &plan, out);
                let _ = writeln!(out, "{} newly installed, 0 to remove.", plan.len());
                0
            }
            Err(e) => self.tool_fail(e, 100),
        }
    }

    pub(super) fn dpkg(&mut self, args: &[String], out: &mut String) -> i32 {
        let parsed = Args::parse(args);
        if parsed.has("--print-architecture") {
            let _ = writeln!(out, "{}", self.world.arch);
            return 0;
        }
        if parsed.has("-l") || parsed.has("--list") {
            let db = StatusDb::load(self.fs, "/");
            for name in db.names() {
                if let Some(pkg) = db.get(name) {
                    let _ = writeln!(out, "ii  {name}  {}  {}", pkg.version, pkg.architecture);
                }
            }
            return 0;
        }
        if !(parsed.has("-i") || parsed.has("--install")) {
            return self.tool_fail("dpkg: error: need an action option", 2);
        }

        let force = parsed.has("--force-depends") || parsed.has("--force-all");
        let mut archives = Vec::new();
        for arg in &parsed.operands {
            match self.fs.read(&self.path(arg)).map(DebPackage::from_archive) {
                Some(Ok(pkg)) => archives.push(pkg),
                Some(Err(e)) => return self.tool_fail(format!("dpkg-deb: error: '{arg}' is {e}"), 2),
                None => {
                    return self.tool_fail(
                        format!("dpkg: error: cannot access archive '{arg}': No such file or directory"),
                        2,
                    )
                }
            }
        }

        let mut db = StatusDb::load(self.fs, "/");
        self.unpack_all("/", &mut db, &archives, out);

        let mut status = 0;
        for pkg in &archives {
            let unmet: Vec<Dependency> = pkg
                .dependencies(self.world.arch)
                .unwrap_or_default()
                .into_iter()
                .filter(|d| !db.satisfies(d))
                .collect();
            if unmet.is_empty() {
                continue;
            }
            let details: String = unmet
                .iter()
                .map(|d| format!(" {} depends on {d}; however:\n  Package {} is not installed.\n", pkg.package, d.name))
                .collect();
            if force {
                let _ = write!(
                    self.stderr,
                    "dpkg: {}: dependency problems, but configuring anyway as you requested:\n{details}",
                    pkg.package
                );
            } else {
                let _ = write!(
                    self.stderr,
                    "dpkg: dependency problems prevent configuration of {}:\n{details}",
                    pkg.package
                );
                status = 1;
            }
        }
        status
    }

    pub(super) fn aptitude(&mut self, args: &[String], out: &mut String) -> i32 {
        if let Some(status) = self.require("aptitude", "aptitude") {
            return status;
        }
        let parsed = Args::parse(args);
        match parsed.operands.first() {
            Some(&"install") => {}
            Some(other) => return self.tool_fail(format!("aptitude: unsupported command {other}"), 1),
            None => return self.tool_fail("aptitude: no command given", 1),
        }
        if parsed.operands.len() > 1 {
            return self.tool_fail("aptitude: only 'install -f' is supported", 1);
        }

        // "reject <pkg>... :UNINST" keeps the named packages installed.
        let rejected: Vec<String> = parsed
            .values(HINTS_OPTION)
            .flat_map(|hint| {
                let words: Vec<&str> = hint.split_whitespace().collect();
                match words.as_slice() {
                    ["reject", pkgs @ .., ":UNINST"] => {
                        pkgs.iter().map(|p| (*p).to_owned()).collect()
                    }
                    _ => Vec::new(),
                }
            })
            .collect();

        let index = match load_lists(self.fs, "/") {
            Ok(index) => index,
            Err(e) => return self.tool_fail(format!("E: {e}"), 255),
        };
        let mut db = StatusDb::load(self.fs, "/");
        match aptitude_fix(&index, &db, self.world.arch, &rejected) {
            Ok(FixAction::Nothing) => {
                let _ = writeln!(out, "No packages will be installed, upgraded, or removed.");
                0
            }
            Ok(FixAction::Install(packages)) => {
                let names: Vec<&str> = packages.iter().map(|p| p.package.as_str()).collect();
                let _ = writeln!(
                    out,
                    "The following NEW packages will be installed:\n  {}",
                    names.join(" ")
                );
                self.unpack_all("/", &mut db, &packages, out);
                0
            }
            Ok(FixAction::Remove(names)) => {
                let _ = writeln!(
                    out,
                    "The following packages will be REMOVED:\n  {}",
                    names.join(" ")
                );
                for name in &names {
                    db.purge(self.fs, "/", name);
                }
                db.save(self.fs, "/");
                0
            }
            Err(e) => self.tool_fail(e, 1),
        }
    }

    pub(super) fn mmdebstrap(&mut self, args: &[String], out: &mut String) -> i32 {
        if let Some(status) = self.require("mmdebstrap", "mmdebstrap") {
            return status;
        }
        let parsed = Args::parse(args);
        let (suite, target, mirror) = match parsed.operands.as_slice() {
            [suite, target, rest @ ..] => (*suite, self.path(target), rest.first().copied()),
            _ => {
                return self.tool_fail(
                    "usage: mmdebstrap [OPTION...] SUITE TARGET [MIRROR...]",
                    1,
                )
            }
        };
        let skip_empty_check = parsed
            .values("skip")
            .flat_map(|v| v.split([',', ' ']))
            .any(|v| v == "check/empty");
        if !skip_empty_check && !self.fs.list(&target).is_empty() {
            return self.tool_fail(
                format!("E: {target} already exists and is not an empty directory"),
                1,
            );
        }

        let includes: Vec<&str> = parsed
            .values("include")
            .flat_map(|v| v.split([',', ' ']))
            .filter(|p| !p.is_empty())
            .collect();
        let mut requests = Vec::new();
        for pkg in includes {
            match Dependency::from_request(pkg) {
                Ok(dep) => requests.push(Request::Named(dep)),
                Err(e) => return self.tool_fail(format!("E: {e}"), 1),
            }
        }

        let index = match load_lists(self.fs, "/") {
            Ok(index) => index,
            Err(e) => return self.tool_fail(format!("E: {e}"), 1),
        };
        let mut db = StatusDb::load(self.fs, &target);
        let plan = match apt_plan(&index, &db, &requests, self.world.arch) {
            Ok(plan) => plan,
            Err(e) => return self.tool_fail(format!("{e}\nE: apt-get install failed"), 1),
        };

        let _ = writeln!(out, "I: chroot architecture {} is equal to the host's architecture", self.world.arch);
        self.fs.mkdir_all(&target, 0o755);
        for dir in ["/tmp", "/var/lib/apt/lists", "/var/cache/apt/archives", "/etc/apt"] {
            self.fs.mkdir_all(&rooted(&target, dir), 0o755);
        }
        let sources = match mirror {
            Some(m) if m.starts_with('/') => self.fs.read_string(m).unwrap_or_default(),
            Some(m) => format!("deb {m} {suite} main\n"),
            None => self.fs.read_string(SOURCES_LIST).unwrap_or_default(),
        };
        let os_release = self.fs.read_string("/etc/os-release");
        let seed = [
            ("/etc/os-release", os_release, 0o644),
            (SOURCES_LIST, Some(sources), 0o644),
            ("/bin/sh", Some("#!dash\n".to_owned()), 0o755),
        ];
        // an existing tree keeps its own files
        for (path, text, mode) in seed {
            let dest = rooted(&target, path);
            if let Some(text) = text.filter(|_| !self.fs.exists(&dest)) {
                self.fs.write_file(&dest, text, mode);
            }
        }

        self.unpack_all(&target, &mut db, &plan, out);
        let _ = writeln!(out, "I: success");
        0
    }

    pub(super) fn dpkg_buildpackage(&mut self, _args: &[String], out: &mut String) -> i32 {
        if let Some(status) = self.require("dpkg-buildpackage", "dpkg-dev") {
            return status;
        }
        let cwd = self.cwd.clone();
        let read = |fs: &MockFs, name: &str| fs.read_string(&format!("{cwd}/debian/{name}"));
        let (Some(control), Some(changelog)) = (read(&*self.fs, "control"), read(&*self.fs, "changelog"))
        else {
            return self.tool_fail(
                "dpkg-source: error: cannot read debian/control or debian/changelog: No such file or directory",
                255,
            );
        };

        let stanzas = parse_control(&control);
        let Some((source, binaries)) = stanzas.split_first() else {
            return self.tool_fail("dpkg-buildpackage: error: empty debian/control", 255);
        };
        let version = changelog
            .lines()
            .next()
            .and_then(|l| l.split_once('('))
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(v, _)| v.to_owned());
        let Some(version) = version else {
            return self.tool_fail("dpkg-parsechangelog: error: badly formatted heading line", 255);
        };
        let _ = writeln!(
            out,
            "dpkg-buildpackage: info: source package {}\ndpkg-buildpackage: info: source version {version}",
            source.get("Source").map_or("", String::as_str)
        );

        let build_depends = source.get("Build-Depends").map_or("", String::as_str);
        let deps = match parse_depends(build_depends, self.world.arch) {
            Ok(deps) => deps,
            Err(e) => return self.tool_fail(format!("dpkg-checkbuilddeps: error: {e}"), 255),
        };
        let db = StatusDb::load(self.fs, "/");
        let unmet: Vec<String> = deps
            .iter()
            .filter(|d| !db.satisfies(d))
            .map(ToString::to_string)
            .collect();
        if !unmet.is_empty() {
            return self.tool_fail(
                format!(
                    "dpkg-checkbuilddeps: error: Unmet build dependencies: {}\n\
                     dpkg-buildpackage: warning: build dependencies/conflicts unsatisfied; aborting",
                    unmet.join(" ")
                ),
                3,
            );
        }

        let rules = read(&*self.fs, "rules").unwrap_or_default();
        for target in ["override_dh_auto_build", "override_dh_auto_install"] {
            let status = self.run_rule(&rules, target, &cwd, out);
            if status != 0 {
                return self.tool_fail(
                    format!(
                        "make: *** [debian/rules: {target}] Error {status}\n\
                         dpkg-buildpackage: error: debian/rules binary subprocess returned exit status 2"
                    ),
                    2,
                );
            }
        }

        if binaries.is_empty() {
            return self.tool_fail("dpkg-gencontrol: error: no binary packages in debian/control", 255);
        }
        let parent = normalize(&cwd, "..");
        for stanza in binaries {
            let Some(name) = stanza.get("Package") else {
                continue;
            };
            let architecture = match stanza.get("Architecture").map(String::as_str) {
                Some("all") => "all".to_owned(),
                _ => self.world.arch.to_owned(),
            };
            let depends = match parse_depends(
                stanza.get("Depends").map_or("", String::as_str),
                self.world.arch,
            ) {
                Ok(deps) => deps.iter().map(ToString::to_string).collect(),
                Err(e) => return self.tool_fail(format!("dpkg-gencontrol: error: {e}"), 255),
            };

            let staged = self.fs.subtree(&format!("{cwd}/debian/{name}"));
            let mut pkg = DebPackage::new(name, &version).arch(&architecture);
            pkg.depends = depends;
            for path in staged.paths() {
                let file = match staged.lstat(path) {
                    Some(Entry::File { mode, data }) => DebFile {
                        data: String::from_utf8_lossy(data).into_owned(),
                        mode: *mode,
                        link: None,
                    },
                    Some(Entry::Symlink { target }) => DebFile {
                        data: String::new(),
                        mode: 0o777,
                        link: Some(target.clone()),
                    },
                    _ => continue,
                };
                pkg.files.insert(path.to_owned(), file);
            }
            pkg.files.insert(
                format!("/usr/share/doc/{name}/changelog.Debian"),
                DebFile {
                    data: changelog.clone(),
                    mode: 0o644,
                    link: None,
                },
            );

            let archive = pkg.archive_name();
            self.fs
                .write_file(&format!("{parent}/{archive}"), pkg.to_archive(), 0o644);
            let _ = writeln!(out, "dpkg-deb: building package '{name}' in '../{archive}'.");
        }
        0
    }

    /// Run the recipe of `target` from a debian/rules makefile. A missing
    /// target is a no-op.
    fn run_rule(&mut self, rules: &str, target: &str, cwd: &str, out: &mut String) -> i32 {
        let header = format!("{target}:");
        let recipe: Vec<&str> = rules
            .lines()
            .skip_while(|l| !l.starts_with(&header))
            .skip(1)
            .take_while(|l| l.starts_with('\t'))
            .map(|l| l.trim_start_matches('\t').trim_start_matches(['@', '-']))
            .collect();
        for line in recipe {
            let _ = writeln!(out, "{line}");
            let status = self.run_in(cwd, line, out);
            if status != 0 {
                return status;
            }
        }
        0
    }
}
