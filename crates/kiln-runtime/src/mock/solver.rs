//! Dependency resolution for the simulated apt tools.
//!
//! Two strategies mirror the real tools. [`apt_plan`] always takes the newest
//! candidate of every dependency and gives up if that candidate violates a
//! constraint. [`aptitude_fix`] searches older candidates too, newest first,
//! and when no assignment exists it either removes the broken packages or,
//! if a hint rejects their removal, fails.

use super::deb::{DebPackage, Dependency, PackageIndex, StatusDb};
use kiln_schema::DebVersion;
use std::collections::{BTreeMap, VecDeque};

const SEARCH_BUDGET: usize = 10_000;

#[derive(Debug, Clone)]
pub enum Request {
    /// A local archive given by path.
    Archive(DebPackage),
    /// `name` or `name=version`.
    Named(Dependency),
}

fn unmet_report(problems: &[String]) -> String {
    format!(
        "Some packages could not be installed.\n\
         The following packages have unmet dependencies:\n{}\n\
         E: Unable to correct problems, you have held broken packages.",
        problems.join("\n")
    )
}

/// Packages `apt-get install` would unpack for `requests`.
pub fn apt_plan(
    index: &PackageIndex,
    db: &StatusDb,
    requests: &[Request],
    arch: &str,
) -> Result<Vec<DebPackage>, String> {
    let mut plan: BTreeMap<String, (DebPackage, DebVersion)> = BTreeMap::new();
    let mut queue: VecDeque<(String, Dependency)> = VecDeque::new();

    for request in requests {
        match request {
            Request::Archive(pkg) => {
                let version = pkg.deb_version()?;
                for dep in pkg.dependencies(arch)? {
                    queue.push_back((pkg.package.clone(), dep));
                }
                plan.insert(pkg.package.clone(), (pkg.clone(), version));
            }
            Request::Named(dep) => {
                if plan.contains_key(&dep.name) {
                    continue;
                }
                let candidates = index.candidates(&dep.name);
                if candidates.is_empty() {
                    return Err(format!("E: Unable to locate package {}", dep.name));
                }
                let Some((pkg, version)) = candidates.into_iter().find(|(_, v)| dep.accepts(v))
                else {
                    return Err(format!("E: Version '{dep}' was not found"));
                };
                let current = db.get(&dep.name).and_then(|p| p.deb_version());
                if current.as_ref() == Some(&version) {
                    continue;
                }
                for d in pkg.dependencies(arch)? {
                    queue.push_back((pkg.package.clone(), d));
                }
                plan.insert(pkg.package.clone(), (pkg.clone(), version));
            }
        }
    }

    let mut problems = Vec::new();
    while let Some((from, dep)) = queue.pop_front() {
        if let Some((_, version)) = plan.get(&dep.name) {
            if !dep.accepts(version) {
                problems.push(format!(
                    " {from} : Depends: {dep} but {version} is to be installed"
                ));
            }
            continue;
        }
        if db.satisfies(&dep) {
            continue;
        }
        match index.newest(&dep.name) {
            None => problems.push(format!(
                " {from} : Depends: {dep} but it is not installable"
            )),
            Some((_, version)) if !dep.accepts(&version) => problems.push(format!(
                " {from} : Depends: {dep} but {version} is to be installed"
            )),
            Some((pkg, version)) => {
                for d in pkg.dependencies(arch)? {
                    queue.push_back((pkg.package.clone(), d));
                }
                plan.insert(pkg.package.clone(), (pkg.clone(), version));
            }
        }
    }

    if problems.is_empty() {
        Ok(plan.into_values().map(|(pkg, _)| pkg).collect())
    } else {
        Err(unmet_report(&problems))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixAction {
    Nothing,
    Install(Vec<DebPackage>),
    Remove(Vec<String>),
}

type Chosen<'a> = BTreeMap<String, (&'a DebPackage, DebVersion)>;

struct Search<'a> {
    index: &'a PackageIndex,
    db: &'a StatusDb,
    arch: &'a str,
    steps: usize,
}

impl<'a> Search<'a> {
    fn met(&self, dep: &Dependency, chosen: &Chosen<'a>) -> bool {
        match chosen.get(&dep.name) {
            Some((_, v)) => dep.accepts(v),
            None => self.db.satisfies(dep),
        }
    }

    fn acceptable(&self, name: &str, version: &DebVersion, chosen: &Chosen<'a>) -> bool {
        let replaced: Vec<&str> = chosen.keys().map(String::as_str).collect();
        let from_installed = self.db.constraints_on(name, self.arch, &replaced);
        let from_chosen = chosen
            .values()
            .flat_map(|(pkg, _)| pkg.dependencies(self.arch).unwrap_or_default())
            .filter(|d| d.name == name);
        from_installed
            .into_iter()
            .chain(from_chosen)
            .all(|d| d.accepts(version))
    }

    fn solve(&mut self, pending: &[Dependency], chosen: &Chosen<'a>) -> Option<Chosen<'a>> {
        self.steps += 1;
        if self.steps > SEARCH_BUDGET {
            return None;
        }
        let Some(pos) = pending.iter().position(|d| !self.met(d, chosen)) else {
            return Some(chosen.clone());
        };
        let dep = &pending[pos];
        if chosen.contains_key(&dep.name) {
            return None;
        }

        let index = self.index;
        for (pkg, version) in index.candidates(&dep.name) {
            if !dep.accepts(&version) || !self.acceptable(&dep.name, &version, chosen) {
                continue;
            }
            let mut next = chosen.clone();
            next.insert(dep.name.clone(), (pkg, version));
            let mut more: Vec<Dependency> = pending[pos + 1..].to_vec();
            more.extend(pkg.dependencies(self.arch).unwrap_or_default());
            if let Some(found) = self.solve(&more, &next) {
                return Some(found);
            }
        }
        None
    }
}

/// `aptitude install -f`: repair broken installed packages. Packages named in
/// `reject_uninstall` must not be removed.
pub fn aptitude_fix(
    index: &PackageIndex,
    db: &StatusDb,
    arch: &str,
    reject_uninstall: &[String],
) -> Result<FixAction, String> {
    let broken = db.broken(arch);
    if broken.is_empty() {
        return Ok(FixAction::Nothing);
    }

    let pending: Vec<Dependency> = broken.iter().flat_map(|(_, deps)| deps.clone()).collect();
    let mut search = Search {
        index,
        db,
        arch,
        steps: 0,
    };
    if let Some(chosen) = search.solve(&pending, &BTreeMap::new()) {
        return Ok(FixAction::Install(
            chosen.into_values().map(|(pkg, _)| pkg.clone()).collect(),
        ));
    }

    let names: Vec<String> = broken.into_iter().map(|(name, _)| name).collect();
    if let Some(pinned) = names.iter().find(|n| reject_uninstall.contains(n)) {
        return Err(format!(
            "Unable to resolve dependencies for the upgrade: no solution keeps {pinned} installed\n\
             E: Unable to resolve dependencies! Giving up..."
        ));
    }
    Ok(FixAction::Remove(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fs::MockFs;

    /// libbar-dev 3.0 needs a libbaz that does not exist; 2.5 works.
    fn index() -> PackageIndex {
        PackageIndex::new()
            .with(DebPackage::new("libbar-dev", "3.0").depends_on("libbaz (>= 5.0)"))
            .with(DebPackage::new("libbar-dev", "2.5").depends_on("libbaz (>= 4.0)"))
            .with(DebPackage::new("libbar-dev", "1.0"))
            .with(DebPackage::new("libbaz", "4.0"))
    }

    fn meta() -> DebPackage {
        DebPackage::new("foo-deps", "1.0-1").depends_on("libbar-dev (>= 2.0)")
    }

    #[test]
    fn naive_plan_fails_on_broken_newest() {
        let err = apt_plan(
            &index(),
            &StatusDb::default(),
            &[Request::Archive(meta())],
            "amd64",
        )
        .unwrap_err();
        assert!(err.contains("libbar-dev : Depends: libbaz (>= 5.0) but 4.0 is to be installed"));
    }

    #[test]
    fn naive_plan_fails_on_upper_bound() {
        let pinned = DebPackage::new("foo-deps", "1.0-1").depends_on("libbar-dev (<< 3.0)");
        let err = apt_plan(
            &index(),
            &StatusDb::default(),
            &[Request::Archive(pinned)],
            "amd64",
        )
        .unwrap_err();
        assert!(err.contains("but 3.0 is to be installed"));
    }

    #[test]
    fn naive_plan_installs_newest_when_consistent() {
        let index = PackageIndex::new()
            .with(DebPackage::new("curl", "7.81").depends_on("libcurl4"))
            .with(DebPackage::new("libcurl4", "7.81"));
        let plan = apt_plan(
            &index,
            &StatusDb::default(),
            &[Request::Named(Dependency::any("curl"))],
            "amd64",
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn naive_plan_unknown_package() {
        let err = apt_plan(
            &index(),
            &StatusDb::default(),
            &[Request::Named(Dependency::any("nope"))],
            "amd64",
        )
        .unwrap_err();
        assert_eq!(err, "E: Unable to locate package nope");
    }

    #[test]
    fn aptitude_backtracks_to_older_candidate() {
        let mut fs = MockFs::new();
        let mut db = StatusDb::default();
        db.unpack(&mut fs, "/", &meta());

        let action = aptitude_fix(&index(), &db, "amd64", &["foo-deps".to_owned()]).unwrap();
        let FixAction::Install(pkgs) = action else {
            panic!("expected install, got {action:?}");
        };
        let chosen: Vec<(&str, &str)> = pkgs
            .iter()
            .map(|p| (p.package.as_str(), p.version.as_str()))
            .collect();
        assert_eq!(chosen, [("libbar-dev", "2.5"), ("libbaz", "4.0")]);
    }

    #[test]
    fn aptitude_removes_unsatisfiable_without_hint() {
        let mut fs = MockFs::new();
        let mut db = StatusDb::default();
        let impossible = DebPackage::new("foo-deps", "1.0-1").depends_on("libbar-dev (>= 9.0)");
        db.unpack(&mut fs, "/", &impossible);

        assert_eq!(
            aptitude_fix(&index(), &db, "amd64", &[]).unwrap(),
            FixAction::Remove(vec!["foo-deps".to_owned()])
        );
        let err = aptitude_fix(&index(), &db, "amd64", &["foo-deps".to_owned()]).unwrap_err();
        assert!(err.contains("foo-deps"));
    }

    #[test]
    fn aptitude_nothing_to_do() {
        assert_eq!(
            aptitude_fix(&index(), &StatusDb::default(), "amd64", &[]).unwrap(),
            FixAction::Nothing
        );
    }
}
