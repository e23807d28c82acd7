//! Canned Ubuntu images and archive contents for the mock engine.

use super::deb::{DebPackage, PackageIndex, StatusDb};
use super::fs::MockFs;
use super::tools::LISTS_DIR;

pub const UBUNTU_MIRROR: &str = "http://archive.ubuntu.com/ubuntu";

/// Packages preinstalled in the stock images.
const BASE_SYSTEM: &[(&str, &str)] = &[
    ("apt", "2.4.5"),
    ("base-files", "12ubuntu4"),
    ("base-passwd", "3.5.52build1"),
    ("bash", "5.1-6ubuntu1"),
    ("coreutils", "8.32-4.1ubuntu1"),
    ("dash", "0.5.11+git20210903+057cd650a4ed-3build1"),
    ("dpkg", "1.21.1ubuntu2.1"),
    ("libc6", "2.35-0ubuntu3.1"),
];

/// A minimal Ubuntu container filesystem: os-release, apt sources pointing at
/// the mirror, the docker dpkg excludes and a status database. Package lists
/// are empty until `apt update` runs.
pub fn ubuntu_image(codename: &str, version_id: &str) -> MockFs {
    let mut fs = MockFs::new();
    fs.write_file(
        "/etc/os-release",
        format!(
            "PRETTY_NAME=\"Ubuntu {version_id}\"\nNAME=\"Ubuntu\"\nVERSION_ID=\"{version_id}\"\n\
             VERSION_CODENAME={codename}\nID=ubuntu\nID_LIKE=debian\n"
        ),
        0o644,
    );
    fs.write_file(
        "/etc/apt/sources.list",
        format!("deb {UBUNTU_MIRROR} {codename} main universe\n"),
        0o644,
    );
    fs.mkdir_all("/etc/apt/sources.list.d", 0o755);
    fs.write_file(
        "/etc/dpkg/dpkg.cfg.d/excludes",
        "path-exclude=/usr/share/doc/*\npath-include=/usr/share/doc/*/copyright\n",
        0o644,
    );
    fs.write_file("/bin/sh", "#!dash\n", 0o755);
    fs.mkdir_all("/tmp", 0o1777);
    fs.mkdir_all("/root", 0o700);
    fs.mkdir_all(LISTS_DIR, 0o755);
    fs.mkdir_all("/var/cache/apt/archives", 0o755);

    let mut db = StatusDb::default();
    for (name, version) in BASE_SYSTEM {
        db.unpack(&mut fs, "/", &DebPackage::new(name, version).arch("amd64"));
    }
    db.save(&mut fs, "/");
    fs
}

fn tool(name: &str, version: &str, bin: &str) -> DebPackage {
    DebPackage::new(name, version)
        .arch("amd64")
        .with_file(bin, &format!("#!/bin/sh\n# {name}\n"), 0o755)
        .with_file(&format!("/usr/share/doc/{name}/copyright"), "", 0o644)
}

/// What the Ubuntu mirror serves: the builder toolchain, bootstrap tools,
/// the implicit base and systemd packages, and a few common utilities.
pub fn ubuntu_archive() -> PackageIndex {
    let mut index = PackageIndex::new();
    for (name, version) in BASE_SYSTEM {
        index.add(DebPackage::new(name, version).arch("amd64"));
    }
    index.add(tool("aptitude", "0.8.13-3ubuntu1", "/usr/bin/aptitude").depends_on("apt (>= 2.0)"));
    index.add(
        tool("dpkg-dev", "1.21.1ubuntu2.1", "/usr/bin/dpkg-buildpackage")
            .depends_on("dpkg (>= 1.21)")
            .depends_on("make"),
    );
    index.add(tool("make", "4.3-4.1build1", "/usr/bin/make"));
    index.add(tool("devscripts", "2.22.1ubuntu1", "/usr/bin/debuild").depends_on("dpkg-dev"));
    index.add(tool("equivs", "2.3.1", "/usr/bin/equivs-build").depends_on("devscripts"));
    index.add(tool("fakeroot", "1.28-1ubuntu1", "/usr/bin/fakeroot"));
    index.add(tool("dh-make", "2.202102", "/usr/bin/dh_make"));
    index.add(
        DebPackage::new("build-essential", "12.9ubuntu3")
            .arch("amd64")
            .depends_on("dpkg-dev (>= 1.17.11)")
            .depends_on("make"),
    );
    index.add(tool("dh-apparmor", "3.0.4-2ubuntu2.1", "/usr/bin/dh_apparmor"));
    index.add(tool("dh-exec", "0.23.4build2", "/usr/bin/dh-exec"));
    index.add(tool("debhelper", "13.6ubuntu1", "/usr/bin/dh"));
    for compat in ["10", "11", "12", "13"] {
        index.add(DebPackage::new("debhelper-compat", compat).depends_on("debhelper"));
    }

    index.add(tool("apt-utils", "2.4.5", "/usr/bin/apt-ftparchive").depends_on("apt (= 2.4.5)"));
    index.add(tool("mmdebstrap", "0.8.4-1", "/usr/bin/mmdebstrap").depends_on("apt"));

    index.add(DebPackage::new("usrmerge", "25ubuntu2").with_file("/usr/lib/usrmerge/convert-usrmerge", "", 0o755));
    index.add(tool("init-system-helpers", "1.62", "/usr/bin/deb-systemd-helper"));
    index.add(tool("systemctl", "1.4.4181-1.1", "/usr/bin/systemctl"));

    index.add(tool("curl", "7.81.0-1ubuntu1.4", "/usr/bin/curl").depends_on("libcurl4 (= 7.81.0-1ubuntu1.4)"));
    index.add(
        DebPackage::new("libcurl4", "7.81.0-1ubuntu1.4")
            .arch("amd64")
            .with_file("/usr/lib/x86_64-linux-gnu/libcurl.so.4", "", 0o644),
    );
    index
}

/// The mirror plus a library whose newest release is uninstallable:
/// `libbar-dev` 3.0 needs `libbaz (>= 5.0)` which does not exist, 2.5 works
/// with `libbaz` 4.0.
pub fn pinning_archive() -> PackageIndex {
    ubuntu_archive()
        .with(
            DebPackage::new("libbar-dev", "3.0")
                .depends_on("libbaz (>= 5.0)")
                .with_file("/usr/include/bar.h", "#define BAR_VERSION 3\n", 0o644),
        )
        .with(
            DebPackage::new("libbar-dev", "2.5")
                .depends_on("libbaz (>= 4.0)")
                .with_file("/usr/include/bar.h", "#define BAR_VERSION 25\n", 0o644),
        )
        .with(
            DebPackage::new("libbar-dev", "1.0")
                .with_file("/usr/include/bar.h", "#define BAR_VERSION 1\n", 0o644),
        )
        .with(DebPackage::new("libbaz", "4.0").with_file("/usr/lib/libbaz.so.4", "", 0o644))
}
