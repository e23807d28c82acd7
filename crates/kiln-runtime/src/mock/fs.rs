//! In-memory filesystem used by the mock engine.

use kiln_schema::ContentDigest;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
    Symlink { target: String },
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir { .. })
    }

    pub fn mode(&self) -> u32 {
        match self {
            Entry::Dir { mode } | Entry::File { mode, .. } => *mode,
            Entry::Symlink { .. } => 0o777,
        }
    }
}

static ROOT_DIR: Entry = Entry::Dir { mode: 0o755 };

/// Flat map of absolute, normalized paths to entries. The root directory is
/// implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockFs {
    entries: BTreeMap<String, Entry>,
}

/// Normalize `path` against `cwd`: absolute, no `.`/`..`, no trailing slash.
pub fn normalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    prefix == "/" || path == prefix || path.starts_with(&format!("{prefix}/"))
}

/// Match `name` against a pattern where `*` matches any run of characters
/// and `?` matches one.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a host directory tree. `root` becomes `/`; symlink targets are
    /// kept as written, not followed.
    pub fn load_dir(root: &Path) -> io::Result<Self> {
        let mut loaded = Self::new();
        let mut pending = vec![(root.to_path_buf(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            for item in fs::read_dir(&dir)? {
                let item = item?;
                let path = format!("{prefix}/{}", item.file_name().to_string_lossy());
                let meta = fs::symlink_metadata(item.path())?;
                let mode = meta.permissions().mode() & 0o7777;
                if meta.file_type().is_symlink() {
                    let target = fs::read_link(item.path())?;
                    loaded.symlink(&path, &target.to_string_lossy());
                } else if meta.is_dir() {
                    loaded.insert(&path, Entry::Dir { mode });
                    pending.push((item.path(), path));
                } else {
                    loaded.write_file(&path, fs::read(item.path())?, mode);
                }
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn resolve(&self, path: &str) -> String {
        let mut current = normalize("/", path);
        for _ in 0..16 {
            match self.entries.get(&current) {
                Some(Entry::Symlink { target }) => {
                    let base = parent(&current).unwrap_or("/");
                    current = normalize(base, target);
                }
                _ => return current,
            }
        }
        current
    }

    /// Entry at `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> Option<&Entry> {
        let path = normalize("/", path);
        if path == "/" {
            return Some(&ROOT_DIR);
        }
        self.entries.get(&path)
    }

    /// Entry at `path`, following symlinks.
    pub fn stat(&self, path: &str) -> Option<&Entry> {
        let resolved = self.resolve(path);
        self.lstat(&resolved)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lstat(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.stat(path).is_some_and(Entry::is_dir)
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        match self.stat(path)? {
            Entry::File { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn read_string(&self, path: &str) -> Option<String> {
        self.read(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn mkdir_all(&mut self, path: &str, mode: u32) {
        let path = normalize("/", path);
        if path == "/" {
            return;
        }
        if let Some(p) = parent(&path) {
            self.mkdir_all(p, 0o755);
        }
        self.entries
            .entry(path)
            .or_insert(Entry::Dir { mode });
    }

    /// Insert an entry, creating missing parent directories.
    pub fn insert(&mut self, path: &str, entry: Entry) {
        let path = normalize("/", path);
        if path == "/" {
            return;
        }
        if let Some(p) = parent(&path) {
            self.mkdir_all(p, 0o755);
        }
        let keep_children =
            entry.is_dir() && self.entries.get(&path).is_some_and(Entry::is_dir);
        if !keep_children {
            self.remove(&path);
        }
        self.entries.insert(path, entry);
    }

    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>, mode: u32) {
        self.insert(
            path,
            Entry::File {
                mode,
                data: data.into(),
            },
        );
    }

    pub fn append_file(&mut self, path: &str, data: &[u8]) {
        let resolved = self.resolve(path);
        match self.entries.get_mut(&resolved) {
            Some(Entry::File { data: existing, .. }) => existing.extend_from_slice(data),
            _ => self.write_file(&resolved, data.to_vec(), 0o644),
        }
    }

    pub fn symlink(&mut self, path: &str, target: &str) {
        self.insert(
            path,
            Entry::Symlink {
                target: target.to_owned(),
            },
        );
    }

    pub fn set_mode(&mut self, path: &str, new_mode: u32) -> bool {
        let resolved = self.resolve(path);
        match self.entries.get_mut(&resolved) {
            Some(Entry::Dir { mode } | Entry::File { mode, .. }) => {
                *mode = new_mode;
                true
            }
            _ => false,
        }
    }

    fn remove_children(&mut self, path: &str) {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Remove `path` and everything under it. Returns whether anything existed.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize("/", path);
        let before = self.entries.len();
        self.remove_children(&path);
        self.entries.remove(&path);
        before != self.entries.len()
    }

    /// Names of the direct children of `dir`, sorted.
    pub fn list(&self, dir: &str) -> Vec<String> {
        let dir = self.resolve(dir);
        let prefix = if dir == "/" {
            "/".to_owned()
        } else {
            format!("{dir}/")
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    /// Expand a pattern whose final component may contain wildcards.
    pub fn glob(&self, pattern: &str) -> Vec<String> {
        let pattern = normalize("/", pattern);
        let (dir, name) = match pattern.rfind('/') {
            Some(0) => ("/", &pattern[1..]),
            Some(i) => (&pattern[..i], &pattern[i + 1..]),
            None => ("/", pattern.as_str()),
        };
        if !name.contains(['*', '?']) {
            return if self.exists(&pattern) {
                vec![pattern.clone()]
            } else {
                Vec::new()
            };
        }
        self.list(dir)
            .into_iter()
            .filter(|entry| wildcard_match(name, entry))
            .map(|entry| normalize(dir, &entry))
            .collect()
    }

    /// Copy of everything under `prefix`, re-rooted at `/`.
    pub fn subtree(&self, prefix: &str) -> MockFs {
        let prefix = normalize("/", prefix);
        if prefix == "/" {
            return self.clone();
        }
        let mut out = MockFs::new();
        for (path, entry) in &self.entries {
            if path != &prefix && is_under(path, &prefix) {
                out.entries
                    .insert(path[prefix.len()..].to_owned(), entry.clone());
            }
        }
        out
    }

    /// Remove and return everything under `prefix`, including `prefix` itself
    /// when it is a file or symlink.
    pub fn take(&mut self, prefix: &str) -> Mounted {
        let prefix = normalize("/", prefix);
        let single = match self.entries.get(&prefix) {
            Some(Entry::Dir { .. }) | None => None,
            Some(other) => Some(other.clone()),
        };
        if let Some(entry) = single {
            self.entries.remove(&prefix);
            return Mounted::File(entry);
        }
        let tree = self.subtree(&prefix);
        let existed = self.entries.contains_key(&prefix) || !tree.is_empty();
        if prefix == "/" {
            self.entries.clear();
        } else {
            self.remove(&prefix);
        }
        if existed {
            Mounted::Tree(tree)
        } else {
            Mounted::Absent
        }
    }

    /// Place `content` at `prefix`.
    pub fn graft(&mut self, prefix: &str, content: &Mounted) {
        match content {
            Mounted::Absent => {}
            Mounted::File(entry) => self.insert(prefix, entry.clone()),
            Mounted::Tree(tree) => {
                self.mkdir_all(prefix, 0o755);
                let base = normalize("/", prefix);
                for (path, entry) in &tree.entries {
                    let dest = if base == "/" {
                        path.clone()
                    } else {
                        format!("{base}{path}")
                    };
                    self.entries.insert(dest, entry.clone());
                }
            }
        }
    }

    /// Select `selector` inside this filesystem for mounting.
    pub fn select(&self, selector: Option<&str>) -> Mounted {
        match selector {
            None => Mounted::Tree(self.clone()),
            Some(sel) => match self.lstat(sel) {
                Some(Entry::Dir { .. }) => Mounted::Tree(self.subtree(sel)),
                Some(entry) => Mounted::File(entry.clone()),
                None => Mounted::Absent,
            },
        }
    }

    pub fn digest(&self) -> ContentDigest {
        let mut hasher = blake3::Hasher::new();
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            match entry {
                Entry::Dir { mode } => {
                    hasher.update(b"d");
                    hasher.update(&mode.to_le_bytes());
                }
                Entry::File { mode, data } => {
                    hasher.update(b"f");
                    hasher.update(&mode.to_le_bytes());
                    hasher.update(&(data.len() as u64).to_le_bytes());
                    hasher.update(data);
                }
                Entry::Symlink { target } => {
                    hasher.update(b"l");
                    hasher.update(target.as_bytes());
                }
            }
            hasher.update(&[0]);
        }
        ContentDigest::new(hasher.finalize().to_hex().to_string())
    }
}

/// Content placed at a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mounted {
    Absent,
    File(Entry),
    Tree(MockFs),
}

impl Mounted {
    pub fn into_fs(self) -> MockFs {
        match self {
            Mounted::Tree(fs) => fs,
            Mounted::Absent | Mounted::File(_) => MockFs::new(),
        }
    }
}
