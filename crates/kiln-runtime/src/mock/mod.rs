//! In-process [`BuildEngine`] over an in-memory filesystem.
//!
//! Image and context nodes load registered filesystems, file nodes apply
//! their actions, and exec nodes run their command through [`shell::Shell`]
//! with mounts grafted into the root. Results are memoised per node digest,
//! cache mounts persist across solves, and the simulated apt tooling draws
//! remote packages from a [`deb::PackageIndex`].

pub mod deb;
pub mod fixtures;
pub mod fs;
pub mod shell;
pub mod solver;
pub mod tools;

use crate::backend::{BuildEngine, ExecOutput, ExecRequest, FileStat, ImageMetaResolver, SolvedRef};
use crate::image::{FOCAL, JAMMY};
use crate::image_config::{ImageConfig, Platform};
use crate::RuntimeError;
use deb::PackageIndex;
use fs::{Entry, MockFs, Mounted};
use kiln_graph::{Definition, ExecOp, FileAction, FileOp, MountKind, Op};
use kiln_schema::ContentDigest;
use shell::{Shell, World};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RuntimeError> {
    mutex
        .lock()
        .map_err(|e| RuntimeError::Engine(format!("mutex poisoned: {e}")))
}

#[derive(Debug)]
pub struct MockEngine {
    images: BTreeMap<String, MockFs>,
    contexts: BTreeMap<String, MockFs>,
    image_configs: BTreeMap<String, Vec<u8>>,
    archive: PackageIndex,
    platform: Platform,
    memo: Mutex<HashMap<ContentDigest, Arc<Vec<MockFs>>>>,
    caches: Mutex<HashMap<String, MockFs>>,
    solved: Mutex<HashMap<ContentDigest, MockFs>>,
    executions: AtomicUsize,
    exec_requests: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            contexts: BTreeMap::new(),
            image_configs: BTreeMap::new(),
            archive: PackageIndex::new(),
            platform: Platform::default(),
            memo: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            solved: Mutex::new(HashMap::new()),
            executions: AtomicUsize::new(0),
            exec_requests: AtomicUsize::new(0),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock jammy and focal images served by the Ubuntu mirror.
    pub fn ubuntu() -> Self {
        Self::new()
            .with_image(JAMMY.image_ref, fixtures::ubuntu_image("jammy", "22.04"))
            .with_image(FOCAL.image_ref, fixtures::ubuntu_image("focal", "20.04"))
            .with_archive(fixtures::ubuntu_archive())
    }

    pub fn with_image(mut self, reference: impl Into<String>, root: MockFs) -> Self {
        self.images.insert(reference.into(), root);
        self
    }

    pub fn with_context(mut self, name: impl Into<String>, root: MockFs) -> Self {
        self.contexts.insert(name.into(), root);
        self
    }

    pub fn with_image_config(mut self, reference: impl Into<String>, config: Vec<u8>) -> Self {
        self.image_configs.insert(reference.into(), config);
        self
    }

    /// Replace what remote apt sources serve.
    pub fn with_archive(mut self, archive: PackageIndex) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Exec nodes run so far, failed ones included.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Calls to [`BuildEngine::exec`] so far.
    pub fn exec_requests(&self) -> usize {
        self.exec_requests.load(Ordering::SeqCst)
    }

    /// Current contents of a cache mount.
    pub fn cache(&self, id: &str) -> Result<Option<MockFs>, RuntimeError> {
        Ok(lock(&self.caches)?.get(id).cloned())
    }

    /// The filesystem behind a solved reference.
    pub fn filesystem(&self, solved: &SolvedRef) -> Result<MockFs, RuntimeError> {
        lock(&self.solved)?
            .get(&solved.content)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownRef(solved.content.to_string()))
    }

    fn world(&self) -> World<'_> {
        World {
            archive: &self.archive,
            arch: &self.platform.architecture,
        }
    }

    fn evaluate(
        &self,
        digest: &ContentDigest,
        op: &Op,
        inputs: &[MockFs],
    ) -> Result<Vec<MockFs>, RuntimeError> {
        match op {
            Op::Image { reference } => self
                .images
                .get(reference)
                .cloned()
                .map(|root| vec![root])
                .ok_or_else(|| RuntimeError::ImageNotFound(reference.clone())),
            Op::Context { name } => self
                .contexts
                .get(name)
                .cloned()
                .map(|root| vec![root])
                .ok_or_else(|| RuntimeError::Context {
                    name: name.clone(),
                    reason: "not registered with the engine".to_owned(),
                }),
            Op::File(file) => Ok(vec![apply_file(
                inputs.first().cloned().unwrap_or_default(),
                file,
            )]),
            Op::Exec(exec) => self.run_exec(digest, exec, inputs),
        }
    }

    fn run_exec(
        &self,
        digest: &ContentDigest,
        exec: &ExecOp,
        inputs: &[MockFs],
    ) -> Result<Vec<MockFs>, RuntimeError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let mut caches = lock(&self.caches)?;
        let mut root = inputs.first().cloned().unwrap_or_default();
        let mut saved = Vec::with_capacity(exec.mounts.len());
        let mut mount_table = vec!["overlay on / type overlay (rw)".to_owned()];

        for mount in &exec.mounts {
            let (content, source) = match &mount.kind {
                MountKind::Bind { input } => {
                    let fs = inputs.get(*input).ok_or_else(|| {
                        RuntimeError::Engine(format!("mount {} refers to missing input {input}", mount.dest))
                    })?;
                    let selected = fs.select(mount.selector.as_deref());
                    if selected == Mounted::Absent {
                        return Err(RuntimeError::Engine(format!(
                            "mount {}: source path {} does not exist",
                            mount.dest,
                            mount.selector.as_deref().unwrap_or("/")
                        )));
                    }
                    (selected, "none type bind".to_owned())
                }
                MountKind::Cache { id, .. } => (
                    Mounted::Tree(caches.get(id).cloned().unwrap_or_default()),
                    format!("cache:{id} type bind"),
                ),
                MountKind::Tmpfs => (Mounted::Tree(MockFs::new()), "tmpfs type tmpfs".to_owned()),
            };
            let (device, kind) = source.split_once(' ').unwrap_or((source.as_str(), ""));
            mount_table.push(format!(
                "{device} on {} {kind} ({})",
                mount.dest,
                if mount.readonly { "ro" } else { "rw" }
            ));
            saved.push(root.take(&mount.dest));
            root.graft(&mount.dest, &content);
        }
        if let Some(cwd) = &exec.cwd {
            root.mkdir_all(cwd, 0o755);
        }

        let mut env = exec.env.clone();
        env.entry("PATH".to_owned())
            .or_insert_with(|| DEFAULT_PATH.to_owned());
        let mut shell = Shell::new(&mut root, self.world())
            .with_env(&env)
            .with_cwd(exec.cwd.as_deref())
            .with_mounts(mount_table.clone());
        let status = shell.run_args(&exec.args);
        let (stdout, stderr) = shell.output();

        if status != 0 {
            let diagnostics = (!exec.diagnostics.is_empty()).then(|| {
                let mut report = String::new();
                for command in &exec.diagnostics {
                    let mut shell = Shell::new(&mut root, self.world())
                        .with_env(&env)
                        .with_mounts(mount_table.clone());
                    let code = shell.run_script(command);
                    let (out, err) = shell.output();
                    let _ = writeln!(report, "$ {command} (exit {code})\n{out}{err}");
                }
                report
            });
            tracing::debug!("exec {} failed with status {status}", digest.short());
            return Err(RuntimeError::ExecFailed {
                digest: digest.to_string(),
                command: exec.args.join(" "),
                status,
                output: format!("{stdout}{stderr}"),
                diagnostics,
            });
        }

        let count = 1 + exec.mounts.iter().filter_map(|m| m.output).max().unwrap_or(0);
        let mut outputs = vec![MockFs::new(); count];
        for (mount, previous) in exec.mounts.iter().zip(saved).rev() {
            let content = root.take(&mount.dest);
            match &mount.kind {
                MountKind::Cache { id, .. } => {
                    caches.insert(id.clone(), content.into_fs());
                }
                MountKind::Bind { .. } => {
                    if let Some(slot) = mount.output.and_then(|i| outputs.get_mut(i)) {
                        *slot = content.into_fs();
                    }
                }
                MountKind::Tmpfs => {}
            }
            root.graft(&mount.dest, &previous);
        }
        outputs[0] = root;
        Ok(outputs)
    }
}

fn apply_file(mut root: MockFs, file: &FileOp) -> MockFs {
    for action in &file.actions {
        match action {
            FileAction::Mkfile { path, mode, data } => root.write_file(path, data.clone(), *mode),
            FileAction::Mkdir { path, mode, .. } => root.mkdir_all(path, *mode),
        }
    }
    root
}

impl BuildEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn solve(&self, definition: &Definition) -> Result<SolvedRef, RuntimeError> {
        definition.verify()?;
        let mut memo = lock(&self.memo)?;
        let mut results: HashMap<&ContentDigest, Arc<Vec<MockFs>>> = HashMap::new();

        for node in &definition.nodes {
            if let Some(outputs) = memo.get(&node.digest) {
                results.insert(&node.digest, Arc::clone(outputs));
                continue;
            }
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let fs = match input {
                    None => MockFs::new(),
                    Some(r) => results
                        .get(&r.digest)
                        .and_then(|outs| outs.get(r.output))
                        .cloned()
                        .ok_or_else(|| RuntimeError::Engine(format!("input {r} was not evaluated")))?,
                };
                inputs.push(fs);
            }
            let outputs = Arc::new(self.evaluate(&node.digest, &node.op, &inputs)?);
            memo.insert(node.digest.clone(), Arc::clone(&outputs));
            results.insert(&node.digest, outputs);
        }

        let root = match &definition.root {
            None => MockFs::new(),
            Some(r) => results
                .get(&r.digest)
                .and_then(|outs| outs.get(r.output))
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownRef(r.to_string()))?,
        };
        let content = root.digest();
        lock(&self.solved)?.insert(content.clone(), root);
        Ok(SolvedRef {
            definition: definition.digest(),
            content,
        })
    }

    fn read_file(&self, solved: &SolvedRef, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.filesystem(solved)?
            .read(path)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| RuntimeError::FileNotFound(path.to_owned()))
    }

    fn stat(&self, solved: &SolvedRef, path: &str) -> Result<Option<FileStat>, RuntimeError> {
        let root = self.filesystem(solved)?;
        let is_symlink = matches!(root.lstat(path), Some(Entry::Symlink { .. }));
        Ok(root.stat(path).map(|entry| FileStat {
            is_dir: entry.is_dir(),
            is_symlink,
            mode: entry.mode() & 0o7777,
        }))
    }

    fn read_dir(&self, solved: &SolvedRef, path: &str) -> Result<Vec<String>, RuntimeError> {
        let root = self.filesystem(solved)?;
        if !root.is_dir(path) {
            return Err(RuntimeError::FileNotFound(path.to_owned()));
        }
        Ok(root.list(path))
    }

    fn exec(&self, solved: &SolvedRef, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        self.exec_requests.fetch_add(1, Ordering::SeqCst);
        let mut root = self.filesystem(solved)?;
        let mut env = request.env.clone();
        env.entry("PATH".to_owned())
            .or_insert_with(|| DEFAULT_PATH.to_owned());
        let mut shell = Shell::new(&mut root, self.world())
            .with_env(&env)
            .with_cwd(request.cwd.as_deref());
        let status = shell.run_args(&request.args);
        let (stdout, stderr) = shell.output();
        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }
}

impl ImageMetaResolver for MockEngine {
    fn resolve_image_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<Vec<u8>, RuntimeError> {
        if let Some(config) = self.image_configs.get(reference) {
            return Ok(config.clone());
        }
        if !self.images.contains_key(reference) {
            return Err(RuntimeError::ImageNotFound(reference.to_owned()));
        }
        let mut config = ImageConfig::default();
        config.set_platform(platform);
        config.config.env = vec![format!("PATH={DEFAULT_PATH}")];
        config.config.cmd = Some(vec!["/bin/bash".to_owned()]);
        Ok(config.to_json()?.into_bytes())
    }
}
