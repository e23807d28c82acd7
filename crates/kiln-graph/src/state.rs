//! Build graph construction.
//!
//! A [`State`] names one output of one node. Nodes are immutable and shared
//! through `Arc`, so deriving a new state never affects the states it was
//! derived from. Each node's digest is computed once, at construction, from
//! its operation and the digests of its inputs.

use crate::op::{CacheSharing, ExecOp, FileAction, FileOp, Mount, MountKind, Op, Security};
use crate::GraphError;
use kiln_schema::ContentDigest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Reference to one output of a node, by digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub digest: ContentDigest,
    pub output: usize,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.digest.short(), self.output)
    }
}

#[derive(Debug)]
pub struct Node {
    op: Op,
    inputs: Vec<State>,
    digest: ContentDigest,
    group: Option<String>,
}

#[derive(Serialize)]
struct DigestRecord<'a> {
    op: &'a Op,
    inputs: Vec<Option<OutputRef>>,
}

impl Node {
    fn new(op: Op, inputs: Vec<State>, group: Option<String>) -> Arc<Self> {
        let digest = node_digest(&op, &inputs.iter().map(State::output_ref).collect::<Vec<_>>());
        Arc::new(Self {
            op,
            inputs,
            digest,
            group,
        })
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[State] {
        &self.inputs
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    /// Progress group label. Not part of the digest.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

pub(crate) fn node_digest(op: &Op, inputs: &[Option<OutputRef>]) -> ContentDigest {
    let record = DigestRecord {
        op,
        inputs: inputs.to_vec(),
    };
    let mut hasher = blake3::Hasher::new();
    // Serializing plain data with ordered maps cannot fail.
    if let Ok(bytes) = serde_json::to_vec(&record) {
        hasher.update(&bytes);
    }
    ContentDigest::new(hasher.finalize().to_hex().to_string())
}

/// One filesystem state in the graph: scratch, or an output of a node.
#[derive(Debug, Clone, Default)]
pub struct State {
    output: Option<(Arc<Node>, usize)>,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.output_ref() == other.output_ref()
    }
}

impl Eq for State {}

impl State {
    /// The empty filesystem.
    pub fn scratch() -> Self {
        Self::default()
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self::from_node(
            Node::new(
                Op::Image {
                    reference: reference.into(),
                },
                Vec::new(),
                None,
            ),
            0,
        )
    }

    pub fn context(name: impl Into<String>) -> Self {
        Self::from_node(
            Node::new(Op::Context { name: name.into() }, Vec::new(), None),
            0,
        )
    }

    fn from_node(node: Arc<Node>, index: usize) -> Self {
        Self {
            output: Some((node, index)),
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.output.is_none()
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.output.as_ref().map(|(node, _)| node)
    }

    pub fn output_ref(&self) -> Option<OutputRef> {
        self.output.as_ref().map(|(node, index)| OutputRef {
            digest: node.digest.clone(),
            output: *index,
        })
    }

    /// Run a command with this state as the root filesystem.
    pub fn run(&self, run: Run) -> ExecState {
        let mut inputs = vec![self.clone()];
        let mut mounts = Vec::with_capacity(run.mounts.len());
        let mut next_output = 1;

        for m in run.mounts {
            let kind = match m.source {
                RunSource::Bind(state) => {
                    inputs.push(state);
                    MountKind::Bind {
                        input: inputs.len() - 1,
                    }
                }
                RunSource::Cache { id, sharing } => MountKind::Cache { id, sharing },
                RunSource::Tmpfs => MountKind::Tmpfs,
            };
            let output = if matches!(kind, MountKind::Bind { .. }) && !m.readonly {
                next_output += 1;
                Some(next_output - 1)
            } else {
                None
            };
            mounts.push(Mount {
                dest: m.dest,
                kind,
                readonly: m.readonly,
                selector: m.selector,
                output,
            });
        }

        let op = Op::Exec(ExecOp {
            args: run.args,
            env: run.env,
            cwd: run.cwd,
            mounts,
            security: run.security,
            diagnostics: run.diagnostics,
        });

        ExecState {
            node: Node::new(op, inputs, run.group),
        }
    }

    /// Apply file actions on top of this state.
    pub fn file(&self, files: Files) -> State {
        let op = Op::File(FileOp {
            actions: files.actions,
        });
        State::from_node(Node::new(op, vec![self.clone()], files.group), 0)
    }

    /// Apply a transform, for chaining optional stages.
    pub fn with(self, f: impl FnOnce(State) -> State) -> State {
        f(self)
    }
}

/// Result of [`State::run`]: the root output plus one output per writable bind mount.
#[derive(Debug, Clone)]
pub struct ExecState {
    node: Arc<Node>,
}

impl ExecState {
    pub fn root(&self) -> State {
        State::from_node(self.node.clone(), 0)
    }

    /// The contents of a writable bind mount after the command ran.
    pub fn mount_output(&self, dest: &str) -> Result<State, GraphError> {
        let Op::Exec(exec) = &self.node.op else {
            return Err(GraphError::NoSuchMount(dest.to_owned()));
        };
        let mount = exec
            .mounts
            .iter()
            .find(|m| m.dest == dest)
            .ok_or_else(|| GraphError::NoSuchMount(dest.to_owned()))?;
        match mount.output {
            Some(index) => Ok(State::from_node(self.node.clone(), index)),
            None => Err(GraphError::MountWithoutOutput(dest.to_owned())),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

#[derive(Debug)]
enum RunSource {
    Bind(State),
    Cache { id: String, sharing: CacheSharing },
    Tmpfs,
}

#[derive(Debug)]
struct RunMount {
    dest: String,
    source: RunSource,
    readonly: bool,
    selector: Option<String>,
}

/// Builder for an exec node.
#[derive(Debug, Default)]
pub struct Run {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<String>,
    mounts: Vec<RunMount>,
    security: Security,
    diagnostics: Vec<String>,
    group: Option<String>,
}

impl Run {
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `/bin/sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["/bin/sh".to_owned(), "-c".to_owned(), script.into()])
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn push_bind(mut self, dest: &str, state: &State, readonly: bool, selector: Option<&str>) -> Self {
        self.mounts.push(RunMount {
            dest: dest.to_owned(),
            source: RunSource::Bind(state.clone()),
            readonly,
            selector: selector.map(str::to_owned),
        });
        self
    }

    /// Writable bind mount; its contents afterwards are available through
    /// [`ExecState::mount_output`].
    pub fn mount(self, dest: &str, state: &State) -> Self {
        self.push_bind(dest, state, false, None)
    }

    pub fn mount_readonly(self, dest: &str, state: &State) -> Self {
        self.push_bind(dest, state, true, None)
    }

    /// Mount `selector` from `state` at `dest`.
    pub fn mount_path(self, dest: &str, state: &State, selector: &str, readonly: bool) -> Self {
        self.push_bind(dest, state, readonly, Some(selector))
    }

    pub fn cache(mut self, dest: &str, id: impl Into<String>, sharing: CacheSharing) -> Self {
        self.mounts.push(RunMount {
            dest: dest.to_owned(),
            source: RunSource::Cache {
                id: id.into(),
                sharing,
            },
            readonly: false,
            selector: None,
        });
        self
    }

    pub fn tmpfs(mut self, dest: &str) -> Self {
        self.mounts.push(RunMount {
            dest: dest.to_owned(),
            source: RunSource::Tmpfs,
            readonly: false,
            selector: None,
        });
        self
    }

    pub fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn diagnostic(mut self, command: impl Into<String>) -> Self {
        self.diagnostics.push(command.into());
        self
    }

    pub fn group(mut self, label: impl Into<String>) -> Self {
        self.group = Some(label.into());
        self
    }
}

/// Builder for a file node.
#[derive(Debug, Default)]
pub struct Files {
    actions: Vec<FileAction>,
    group: Option<String>,
}

impl Files {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mkfile(mut self, path: impl Into<String>, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        self.actions.push(FileAction::Mkfile {
            path: path.into(),
            mode,
            data: data.into(),
        });
        self
    }

    pub fn mkdir(mut self, path: impl Into<String>, mode: u32) -> Self {
        self.actions.push(FileAction::Mkdir {
            path: path.into(),
            mode,
            parents: true,
        });
        self
    }

    pub fn group(mut self, label: impl Into<String>) -> Self {
        self.group = Some(label.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_graphs_share_digests() {
        let a = State::image("ubuntu:jammy").run(Run::shell("apt update")).root();
        let b = State::image("ubuntu:jammy").run(Run::shell("apt update")).root();
        assert_eq!(a, b);
        assert_ne!(a, State::image("ubuntu:focal").run(Run::shell("apt update")).root());
    }

    #[test]
    fn group_is_not_part_of_digest() {
        let base = State::image("ubuntu:jammy");
        let a = base.run(Run::shell("true").group("one")).root();
        let b = base.run(Run::shell("true").group("two")).root();
        assert_eq!(a.output_ref(), b.output_ref());
    }

    #[test]
    fn env_changes_digest() {
        let base = State::image("ubuntu:jammy");
        let a = base.run(Run::shell("true").env("A", "1")).root();
        let b = base.run(Run::shell("true").env("A", "2")).root();
        assert_ne!(a, b);
    }

    #[test]
    fn writable_mounts_get_outputs() {
        let base = State::image("ubuntu:jammy");
        let pkg = State::scratch().file(Files::new().mkfile("a.deb", 0o644, "x"));
        let exec = base.run(
            Run::shell("true")
                .mount_readonly("/tmp/pkg", &pkg)
                .cache("/var/cache/apt", "jammy-var-cache-apt", CacheSharing::Shared)
                .mount("/tmp/rootfs", &State::scratch()),
        );

        let out = exec.mount_output("/tmp/rootfs").unwrap();
        assert_eq!(out.output_ref().unwrap().output, 1);
        assert!(matches!(
            exec.mount_output("/tmp/pkg"),
            Err(GraphError::MountWithoutOutput(_))
        ));
        assert!(matches!(
            exec.mount_output("/nope"),
            Err(GraphError::NoSuchMount(_))
        ));
        assert_eq!(exec.root().output_ref().unwrap().output, 0);
    }

    #[test]
    fn scratch_has_no_node() {
        let s = State::scratch();
        assert!(s.is_scratch());
        assert!(s.output_ref().is_none());
        assert_eq!(s, State::default());
    }

    #[test]
    fn with_applies_transform() {
        let base = State::image("ubuntu:jammy");
        let same = base.clone().with(|s| s);
        assert_eq!(base, same);
    }
}
