use crate::op::{ExecOp, Op};
use crate::state::{node_digest, Node, OutputRef, State};
use crate::GraphError;
use kiln_schema::ContentDigest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    pub digest: ContentDigest,
    pub op: Op,
    pub inputs: Vec<Option<OutputRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Serializable form of a graph: every reachable node exactly once, inputs
/// before the nodes that use them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub nodes: Vec<NodeDef>,
    /// `None` when the marshalled state is scratch.
    pub root: Option<OutputRef>,
}

impl State {
    pub fn marshal(&self) -> Definition {
        let mut nodes = Vec::new();
        let mut seen = BTreeSet::new();
        if let Some(node) = self.node() {
            visit(node, &mut seen, &mut nodes);
        }
        Definition {
            nodes,
            root: self.output_ref(),
        }
    }
}

fn visit(node: &Arc<Node>, seen: &mut BTreeSet<ContentDigest>, out: &mut Vec<NodeDef>) {
    if !seen.insert(node.digest().clone()) {
        return;
    }
    for input in node.inputs() {
        if let Some(n) = input.node() {
            visit(n, seen, out);
        }
    }
    out.push(NodeDef {
        digest: node.digest().clone(),
        op: node.op().clone(),
        inputs: node.inputs().iter().map(State::output_ref).collect(),
        group: node.group().map(str::to_owned),
    });
}

impl Definition {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, digest: &ContentDigest) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| &n.digest == digest)
    }

    pub fn root_node(&self) -> Option<&NodeDef> {
        self.root.as_ref().and_then(|r| self.node(&r.digest))
    }

    /// Digest identifying the whole graph: the root output, or a fixed value
    /// for scratch.
    pub fn digest(&self) -> ContentDigest {
        match &self.root {
            Some(root) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(root.digest.as_bytes());
                hasher.update(&root.output.to_le_bytes());
                ContentDigest::new(hasher.finalize().to_hex().to_string())
            }
            None => ContentDigest::new(blake3::hash(b"scratch").to_hex().to_string()),
        }
    }

    pub fn execs(&self) -> impl Iterator<Item = (&NodeDef, &ExecOp)> {
        self.nodes.iter().filter_map(|n| match &n.op {
            Op::Exec(exec) => Some((n, exec)),
            _ => None,
        })
    }

    /// Check ordering, references and digests. A definition read from
    /// elsewhere must pass this before it is executed.
    pub fn verify(&self) -> Result<(), GraphError> {
        let mut known: HashMap<&ContentDigest, &NodeDef> = HashMap::new();

        for node in &self.nodes {
            for input in node.inputs.iter().flatten() {
                if !known.contains_key(&input.digest) {
                    return Err(GraphError::UnknownInput {
                        node: node.digest.to_string(),
                        input: input.digest.to_string(),
                    });
                }
            }
            let actual = node_digest(&node.op, &node.inputs);
            if actual != node.digest {
                return Err(GraphError::DigestMismatch {
                    expected: node.digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            known.insert(&node.digest, node);
        }

        if let Some(root) = &self.root {
            if !known.contains_key(&root.digest) {
                return Err(GraphError::UnknownRoot(root.digest.to_string()));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self, GraphError> {
        let def: Definition = serde_json::from_str(input)?;
        def.verify()?;
        Ok(def)
    }
}
