//! The mutable program model: nodes in a topological order, a one-deep undo
//! log for the optimizer's revert path, and named snapshots for the
//! annealer's neighbourhood sampling.

use crate::error::{ForgeError, ForgeResult};
use crate::ir::node::{Node, NodeId};
use crate::rng::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Permutation,
    Decision,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Permutation => write!(f, "permutation"),
            MutationKind::Decision => write!(f, "decision"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Back,
    Forward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Back => write!(f, "back"),
            Direction::Forward => write!(f, "forward"),
        }
    }
}

/// Record of one permutation mutation, for the mutation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutationMove {
    pub node: NodeId,
    pub direction: Direction,
    pub walked: usize,
}

impl fmt::Display for PermutationMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}:{}:{}", self.node, self.direction, self.walked)
    }
}

/// Record of one decision mutation, for the mutation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionFlip {
    pub node: NodeId,
    pub kind: &'static str,
    pub from: usize,
    pub to: usize,
}

impl fmt::Display for DecisionFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}:{}:{}>{}", self.node, self.kind, self.from, self.to)
    }
}

#[derive(Debug, Clone)]
enum UndoEntry {
    Permutation { from: usize, to: usize },
    Decision { node: NodeId, slot: usize, previous: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotState {
    order: Vec<NodeId>,
    decisions: HashMap<NodeId, Vec<usize>>,
}

/// Serialized form of a model; `import(export()) == identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct Model {
    nodes: Vec<Node>,
    undo: Option<UndoEntry>,
    snapshots: HashMap<String, SnapshotState>,
}

impl Model {
    /// Build from nodes already in a topological order.
    pub fn new(nodes: Vec<Node>) -> ForgeResult<Self> {
        let model = Self {
            nodes,
            undo: None,
            snapshots: HashMap::new(),
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> ForgeResult<()> {
        if !self.is_topologically_ordered() {
            return Err(ForgeError::BadState(
                "node list is not a topological order of its dependencies".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(ForgeError::BadState(format!("duplicate node id {}", node.id)));
            }
            for d in &node.decisions {
                if d.current >= d.choices.len() {
                    return Err(ForgeError::BadState(format!(
                        "node {} decision out of range",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes_in_topological_order(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_topologically_ordered(&self) -> bool {
        let pos: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        self.nodes.iter().enumerate().all(|(i, n)| {
            n.deps
                .iter()
                .all(|d| pos.get(d).map(|&p| p < i).unwrap_or(false))
        })
    }

    /// Legal position interval `[lo, hi]` for the node at `pos`:
    /// `lo` just past its last predecessor, `hi` just before its first
    /// successor.
    fn legal_interval(&self, pos: usize) -> (usize, usize) {
        let node = &self.nodes[pos];
        let mut lo = 0usize;
        for (i, other) in self.nodes[..pos].iter().enumerate() {
            if node.deps.contains(&other.id) {
                lo = lo.max(i + 1);
            }
        }
        let mut hi = self.nodes.len() - 1;
        for (i, other) in self.nodes.iter().enumerate().skip(pos + 1) {
            if other.deps.contains(&node.id) {
                hi = hi.min(i - 1);
                break;
            }
        }
        (lo, hi)
    }

    /// Slide one node within its legal interval. The walk length comes from
    /// a fair-coin geometric draw capped at the interval edge; the exact
    /// number of steps walked is reported for the mutation log.
    pub fn mutate_permutation(&mut self, rng: &mut Rng) -> PermutationMove {
        let pos = rng.uniform_index(self.nodes.len());
        let node_id = self.nodes[pos].id;
        let (lo, hi) = self.legal_interval(pos);

        let direction = if rng.coin() {
            Direction::Forward
        } else {
            Direction::Back
        };

        if lo == hi {
            self.undo = Some(UndoEntry::Permutation { from: pos, to: pos });
            return PermutationMove {
                node: node_id,
                direction,
                walked: 0,
            };
        }

        let limit = match direction {
            Direction::Forward => hi - pos,
            Direction::Back => pos - lo,
        };
        let mut walked = 0usize;
        while walked < limit && rng.coin() {
            walked += 1;
        }

        let target = match direction {
            Direction::Forward => pos + walked,
            Direction::Back => pos - walked,
        };
        let node = self.nodes.remove(pos);
        self.nodes.insert(target, node);
        self.undo = Some(UndoEntry::Permutation {
            from: target,
            to: pos,
        });

        PermutationMove {
            node: node_id,
            direction,
            walked,
        }
    }

    /// Flip one hot decision to a uniformly random other value. Returns
    /// `None` when no hot decision exists.
    pub fn mutate_decision(&mut self, rng: &mut Rng) -> Option<DecisionFlip> {
        let mutable: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(ni, n)| {
                n.decisions
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.is_mutable())
                    .map(move |(di, _)| (ni, di))
            })
            .collect();
        if mutable.is_empty() {
            return None;
        }

        let (ni, di) = mutable[rng.uniform_index(mutable.len())];
        let node_id = self.nodes[ni].id;
        let decision = &mut self.nodes[ni].decisions[di];
        let previous = decision.current;
        let mut next = rng.uniform_index(decision.choices.len() - 1);
        if next >= previous {
            next += 1;
        }
        decision.current = next;
        let kind = decision.kind.label();
        self.undo = Some(UndoEntry::Decision {
            node: node_id,
            slot: di,
            previous,
        });

        Some(DecisionFlip {
            node: node_id,
            kind,
            from: previous,
            to: next,
        })
    }

    /// Undo exactly the most recent mutation. At most once per mutation.
    pub fn revert_last_mutation(&mut self) -> ForgeResult<()> {
        match self.undo.take() {
            Some(UndoEntry::Permutation { from, to }) => {
                let node = self.nodes.remove(from);
                self.nodes.insert(to, node);
                Ok(())
            }
            Some(UndoEntry::Decision {
                node,
                slot,
                previous,
            }) => {
                let n = self
                    .nodes
                    .iter_mut()
                    .find(|n| n.id == node)
                    .ok_or_else(|| ForgeError::BadState(format!("undo: node {node} vanished")))?;
                n.decisions[slot].current = previous;
                Ok(())
            }
            None => Err(ForgeError::BadState(
                "revert_last_mutation with no pending mutation".into(),
            )),
        }
    }

    /// Named, random-access save of (order, decisions). Independent of the
    /// undo log; semantically a deep copy.
    pub fn save_snapshot(&mut self, id: &str) {
        let state = SnapshotState {
            order: self.nodes.iter().map(|n| n.id).collect(),
            decisions: self
                .nodes
                .iter()
                .map(|n| (n.id, n.decisions.iter().map(|d| d.current).collect()))
                .collect(),
        };
        self.snapshots.insert(id.to_string(), state);
    }

    /// Restore a snapshot bit-identically. Invalidates any pending undo
    /// entry.
    pub fn restore_snapshot(&mut self, id: &str) -> ForgeResult<()> {
        let state = self
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::BadState(format!("unknown snapshot '{id}'")))?;

        let mut by_id: HashMap<NodeId, Node> =
            self.nodes.drain(..).map(|n| (n.id, n)).collect();
        for node_id in &state.order {
            let mut node = by_id.remove(node_id).ok_or_else(|| {
                ForgeError::BadState(format!("snapshot '{id}' references unknown node {node_id}"))
            })?;
            if let Some(currents) = state.decisions.get(node_id) {
                for (d, &c) in node.decisions.iter_mut().zip(currents.iter()) {
                    d.current = c;
                }
            }
            self.nodes.push(node);
        }
        if !by_id.is_empty() {
            return Err(ForgeError::BadState(format!(
                "snapshot '{id}' is missing {} nodes",
                by_id.len()
            )));
        }
        self.undo = None;
        Ok(())
    }

    pub fn drop_snapshot(&mut self, id: &str) {
        self.snapshots.remove(id);
    }

    pub fn export(&self) -> ForgeResult<String> {
        let state = ModelState {
            nodes: self.nodes.clone(),
        };
        Ok(serde_json::to_string_pretty(&state)?)
    }

    pub fn import_str(json: &str) -> ForgeResult<Self> {
        let state: ModelState = serde_json::from_str(json)?;
        Model::new(state.nodes)
    }

    pub fn import<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Model::import_str(&content)
    }
}
