//! IR nodes: one node per limb-level operation of the straight-line program.
//!
//! Nodes form a DAG through `deps`. The order they are *scheduled* in lives
//! in the [`Model`](super::Model), not here. Decision variables parameterize
//! how a node lowers to x86-64; only hot decisions are eligible for
//! mutation.

use serde::{Deserialize, Serialize};

pub type NodeId = u32;

/// Projection index into a node's outputs. Carry ops and widening multiplies
/// produce two values; everything else produces at most one.
pub const PROJ_LO: u8 = 0;
pub const PROJ_HI: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemBase {
    Arg1,
    Arg2,
    Out1,
}

impl MemBase {
    pub fn label(&self) -> &'static str {
        match self {
            MemBase::Arg1 => "arg1",
            MemBase::Arg2 => "arg2",
            MemBase::Out1 => "out1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    pub base: MemBase,
    pub limb: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Output `proj` of another node.
    Ref { node: NodeId, proj: u8 },
    /// A limb of one of the pointer arguments.
    Mem(MemRef),
    Imm(u64),
}

impl Operand {
    pub fn node_ref(node: NodeId) -> Self {
        Operand::Ref {
            node,
            proj: PROJ_LO,
        }
    }

    pub fn hi_ref(node: NodeId) -> Self {
        Operand::Ref {
            node,
            proj: PROJ_HI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// args: [Mem] -> 1 out
    Load,
    /// args: [Mem, value] -> 0 outs
    Store,
    /// args: [a, b] -> (lo, hi). Widening 64x64 multiply.
    Mul,
    /// args: [carry_in, a, b] -> (sum, carry_out)
    AddCarry,
    /// args: [borrow_in, a, b] -> (diff, borrow_out)
    SubBorrow,
    /// args: [lo, hi, Imm shift] -> 1 out. Double-precision right shift.
    Shrd,
    /// args: [a, Imm shift] -> 1 out
    Shr,
    /// args: [a, Imm mask] -> 1 out
    And,
    /// args: [a, b] -> 1 out. Flagless addition.
    Lea,
}

impl Op {
    pub fn out_count(&self) -> u8 {
        match self {
            Op::Store => 0,
            Op::Mul | Op::AddCarry | Op::SubBorrow => 2,
            _ => 1,
        }
    }
}

/// A concrete value a decision variable can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    StackSpill,
    XmmSpill,
    FlagC,
    FlagO,
    UnitMulx,
    UnitMulq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionKind {
    SpillTarget,
    CarryFlag,
    MulUnit,
}

impl DecisionKind {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionKind::SpillTarget => "spill",
            DecisionKind::CarryFlag => "flag",
            DecisionKind::MulUnit => "mul",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub choices: Vec<Choice>,
    pub current: usize,
    pub hot: bool,
}

impl Decision {
    pub fn new(kind: DecisionKind, choices: Vec<Choice>, current: usize, hot: bool) -> Self {
        debug_assert!(current < choices.len());
        Self {
            kind,
            choices,
            current,
            hot,
        }
    }

    pub fn value(&self) -> Choice {
        self.choices[self.current]
    }

    /// Mutable: more than one choice and flagged hot.
    pub fn is_mutable(&self) -> bool {
        self.hot && self.choices.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub args: Vec<Operand>,
    /// Dependency identities. Always a superset of the `Ref` operands in
    /// `args`; bridges add extra edges for carry chains and memory aliasing
    /// policies.
    pub deps: Vec<NodeId>,
    pub decisions: Vec<Decision>,
}

impl Node {
    pub fn new(id: NodeId, op: Op, args: Vec<Operand>) -> Self {
        let mut deps: Vec<NodeId> = args
            .iter()
            .filter_map(|a| match a {
                Operand::Ref { node, .. } => Some(*node),
                _ => None,
            })
            .collect();
        deps.sort_unstable();
        deps.dedup();
        Self {
            id,
            op,
            args,
            deps,
            decisions: Vec::new(),
        }
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decisions.push(decision);
        self
    }

    pub fn add_dep(&mut self, dep: NodeId) {
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
    }

    /// Current value of the first decision of `kind`, if present.
    pub fn decision(&self, kind: DecisionKind) -> Option<Choice> {
        self.decisions
            .iter()
            .find(|d| d.kind == kind)
            .map(|d| d.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_are_collected_from_ref_args() {
        let node = Node::new(
            7,
            Op::AddCarry,
            vec![
                Operand::Imm(0),
                Operand::node_ref(3),
                Operand::hi_ref(3),
            ],
        );
        assert_eq!(node.deps, vec![3]);
        assert_eq!(node.op.out_count(), 2);
    }

    #[test]
    fn decision_mutability_requires_hotness_and_alternatives() {
        let single = Decision::new(DecisionKind::CarryFlag, vec![Choice::FlagC], 0, true);
        assert!(!single.is_mutable());
        let cold = Decision::new(
            DecisionKind::CarryFlag,
            vec![Choice::FlagC, Choice::FlagO],
            0,
            false,
        );
        assert!(!cold.is_mutable());
        let hot = Decision::new(
            DecisionKind::CarryFlag,
            vec![Choice::FlagC, Choice::FlagO],
            1,
            true,
        );
        assert!(hot.is_mutable());
        assert_eq!(hot.value(), Choice::FlagO);
    }
}
