//! Baseline seeding.
//!
//! The fiat bridge lays out a schoolbook product with row-wise carry chains
//! and a pseudo-Mersenne fold, the shape fiat-crypto emits for saturated
//! 64-bit limbs. The manual bridge loads a previously exported model. The
//! bitcoin-core and jasmin bridges are accepted at the CLI and route onto
//! these two: bitcoin-core pins the secp256k1 field, jasmin loads a state
//! file when one is given.

use crate::config::{Bridge, Curve, MemoryConstraints, Method, RunOptions};
use crate::error::ForgeResult;
use crate::ir::{
    Choice, Decision, DecisionKind, MemBase, MemRef, Model, Node, NodeId, Op, Operand,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Saturated 64-bit limb count and fold multiplier per curve. The fold
/// constant is the reduction multiplier for the pseudo-Mersenne curves; for
/// the Solinas curves it seeds the same folded-product skeleton, which is
/// what the search operates on.
#[allow(overflowing_literals)]
fn curve_shape(curve: Curve) -> (usize, u64) {
    match curve {
        Curve::Curve25519 => (4, 38),
        Curve::Secp256k1 => (4, 0x1000003D1),
        Curve::P256 => (4, 0xffffffff00000001),
        Curve::P384 => (6, 0x100000000ffffffff),
        Curve::P521 => (9, 1),
    }
}

struct Gen {
    nodes: Vec<Node>,
    next: NodeId,
    xmm: bool,
    prefer_xmm: bool,
}

impl Gen {
    fn new(xmm: bool, prefer_xmm: bool) -> Self {
        Self {
            nodes: Vec::new(),
            next: 0,
            xmm,
            prefer_xmm,
        }
    }

    fn push(&mut self, op: Op, args: Vec<Operand>) -> NodeId {
        let id = self.next;
        self.next += 1;
        self.nodes.push(Node::new(id, op, args));
        id
    }

    fn spill_decision(&self) -> Decision {
        if self.xmm {
            Decision::new(
                DecisionKind::SpillTarget,
                vec![Choice::StackSpill, Choice::XmmSpill],
                if self.prefer_xmm { 1 } else { 0 },
                true,
            )
        } else {
            Decision::new(DecisionKind::SpillTarget, vec![Choice::StackSpill], 0, false)
        }
    }

    fn load(&mut self, base: MemBase, limb: u8) -> NodeId {
        let d = self.spill_decision();
        let id = self.push(Op::Load, vec![Operand::Mem(MemRef { base, limb })]);
        self.nodes.last_mut().unwrap().decisions.push(d);
        id
    }

    fn mul(&mut self, a: Operand, b: Operand) -> NodeId {
        let d = self.spill_decision();
        let id = self.push(Op::Mul, vec![a, b]);
        let node = self.nodes.last_mut().unwrap();
        node.decisions.push(Decision::new(
            DecisionKind::MulUnit,
            vec![Choice::UnitMulx, Choice::UnitMulq],
            0,
            true,
        ));
        node.decisions.push(d);
        id
    }

    /// Chain-opening add; carries a hot flag-class decision that the rest of
    /// its chain inherits.
    fn add_open(&mut self, a: Operand, b: Operand) -> NodeId {
        let id = self.push(Op::AddCarry, vec![Operand::Imm(0), a, b]);
        self.nodes.last_mut().unwrap().decisions.push(Decision::new(
            DecisionKind::CarryFlag,
            vec![Choice::FlagC, Choice::FlagO],
            0,
            true,
        ));
        id
    }

    fn add_cont(&mut self, carry_of: NodeId, a: Operand, b: Operand) -> NodeId {
        self.push(Op::AddCarry, vec![Operand::hi_ref(carry_of), a, b])
    }

    fn store(&mut self, limb: u8, value: Operand) -> NodeId {
        self.push(
            Op::Store,
            vec![
                Operand::Mem(MemRef {
                    base: MemBase::Out1,
                    limb,
                }),
                value,
            ],
        )
    }
}

/// Generate the schoolbook baseline for one curve/method pair.
pub fn fiat_baseline(
    curve: Curve,
    method: Method,
    xmm: bool,
    prefer_xmm: bool,
) -> ForgeResult<Model> {
    let (n, fold) = curve_shape(curve);
    let mut g = Gen::new(xmm, prefer_xmm);

    let a: Vec<NodeId> = (0..n).map(|i| g.load(MemBase::Arg1, i as u8)).collect();
    let b: Vec<NodeId> = match method {
        Method::Square => a.clone(),
        Method::Mul => (0..n).map(|i| g.load(MemBase::Arg2, i as u8)).collect(),
    };

    // t[k] is the current producer of product limb k, built row by row.
    let mut t: Vec<Option<Operand>> = vec![None; 2 * n];

    for i in 0..n {
        let products: Vec<NodeId> = (0..n)
            .map(|j| g.mul(Operand::node_ref(a[i]), Operand::node_ref(b[j])))
            .collect();

        if i == 0 {
            t[0] = Some(Operand::node_ref(products[0]));
            let mut carry: Option<NodeId> = None;
            for j in 1..n {
                let lo = Operand::node_ref(products[j]);
                let hi = Operand::hi_ref(products[j - 1]);
                let node = match carry {
                    None => g.add_open(lo, hi),
                    Some(c) => g.add_cont(c, lo, hi),
                };
                t[j] = Some(Operand::node_ref(node));
                carry = Some(node);
            }
            let top = match carry {
                Some(c) => g.add_cont(c, Operand::hi_ref(products[n - 1]), Operand::Imm(0)),
                None => products[0], // n == 1: top limb is the high half
            };
            t[n] = Some(if n == 1 {
                Operand::hi_ref(top)
            } else {
                Operand::node_ref(top)
            });
            continue;
        }

        // Low halves into t[i..i+n], then a carry ripple into t[i+n].
        let mut carry: Option<NodeId> = None;
        for j in 0..n {
            let acc = t[i + j].take().unwrap_or(Operand::Imm(0));
            let lo = Operand::node_ref(products[j]);
            let node = match carry {
                None => g.add_open(acc, lo),
                Some(c) => g.add_cont(c, acc, lo),
            };
            t[i + j] = Some(Operand::node_ref(node));
            carry = Some(node);
        }
        let acc = t[i + n].take().unwrap_or(Operand::Imm(0));
        let node = g.add_cont(carry.unwrap(), acc, Operand::Imm(0));
        t[i + n] = Some(Operand::node_ref(node));

        // High halves into t[i+1..i+n+1], carry into t[i+n+1] when present.
        let mut carry: Option<NodeId> = None;
        for j in 0..n {
            let acc = t[i + 1 + j].take().unwrap_or(Operand::Imm(0));
            let hi = Operand::hi_ref(products[j]);
            let node = match carry {
                None => g.add_open(acc, hi),
                Some(c) => g.add_cont(c, acc, hi),
            };
            t[i + 1 + j] = Some(Operand::node_ref(node));
            carry = Some(node);
        }
        if i + n + 1 < 2 * n {
            let acc = t[i + n + 1].take().unwrap_or(Operand::Imm(0));
            let node = g.add_cont(carry.unwrap(), acc, Operand::Imm(0));
            t[i + n + 1] = Some(Operand::node_ref(node));
        }
    }

    // Fold the high half back down with the curve's reduction multiplier.
    let folds: Vec<NodeId> = (0..n)
        .map(|j| {
            let high = t[n + j].take().unwrap_or(Operand::Imm(0));
            g.mul(high, Operand::Imm(fold))
        })
        .collect();

    let mut carry: Option<NodeId> = None;
    for j in 0..n {
        let acc = t[j].take().unwrap_or(Operand::Imm(0));
        let lo = Operand::node_ref(folds[j]);
        let node = match carry {
            None => g.add_open(acc, lo),
            Some(c) => g.add_cont(c, acc, lo),
        };
        t[j] = Some(Operand::node_ref(node));
        carry = Some(node);
    }
    let top_carry = g.add_cont(carry.unwrap(), Operand::Imm(0), Operand::Imm(0));

    let mut carry: Option<NodeId> = None;
    for j in 1..n {
        let acc = t[j].take().unwrap();
        let hi = Operand::hi_ref(folds[j - 1]);
        let node = match carry {
            None => g.add_open(acc, hi),
            Some(c) => g.add_cont(c, acc, hi),
        };
        t[j] = Some(Operand::node_ref(node));
        carry = Some(node);
    }

    // Whatever spilled past the top limb wraps around once more.
    let wrap_amount = match carry {
        Some(c) => {
            let merged = g.add_cont(
                c,
                Operand::node_ref(top_carry),
                Operand::hi_ref(folds[n - 1]),
            );
            Operand::node_ref(merged)
        }
        None => Operand::node_ref(top_carry),
    };
    let wrap = g.mul(wrap_amount, Operand::Imm(fold));
    let node = g.add_open(t[0].take().unwrap(), Operand::node_ref(wrap));
    t[0] = Some(Operand::node_ref(node));
    if n > 1 {
        let ripple = g.add_cont(node, t[1].take().unwrap(), Operand::Imm(0));
        t[1] = Some(Operand::node_ref(ripple));
    }

    let stores: Vec<NodeId> = (0..n)
        .map(|k| g.store(k as u8, t[k].take().unwrap()))
        .collect();

    let model = Model::new(g.nodes)?;
    debug!(
        nodes = model.len(),
        stores = stores.len(),
        "generated {curve} {method} baseline"
    );
    Ok(model)
}

/// Serialize extra ordering edges for the read/write aliasing policy.
fn apply_memory_constraints(model: Model, policy: MemoryConstraints) -> ForgeResult<Model> {
    if policy == MemoryConstraints::None {
        return Ok(model);
    }
    let mut nodes = model.nodes_in_topological_order().to_vec();
    let loads: Vec<(NodeId, MemBase)> = nodes
        .iter()
        .filter(|n| n.op == Op::Load)
        .filter_map(|n| match &n.args[0] {
            Operand::Mem(m) => Some((n.id, m.base)),
            _ => None,
        })
        .collect();
    let store_ids: Vec<NodeId> = nodes
        .iter()
        .filter(|n| n.op == Op::Store)
        .map(|n| n.id)
        .collect();

    for node in nodes.iter_mut().filter(|n| n.op == Op::Store) {
        for &(load, base) in &loads {
            let constrained = match policy {
                MemoryConstraints::All => true,
                MemoryConstraints::Out1Arg1 => base == MemBase::Arg1,
                MemoryConstraints::None => false,
            };
            if constrained {
                node.add_dep(load);
            }
        }
        // Stores stay in program order relative to each other.
        for &s in &store_ids {
            if s < node.id {
                node.add_dep(s);
            }
        }
    }
    Model::new(nodes)
}

/// Most recently written exported state in the result dir, if any.
pub fn best_prior_state(result_dir: &Path) -> ForgeResult<Option<PathBuf>> {
    if !result_dir.is_dir() {
        return Ok(None);
    }
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(result_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("seed") && name.ends_with(".dat") {
            let modified = entry.metadata()?.modified()?;
            candidates.push((modified, path));
        }
    }
    candidates.sort();
    Ok(candidates.pop().map(|(_, p)| p))
}

/// Resolve the baseline model for a run.
pub fn load_baseline(opts: &RunOptions) -> ForgeResult<Model> {
    if let Some(path) = &opts.read_state {
        info!("resuming model from {}", path.display());
        return Model::import(path);
    }
    if opts.start_from_best_json {
        if let Some(path) = best_prior_state(&opts.result_dir())? {
            info!("resuming model from prior result {}", path.display());
            return Model::import(path);
        }
    }

    let model = match opts.bridge {
        Bridge::Fiat => fiat_baseline(opts.curve, opts.method, opts.xmm, opts.prefer_xmm)?,
        Bridge::BitcoinCore => {
            fiat_baseline(Curve::Secp256k1, opts.method, opts.xmm, opts.prefer_xmm)?
        }
        Bridge::Manual => Model::import(&opts.json_file)?,
        Bridge::Jasmin => {
            if opts.json_file.is_empty() {
                fiat_baseline(opts.curve, opts.method, opts.xmm, opts.prefer_xmm)?
            } else {
                Model::import(&opts.json_file)?
            }
        }
    };
    apply_memory_constraints(model, opts.memory_constraints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Curve::Curve25519, Method::Square)]
    #[case(Curve::Curve25519, Method::Mul)]
    #[case(Curve::P256, Method::Mul)]
    #[case(Curve::P384, Method::Square)]
    #[case(Curve::Secp256k1, Method::Mul)]
    fn baselines_are_valid_models(#[case] curve: Curve, #[case] method: Method) {
        let model = fiat_baseline(curve, method, false, false).unwrap();
        assert!(model.is_topologically_ordered());
        let (n, _) = curve_shape(curve);
        let stores = model
            .nodes_in_topological_order()
            .iter()
            .filter(|node| node.op == Op::Store)
            .count();
        assert_eq!(stores, n);
    }

    #[test]
    fn square_shares_its_loads() {
        let square = fiat_baseline(Curve::Curve25519, Method::Square, false, false).unwrap();
        let mul = fiat_baseline(Curve::Curve25519, Method::Mul, false, false).unwrap();
        let count_loads = |m: &Model| {
            m.nodes_in_topological_order()
                .iter()
                .filter(|n| n.op == Op::Load)
                .count()
        };
        assert_eq!(count_loads(&square), 4);
        assert_eq!(count_loads(&mul), 8);
    }

    #[test]
    fn xmm_enables_hot_spill_decisions() {
        let plain = fiat_baseline(Curve::Curve25519, Method::Square, false, false).unwrap();
        let vector = fiat_baseline(Curve::Curve25519, Method::Square, true, true).unwrap();
        let hot_spills = |m: &Model| {
            m.nodes_in_topological_order()
                .iter()
                .flat_map(|n| n.decisions.iter())
                .filter(|d| d.kind == DecisionKind::SpillTarget && d.is_mutable())
                .count()
        };
        assert_eq!(hot_spills(&plain), 0);
        assert!(hot_spills(&vector) > 0);
        let first = vector
            .nodes_in_topological_order()
            .iter()
            .flat_map(|n| n.decisions.iter())
            .find(|d| d.kind == DecisionKind::SpillTarget)
            .unwrap();
        assert_eq!(first.value(), Choice::XmmSpill);
    }

    #[test]
    fn memory_constraints_order_stores_after_loads() {
        let model = fiat_baseline(Curve::Curve25519, Method::Mul, false, false).unwrap();
        let constrained = apply_memory_constraints(model, MemoryConstraints::All).unwrap();
        let loads: Vec<NodeId> = constrained
            .nodes_in_topological_order()
            .iter()
            .filter(|n| n.op == Op::Load)
            .map(|n| n.id)
            .collect();
        for store in constrained
            .nodes_in_topological_order()
            .iter()
            .filter(|n| n.op == Op::Store)
        {
            for l in &loads {
                assert!(store.deps.contains(l));
            }
        }
    }

    #[test]
    fn generated_baseline_round_trips() {
        let model = fiat_baseline(Curve::Secp256k1, Method::Square, true, false).unwrap();
        let json = model.export().unwrap();
        let back = Model::import_str(&json).unwrap();
        assert_eq!(back.export().unwrap(), json);
    }
}
