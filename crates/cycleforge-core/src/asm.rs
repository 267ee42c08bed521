//! Lowering of the model to NASM text.
//!
//! The renderer walks the scheduled nodes once, running a greedy register
//! allocator over a fixed x86-64 pool. Node decisions steer the interesting
//! choices: carry chains ride CF (add/adc) or OF (adox), widening multiplies
//! use mulx or the legacy rax/rdx mul, and evicted values spill to the stack
//! or to vector registers. Carries stay in flags as long as no rendered
//! instruction in between clobbers them; otherwise they are materialized
//! into a byte register and re-entered at the consumer.
//!
//! Calling convention is System V: rdi = out1, rsi = arg1, rdx = arg2.
//! rdx is also the implicit mulx operand, so arg2 moves to r10 up front.

use crate::config::FramePointer;
use crate::ir::{Choice, DecisionKind, MemBase, Model, Node, NodeId, Op, Operand, PROJ_HI};
use std::collections::{HashMap, HashSet};

pub const UNDEFINED: &str = "undefined";

const GP_POOL: &[&str] = &["rbx", "rcx", "r8", "r9", "r11", "r12", "r13", "r14", "r15"];
const CALLEE_SAVED: &[&str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];
const RED_ZONE_BYTES: usize = 128;

fn byte_reg(reg: &str) -> String {
    match reg {
        "rax" => "al".into(),
        "rbx" => "bl".into(),
        "rcx" => "cl".into(),
        "rdx" => "dl".into(),
        "rbp" => "bpl".into(),
        _ => format!("{reg}b"),
    }
}

fn imm_str(v: u64) -> String {
    if v > 255 {
        format!("0x{v:x}")
    } else {
        format!("{v}")
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub text: String,
    pub stack_length: usize,
    pub instruction_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Reg(usize),
    Stack(usize),
    Xmm(usize),
}

type ValKey = (NodeId, u8);

#[derive(Debug, Clone)]
pub struct Renderer {
    pub symbol: String,
    pub redzone: bool,
    pub frame_pointer: FramePointer,
    pub allow_xmm: bool,
}

impl Renderer {
    pub fn new(symbol: &str, redzone: bool, frame_pointer: FramePointer, allow_xmm: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            redzone,
            frame_pointer,
            allow_xmm,
        }
    }

    pub fn render(&self, model: &Model) -> Program {
        Emit::new(self, model).run()
    }
}

struct Emit<'a> {
    cfg: &'a Renderer,
    nodes: &'a [Node],
    lines: Vec<String>,
    pool: Vec<&'static str>,
    free: Vec<usize>,
    lru: Vec<usize>,
    owner: HashMap<usize, ValKey>,
    locs: HashMap<ValKey, Loc>,
    uses: HashMap<ValKey, usize>,
    free_slots: Vec<usize>,
    next_slot: usize,
    max_slots: usize,
    free_xmm: Vec<usize>,
    carry_class: HashMap<NodeId, Choice>,
    cf_owner: Option<NodeId>,
    of_owner: Option<NodeId>,
    materialized: HashSet<NodeId>,
    used_regs: HashSet<usize>,
    uses_arg2: bool,
}

impl<'a> Emit<'a> {
    fn new(cfg: &'a Renderer, model: &'a Model) -> Self {
        let nodes = model.nodes_in_topological_order();
        let mut pool: Vec<&'static str> = GP_POOL.to_vec();
        if cfg.frame_pointer == FramePointer::Omit {
            pool.push("rbp");
        }
        let uses_arg2 = nodes.iter().any(|n| {
            n.args
                .iter()
                .any(|a| matches!(a, Operand::Mem(m) if m.base == MemBase::Arg2))
        });
        if !uses_arg2 {
            pool.push("r10");
        }

        let mut uses: HashMap<ValKey, usize> = HashMap::new();
        for n in nodes {
            for a in &n.args {
                if let Operand::Ref { node, proj } = a {
                    *uses.entry((*node, *proj)).or_insert(0) += 1;
                }
            }
        }

        let free: Vec<usize> = (0..pool.len()).rev().collect();
        Emit {
            cfg,
            nodes,
            lines: Vec::new(),
            pool,
            free,
            lru: Vec::new(),
            owner: HashMap::new(),
            locs: HashMap::new(),
            uses,
            free_slots: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            free_xmm: (0..16).rev().collect(),
            carry_class: HashMap::new(),
            cf_owner: None,
            of_owner: None,
            materialized: HashSet::new(),
            used_regs: HashSet::new(),
            uses_arg2,
        }
    }

    fn run(mut self) -> Program {
        self.materialized = self.flag_survey();
        for i in 0..self.nodes.len() {
            self.emit_node(i);
        }
        self.finish()
    }

    /// Dry pass over the schedule tracking flag ownership, to find carry
    /// producers whose consumer can no longer read the flag directly.
    fn flag_survey(&self) -> HashSet<NodeId> {
        let mut cf: Option<NodeId> = None;
        let mut of: Option<NodeId> = None;
        let mut class: HashMap<NodeId, Choice> = HashMap::new();
        let mut needs = HashSet::new();

        for node in self.nodes {
            match node.op {
                Op::Load | Op::Store | Op::Lea => {}
                Op::Shrd | Op::Shr | Op::And => {
                    cf = None;
                    of = None;
                }
                Op::Mul => {
                    if node.decision(DecisionKind::MulUnit) == Some(Choice::UnitMulq) {
                        cf = None;
                        of = None;
                    }
                }
                Op::AddCarry => {
                    let chain = Self::chain_class(node, &class);
                    match &node.args[0] {
                        Operand::Ref { node: p, .. } => {
                            let live = match chain {
                                Choice::FlagO => of == Some(*p),
                                _ => cf == Some(*p),
                            };
                            if !live {
                                needs.insert(*p);
                                // Re-entry `add` clobbers both flags.
                                cf = None;
                                of = None;
                            }
                        }
                        _ => {
                            if chain == Choice::FlagO {
                                // Chain opens with a flag clear.
                                cf = None;
                                of = None;
                            }
                        }
                    }
                    match chain {
                        Choice::FlagO => of = Some(node.id),
                        _ => {
                            cf = Some(node.id);
                            of = None;
                        }
                    }
                    class.insert(node.id, chain);
                }
                Op::SubBorrow => {
                    if let Operand::Ref { node: p, .. } = &node.args[0] {
                        if cf != Some(*p) {
                            needs.insert(*p);
                        }
                    }
                    cf = Some(node.id);
                    of = None;
                    class.insert(node.id, Choice::FlagC);
                }
            }
        }
        needs
    }

    /// Carry chains inherit the flag class of their opener.
    fn chain_class(node: &Node, class: &HashMap<NodeId, Choice>) -> Choice {
        match &node.args[0] {
            Operand::Ref { node: p, .. } => class.get(p).copied().unwrap_or(Choice::FlagC),
            _ => node.decision(DecisionKind::CarryFlag).unwrap_or(Choice::FlagC),
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn mem_str(&self, base: MemBase, limb: u8) -> String {
        let reg = match base {
            MemBase::Out1 => "rdi",
            MemBase::Arg1 => "rsi",
            MemBase::Arg2 => "r10",
        };
        if limb == 0 {
            format!("[{reg}]")
        } else {
            format!("[{reg} + 0x{:x}]", limb as usize * 8)
        }
    }

    fn spill_addr(&self, slot: usize) -> String {
        let off = (slot + 1) * 8;
        if self.cfg.frame_pointer == FramePointer::Constant {
            format!("[rbp - 0x{off:x}]")
        } else {
            format!("[rsp - 0x{off:x}]")
        }
    }

    fn touch(&mut self, reg: usize) {
        if let Some(p) = self.lru.iter().position(|&r| r == reg) {
            self.lru.remove(p);
        }
        self.lru.push(reg);
    }

    fn release_reg(&mut self, reg: usize) {
        self.owner.remove(&reg);
        if let Some(p) = self.lru.iter().position(|&r| r == reg) {
            self.lru.remove(p);
        }
        self.free.push(reg);
    }

    fn drop_value(&mut self, key: ValKey) {
        match self.locs.remove(&key) {
            Some(Loc::Reg(r)) => self.release_reg(r),
            Some(Loc::Stack(s)) => self.free_slots.push(s),
            Some(Loc::Xmm(x)) => self.free_xmm.push(x),
            None => {}
        }
    }

    /// Grab a register, evicting the least recently used unpinned value if
    /// the pool is dry.
    fn alloc_reg(&mut self, pinned: &[usize]) -> usize {
        if let Some(r) = self.free.pop() {
            self.used_regs.insert(r);
            return r;
        }
        let victim = self
            .lru
            .iter()
            .copied()
            .find(|r| !pinned.contains(r))
            .expect("register pool too small for one instruction");
        let key = self.owner[&victim];
        let spill_to_xmm = self.cfg.allow_xmm
            && !self.free_xmm.is_empty()
            && self
                .node_by_id(key.0)
                .and_then(|n| n.decision(DecisionKind::SpillTarget))
                == Some(Choice::XmmSpill);
        if spill_to_xmm {
            let x = self.free_xmm.pop().unwrap();
            self.push(format!("movq xmm{x}, {}", self.pool[victim]));
            self.locs.insert(key, Loc::Xmm(x));
        } else {
            let slot = self.free_slots.pop().unwrap_or_else(|| {
                let s = self.next_slot;
                self.next_slot += 1;
                self.max_slots = self.max_slots.max(self.next_slot);
                s
            });
            self.push(format!("mov {}, {}", self.spill_addr(slot), self.pool[victim]));
            self.locs.insert(key, Loc::Stack(slot));
        }
        self.release_reg(victim);
        victim
    }

    fn node_by_id(&self, id: NodeId) -> Option<&'a Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn bind(&mut self, key: ValKey, reg: usize) {
        self.owner.insert(reg, key);
        self.locs.insert(key, Loc::Reg(reg));
        self.touch(reg);
    }

    /// Value into a register, reloading from its spill home if needed.
    fn value_reg(&mut self, key: ValKey, pinned: &[usize]) -> Option<usize> {
        match self.locs.get(&key).copied() {
            Some(Loc::Reg(r)) => {
                self.touch(r);
                Some(r)
            }
            Some(Loc::Stack(slot)) => {
                let r = self.alloc_reg(pinned);
                self.push(format!("mov {}, {}", self.pool[r], self.spill_addr(slot)));
                self.free_slots.push(slot);
                self.bind(key, r);
                Some(r)
            }
            Some(Loc::Xmm(x)) => {
                let r = self.alloc_reg(pinned);
                self.push(format!("movq {}, xmm{x}", self.pool[r]));
                self.free_xmm.push(x);
                self.bind(key, r);
                Some(r)
            }
            None => None,
        }
    }

    /// Printable operand; `Ref`s come back as register names. A reference
    /// with no live producer renders as the undefined marker and is caught
    /// by the baseline sanity check.
    fn fetch(&mut self, op: &Operand, pinned: &mut Vec<usize>) -> String {
        match op {
            Operand::Imm(v) => imm_str(*v),
            Operand::Mem(m) => self.mem_str(m.base, m.limb),
            Operand::Ref { node, proj } => match self.value_reg((*node, *proj), pinned) {
                Some(r) => {
                    pinned.push(r);
                    self.pool[r].to_string()
                }
                None => UNDEFINED.to_string(),
            },
        }
    }

    /// Decrement one use of a `Ref`, freeing its home at zero.
    fn consume(&mut self, op: &Operand) {
        if let Operand::Ref { node, proj } = op {
            let key = (*node, *proj);
            if let Some(n) = self.uses.get_mut(&key) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.drop_value(key);
                }
            }
        }
    }

    /// Destination for ops of the `mov dst, a; op dst, b` shape: reuse the
    /// register of `a` when this is its last use, otherwise copy.
    fn dest_from(&mut self, a: &Operand, pinned: &mut Vec<usize>) -> usize {
        if let Operand::Ref { node, proj } = a {
            let key = (*node, *proj);
            if self.uses.get(&key) == Some(&1) {
                if let Some(r) = self.value_reg(key, pinned) {
                    // Transfer ownership; no mov needed.
                    self.uses.insert(key, 0);
                    self.locs.remove(&key);
                    self.owner.remove(&r);
                    pinned.push(r);
                    return r;
                }
            }
        }
        let src = self.fetch(a, pinned);
        let dst = self.alloc_reg(pinned);
        pinned.push(dst);
        self.push(format!("mov {}, {src}", self.pool[dst]));
        self.consume(a);
        dst
    }

    /// Bring a materialized carry back into its flag.
    fn reenter_carry(&mut self, producer: NodeId, class: Choice) {
        let pattern = match class {
            Choice::FlagO => "0x7f",
            _ => "0xff",
        };
        match self.value_reg((producer, PROJ_HI), &[]) {
            Some(reg) => {
                self.push(format!("add {}, {pattern}", byte_reg(self.pool[reg])));
                self.drop_value((producer, PROJ_HI));
            }
            None => self.push(format!("add {UNDEFINED}, {pattern}")),
        }
        self.cf_owner = None;
        self.of_owner = None;
    }

    /// Produce this node's carry: usually it just lives in a flag, but if a
    /// later clobber was detected it is pinned into a byte register now.
    fn produce_carry(&mut self, node: &Node, class: Choice) {
        match class {
            Choice::FlagO => {
                self.of_owner = Some(node.id);
            }
            _ => {
                self.cf_owner = Some(node.id);
                self.of_owner = None;
            }
        }
        self.carry_class.insert(node.id, class);
        let carry_used = self.uses.get(&(node.id, PROJ_HI)).copied().unwrap_or(0) > 0;
        if carry_used && self.materialized.contains(&node.id) {
            let r = self.alloc_reg(&[]);
            let set = match class {
                Choice::FlagO => "seto",
                _ => "setc",
            };
            self.push(format!("{set} {}", byte_reg(self.pool[r])));
            self.bind((node.id, PROJ_HI), r);
        }
    }

    fn clobber_flags(&mut self) {
        self.cf_owner = None;
        self.of_owner = None;
    }

    fn emit_node(&mut self, index: usize) {
        let node = &self.nodes[index];
        match node.op {
            Op::Load => {
                let m = match &node.args[0] {
                    Operand::Mem(m) => self.mem_str(m.base, m.limb),
                    _ => UNDEFINED.to_string(),
                };
                let dst = self.alloc_reg(&[]);
                self.push(format!("mov {}, {m}", self.pool[dst]));
                self.bind((node.id, 0), dst);
            }
            Op::Store => {
                let mem = match &node.args[0] {
                    Operand::Mem(m) => self.mem_str(m.base, m.limb),
                    _ => UNDEFINED.to_string(),
                };
                let mut pinned = Vec::new();
                let src = match &node.args[1] {
                    Operand::Imm(v) => {
                        let r = self.alloc_reg(&pinned);
                        self.push(format!("mov {}, {}", self.pool[r], imm_str(*v)));
                        self.free.push(r);
                        self.pool[r].to_string()
                    }
                    other => self.fetch(other, &mut pinned),
                };
                self.push(format!("mov {mem}, {src}"));
                self.consume(&node.args[1]);
            }
            Op::Mul => self.emit_mul(index),
            Op::AddCarry => self.emit_add_carry(index),
            Op::SubBorrow => self.emit_sub_borrow(index),
            Op::Shrd => {
                let node = &self.nodes[index];
                let (lo, hi, sh) = (node.args[0], node.args[1], node.args[2]);
                let mut pinned = Vec::new();
                let dst = self.dest_from(&lo, &mut pinned);
                let hi_s = self.fetch(&hi, &mut pinned);
                let amount = match sh {
                    Operand::Imm(v) => imm_str(v),
                    _ => UNDEFINED.to_string(),
                };
                self.push(format!("shrd {}, {hi_s}, {amount}", self.pool[dst]));
                self.consume(&hi);
                self.bind((node.id, 0), dst);
                self.clobber_flags();
            }
            Op::Shr => {
                let node = &self.nodes[index];
                let (a, sh) = (node.args[0], node.args[1]);
                let mut pinned = Vec::new();
                let dst = self.dest_from(&a, &mut pinned);
                let amount = match sh {
                    Operand::Imm(v) => imm_str(v),
                    _ => UNDEFINED.to_string(),
                };
                self.push(format!("shr {}, {amount}", self.pool[dst]));
                self.bind((node.id, 0), dst);
                self.clobber_flags();
            }
            Op::And => {
                let node = &self.nodes[index];
                let (a, m) = (node.args[0], node.args[1]);
                let mut pinned = Vec::new();
                let dst = self.dest_from(&a, &mut pinned);
                match m {
                    Operand::Imm(v) if v > u32::MAX as u64 => {
                        self.push(format!("mov rax, {}", imm_str(v)));
                        self.push(format!("and {}, rax", self.pool[dst]));
                    }
                    Operand::Imm(v) => {
                        self.push(format!("and {}, {}", self.pool[dst], imm_str(v)));
                    }
                    _ => {
                        let s = self.fetch(&m, &mut pinned);
                        self.push(format!("and {}, {s}", self.pool[dst]));
                        self.consume(&m);
                    }
                }
                self.bind((node.id, 0), dst);
                self.clobber_flags();
            }
            Op::Lea => {
                let node = &self.nodes[index];
                let (a, b) = (node.args[0], node.args[1]);
                let mut pinned = Vec::new();
                let a_s = self.fetch(&a, &mut pinned);
                let part = match b {
                    Operand::Imm(v) => format!("{a_s} + {}", imm_str(v)),
                    _ => {
                        let b_s = self.fetch(&b, &mut pinned);
                        format!("{a_s} + {b_s}")
                    }
                };
                let dst = self.alloc_reg(&pinned);
                self.push(format!("lea {}, [{part}]", self.pool[dst]));
                self.consume(&a);
                self.consume(&b);
                self.bind((node.id, 0), dst);
            }
        }
    }

    fn emit_mul(&mut self, index: usize) {
        let node = &self.nodes[index];
        let (a, b) = (node.args[0], node.args[1]);
        let unit = node
            .decision(DecisionKind::MulUnit)
            .unwrap_or(Choice::UnitMulx);
        let id = node.id;
        let hi_used = self.uses.get(&(id, PROJ_HI)).copied().unwrap_or(0) > 0;
        let mut pinned = Vec::new();

        match unit {
            Choice::UnitMulx => {
                let b_s = self.fetch(&b, &mut pinned);
                self.push(format!("mov rdx, {b_s}"));
                let a_s = match a {
                    Operand::Imm(v) => {
                        self.push(format!("mov rax, {}", imm_str(v)));
                        "rax".to_string()
                    }
                    _ => self.fetch(&a, &mut pinned),
                };
                self.consume(&a);
                self.consume(&b);
                let lo = self.alloc_reg(&pinned);
                pinned.push(lo);
                if hi_used {
                    let hi = self.alloc_reg(&pinned);
                    self.push(format!(
                        "mulx {}, {}, {a_s}",
                        self.pool[hi], self.pool[lo]
                    ));
                    self.bind((id, PROJ_HI), hi);
                } else {
                    self.push(format!("mulx rax, {}, {a_s}", self.pool[lo]));
                }
                self.bind((id, 0), lo);
                // mulx leaves the flags alone.
            }
            Choice::UnitMulq => {
                let a_s = self.fetch(&a, &mut pinned);
                self.push(format!("mov rax, {a_s}"));
                match b {
                    Operand::Imm(v) => {
                        self.push(format!("mov rdx, {}", imm_str(v)));
                        self.push("mul rdx".to_string());
                    }
                    _ => {
                        let b_s = self.fetch(&b, &mut pinned);
                        self.push(format!("mul {b_s}"));
                    }
                }
                self.consume(&a);
                self.consume(&b);
                let lo = self.alloc_reg(&pinned);
                pinned.push(lo);
                self.push(format!("mov {}, rax", self.pool[lo]));
                self.bind((id, 0), lo);
                if hi_used {
                    let hi = self.alloc_reg(&pinned);
                    self.push(format!("mov {}, rdx", self.pool[hi]));
                    self.bind((id, PROJ_HI), hi);
                }
                self.clobber_flags();
            }
            _ => {}
        }
    }

    fn emit_add_carry(&mut self, index: usize) {
        let node = &self.nodes[index];
        let (cin, a, b) = (node.args[0], node.args[1], node.args[2]);
        let id = node.id;
        let class = Self::chain_class(node, &self.carry_class);
        let mut pinned = Vec::new();

        let opener = !matches!(cin, Operand::Ref { .. });
        if let Operand::Ref { node: p, .. } = cin {
            let live = match class {
                Choice::FlagO => self.of_owner == Some(p),
                _ => self.cf_owner == Some(p),
            };
            if !live {
                self.reenter_carry(p, class);
            }
            if let Some(n) = self.uses.get_mut(&(p, PROJ_HI)) {
                *n = n.saturating_sub(1);
            }
        } else if class == Choice::FlagO {
            // Open the OF chain from a clean slate.
            self.push("test al, al".to_string());
            self.clobber_flags();
        }

        let dst = self.dest_from(&a, &mut pinned);
        match class {
            Choice::FlagO => {
                let b_s = match b {
                    Operand::Imm(v) => {
                        // adox takes no immediates.
                        self.push(format!("mov rax, {}", imm_str(v)));
                        "rax".to_string()
                    }
                    _ => self.fetch(&b, &mut pinned),
                };
                self.push(format!("adox {}, {b_s}", self.pool[dst]));
            }
            _ => {
                let b_s = self.fetch(&b, &mut pinned);
                let mnemonic = if opener { "add" } else { "adc" };
                self.push(format!("{mnemonic} {}, {b_s}", self.pool[dst]));
            }
        }
        self.consume(&b);
        self.bind((id, 0), dst);
        self.produce_carry(node, class);
    }

    fn emit_sub_borrow(&mut self, index: usize) {
        let node = &self.nodes[index];
        let (bin, a, b) = (node.args[0], node.args[1], node.args[2]);
        let id = node.id;
        let mut pinned = Vec::new();

        let opener = !matches!(bin, Operand::Ref { .. });
        if let Operand::Ref { node: p, .. } = bin {
            if self.cf_owner != Some(p) {
                self.reenter_carry(p, Choice::FlagC);
            }
            if let Some(n) = self.uses.get_mut(&(p, PROJ_HI)) {
                *n = n.saturating_sub(1);
            }
        }

        let dst = self.dest_from(&a, &mut pinned);
        let b_s = self.fetch(&b, &mut pinned);
        let mnemonic = if opener { "sub" } else { "sbb" };
        self.push(format!("{mnemonic} {}, {b_s}", self.pool[dst]));
        self.consume(&b);
        self.bind((id, 0), dst);
        self.produce_carry(node, Choice::FlagC);
    }

    fn finish(self) -> Program {
        let stack_length = self.max_slots * 8;
        let needs_sub = stack_length > 0 && (!self.cfg.redzone || stack_length > RED_ZONE_BYTES);

        let mut body = self.lines;
        if needs_sub && self.cfg.frame_pointer != FramePointer::Constant {
            // Spills were addressed below rsp; rebase them onto the frame.
            for line in body.iter_mut() {
                if let Some(pos) = line.find("[rsp - 0x") {
                    let rest = &line[pos + 9..];
                    if let Some(end) = rest.find(']') {
                        if let Ok(off) = usize::from_str_radix(&rest[..end], 16) {
                            let new = format!("[rsp + 0x{:x}]", stack_length - off);
                            let old = format!("[rsp - 0x{off:x}]");
                            *line = line.replace(&old, &new);
                        }
                    }
                }
            }
        }

        let used_names: HashSet<&str> = self
            .used_regs
            .iter()
            .map(|&r| self.pool[r])
            .collect();
        let mut used_callee: Vec<&str> = Vec::new();
        for reg in CALLEE_SAVED {
            let frame_uses = *reg == "rbp" && self.cfg.frame_pointer != FramePointer::Omit;
            if used_names.contains(reg) || frame_uses {
                used_callee.push(reg);
            }
        }

        let mut out: Vec<String> = Vec::new();
        out.push("SECTION .text".to_string());
        out.push(format!("GLOBAL {}", self.cfg.symbol));
        out.push(format!("{}:", self.cfg.symbol));
        for reg in &used_callee {
            out.push(format!("push {reg}"));
        }
        if self.cfg.frame_pointer != FramePointer::Omit {
            out.push("mov rbp, rsp".to_string());
        }
        if needs_sub {
            out.push(format!("sub rsp, 0x{stack_length:x}"));
        }
        if self.uses_arg2 {
            out.push("mov r10, rdx".to_string());
        }
        out.extend(body);
        if needs_sub {
            if self.cfg.frame_pointer == FramePointer::Constant {
                out.push("mov rsp, rbp".to_string());
            } else {
                out.push(format!("add rsp, 0x{stack_length:x}"));
            }
        }
        for reg in used_callee.iter().rev() {
            out.push(format!("pop {reg}"));
        }
        out.push("ret".to_string());

        let instruction_count = out
            .iter()
            .filter(|l| {
                !l.starts_with("SECTION") && !l.starts_with("GLOBAL") && !l.ends_with(':')
            })
            .count();

        Program {
            text: out.join("\n"),
            stack_length,
            instruction_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge;
    use crate::config::{Curve, Method};

    fn renderer() -> Renderer {
        Renderer::new("t_sym", true, FramePointer::Omit, false)
    }

    #[test]
    fn baseline_renders_without_undefined_markers() {
        let model = bridge::fiat_baseline(Curve::Curve25519, Method::Square, false, false)
            .expect("baseline");
        let program = renderer().render(&model);
        assert!(!program.text.contains(UNDEFINED), "{}", program.text);
        assert!(program.text.starts_with("SECTION .text"));
        assert!(program.text.contains("GLOBAL t_sym"));
        assert!(program.text.ends_with("ret"));
        assert!(program.instruction_count > 20);
    }

    #[test]
    fn rendering_is_deterministic() {
        let model =
            bridge::fiat_baseline(Curve::P256, Method::Mul, false, false).expect("baseline");
        let a = renderer().render(&model);
        let b = renderer().render(&model);
        assert_eq!(a.text, b.text);
        assert_eq!(a.stack_length, b.stack_length);
    }

    #[test]
    fn mul_baseline_reads_both_arguments() {
        let model =
            bridge::fiat_baseline(Curve::Curve25519, Method::Mul, false, false).expect("baseline");
        let program = renderer().render(&model);
        assert!(program.text.contains("mov r10, rdx"));
        assert!(program.text.contains("[rsi"));
        assert!(program.text.contains("[r10"));
    }

    #[test]
    fn square_baseline_reads_only_arg1() {
        let model = bridge::fiat_baseline(Curve::Curve25519, Method::Square, false, false)
            .expect("baseline");
        let program = renderer().render(&model);
        assert!(!program.text.contains("mov r10, rdx"));
    }

    #[test]
    fn frame_pointer_save_emits_prologue() {
        let model = bridge::fiat_baseline(Curve::Curve25519, Method::Square, false, false)
            .expect("baseline");
        let r = Renderer::new("t_sym", true, FramePointer::Save, false);
        let program = r.render(&model);
        assert!(program.text.contains("push rbp"));
        assert!(program.text.contains("mov rbp, rsp"));
        assert!(program.text.contains("pop rbp"));
    }

    #[test]
    fn dangling_reference_renders_undefined_marker() {
        use crate::ir::{Model, Node, Op, Operand};
        // Node 1 references node 99 which does not exist; deps are empty so
        // the model itself validates.
        let mut n = Node::new(1, Op::Lea, vec![Operand::Imm(1), Operand::Imm(2)]);
        n.args = vec![Operand::node_ref(99), Operand::Imm(2)];
        n.deps.clear();
        let model = Model::new(vec![n]).unwrap();
        let program = renderer().render(&model);
        assert!(program.text.contains(UNDEFINED));
    }
}
