//! Cycle measurement seam.
//!
//! The optimizer only ever sees [`RawMeasurement`]s coming out of a
//! [`Measurer`]. The production harness runs the candidates natively; the
//! in-repo default is a static cost model that schedules the rendered text
//! through a small in-order pipeline, so the whole search runs and tests
//! end-to-end on any machine. Semantic faults travel inside the measurement
//! and are raised by the analyser.

use crate::error::ForgeResult;
use crate::rng::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureFault {
    /// The harness saw diverging outputs across candidates.
    Incorrect,
    /// A candidate did not assemble.
    Invalid(String),
    Generic(String),
}

#[derive(Debug, Clone)]
pub struct RawMeasurement {
    pub batch_size: usize,
    pub num_batches: usize,
    /// One row per candidate, plus a trailing re-measurement of candidate 0
    /// (the check row). Each entry is the cycle sum of one batch.
    pub batch_sums: Vec<Vec<u64>>,
    pub fault: Option<MeasureFault>,
}

pub trait Measurer {
    fn measure(
        &mut self,
        candidates: &[&str],
        batch_size: usize,
        num_batches: usize,
    ) -> ForgeResult<RawMeasurement>;

    /// Release native resources. The default implementation has none.
    fn destroy(&mut self) {}
}

const ISSUE_WIDTH: f64 = 4.0;

fn latency(mnemonic: &str, has_mem_src: bool) -> Option<f64> {
    let l = match mnemonic {
        "mov" | "movzx" => {
            if has_mem_src {
                4.0
            } else {
                1.0
            }
        }
        "lea" => 1.0,
        "add" | "sub" | "adc" | "sbb" | "adcx" | "adox" | "and" | "or" | "xor" | "test" => 1.0,
        "setc" | "seto" | "setb" => 1.0,
        "mul" | "mulx" => 4.0,
        "imul" => 3.0,
        "shrd" => 3.0,
        "shr" | "shl" | "sar" => 1.0,
        "movq" => 3.0,
        "push" | "pop" => 1.0,
        "ret" => 0.0,
        _ => return None,
    };
    Some(l)
}

fn reads_flags(mnemonic: &str) -> bool {
    matches!(mnemonic, "adc" | "sbb" | "adcx" | "adox" | "setc" | "seto" | "setb")
}

fn writes_flags(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "add" | "sub" | "adc" | "sbb" | "adcx" | "adox" | "and" | "or" | "xor" | "test" | "mul"
            | "imul" | "shrd" | "shr" | "shl" | "sar"
    )
}

/// Canonical 64-bit name for any register token, or None for non-registers.
fn canonical_reg(token: &str) -> Option<&'static str> {
    const GP: &[&str] = &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    const XMM: &[&str] = &[
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
        "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
    ];
    let t = token.trim();
    if t.starts_with("xmm") {
        return XMM.iter().find(|&&x| x == t).copied();
    }
    match t {
        "al" => return Some("rax"),
        "bl" => return Some("rbx"),
        "cl" => return Some("rcx"),
        "dl" => return Some("rdx"),
        "bpl" => return Some("rbp"),
        _ => {}
    }
    if let Some(base) = t.strip_suffix('b') {
        if GP.contains(&base) {
            return GP.iter().find(|&&g| g == base).copied();
        }
    }
    GP.iter().find(|&&g| g == t).copied()
}

fn regs_in(operand: &str) -> Vec<&'static str> {
    operand
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(canonical_reg)
        .collect()
}

/// Estimated cycles for one execution of the candidate, or a fault message.
pub fn estimate_cycles(text: &str) -> Result<f64, String> {
    let mut reg_ready: HashMap<&str, f64> = HashMap::new();
    let mut flags_ready = 0.0f64;
    let mut issue = 0.0f64;
    let mut finish_max = 0.0f64;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with(';')
            || line.starts_with("SECTION")
            || line.starts_with("GLOBAL")
            || line.ends_with(':')
        {
            continue;
        }
        if line.contains("undefined") {
            return Err(format!("unresolved operand in '{line}'"));
        }

        let (mnemonic, rest) = match line.split_once(' ') {
            Some((m, r)) => (m, r),
            None => (line, ""),
        };
        let operands: Vec<&str> = rest.split(',').map(|s| s.trim()).collect();
        let has_mem_src = operands.iter().skip(1).any(|o| o.contains('['))
            || (mnemonic == "mul" && operands.first().is_some_and(|o| o.contains('[')));
        let lat = latency(mnemonic, has_mem_src)
            .ok_or_else(|| format!("unknown mnemonic '{mnemonic}'"))?;

        let mut start = issue;
        // Destination is also a source for read-modify-write forms; treating
        // every named register as a read keeps the model simple and only
        // over-serializes plain movs by one level.
        let writes_dest = !matches!(mnemonic, "push" | "ret" | "test");
        let dest_is_mem = operands.first().map(|o| o.contains('[')).unwrap_or(false);
        for (i, op) in operands.iter().enumerate() {
            if op.is_empty() {
                continue;
            }
            let is_plain_mov_dest = i == 0 && !dest_is_mem && matches!(mnemonic, "mov" | "movq");
            if is_plain_mov_dest {
                continue;
            }
            for r in regs_in(op) {
                start = start.max(*reg_ready.get(r).unwrap_or(&0.0));
            }
        }
        if reads_flags(mnemonic) {
            start = start.max(flags_ready);
        }
        if mnemonic == "mulx" || mnemonic == "mul" {
            start = start.max(*reg_ready.get("rdx").unwrap_or(&0.0));
            if mnemonic == "mul" {
                start = start.max(*reg_ready.get("rax").unwrap_or(&0.0));
            }
        }

        let finish = start + lat;
        if writes_dest && !dest_is_mem {
            if let Some(dst) = operands.first() {
                for r in regs_in(dst) {
                    reg_ready.insert(r, finish);
                }
            }
            if mnemonic == "mulx" {
                if let Some(second) = operands.get(1) {
                    for r in regs_in(second) {
                        reg_ready.insert(r, finish);
                    }
                }
            }
            if mnemonic == "mul" {
                reg_ready.insert("rax", finish);
                reg_ready.insert("rdx", finish);
            }
        }
        if writes_flags(mnemonic) {
            flags_ready = finish;
        }

        finish_max = finish_max.max(finish);
        issue += 1.0 / ISSUE_WIDTH;
    }

    Ok(finish_max.max(issue))
}

/// Deterministic stand-in for the native harness: latency-table scheduling
/// plus a little seeded jitter, so medians behave like real samples.
pub struct CostModelMeasurer {
    rng: Rng,
}

impl CostModelMeasurer {
    pub fn new(rng: Rng) -> Self {
        Self { rng }
    }

    fn batch_rows(&mut self, cycles: f64, batch_size: usize, num_batches: usize) -> Vec<u64> {
        let base = (cycles * batch_size as f64).round() as u64;
        let spread = (base / 200).max(1) as usize;
        (0..num_batches)
            .map(|_| base + self.rng.uniform_index(spread) as u64)
            .collect()
    }
}

impl Measurer for CostModelMeasurer {
    fn measure(
        &mut self,
        candidates: &[&str],
        batch_size: usize,
        num_batches: usize,
    ) -> ForgeResult<RawMeasurement> {
        let mut estimates = Vec::with_capacity(candidates.len());
        for text in candidates {
            match estimate_cycles(text) {
                Ok(c) => estimates.push(c),
                Err(msg) => {
                    return Ok(RawMeasurement {
                        batch_size,
                        num_batches,
                        batch_sums: Vec::new(),
                        fault: Some(MeasureFault::Invalid(msg)),
                    })
                }
            }
        }

        let mut batch_sums: Vec<Vec<u64>> = Vec::with_capacity(candidates.len() + 1);
        for &c in &estimates {
            batch_sums.push(self.batch_rows(c, batch_size, num_batches));
        }
        // Check row: candidate 0 measured again, fresh samples.
        batch_sums.push(self.batch_rows(estimates[0], batch_size, num_batches));

        Ok(RawMeasurement {
            batch_size,
            num_batches,
            batch_sums,
            fault: None,
        })
    }
}
