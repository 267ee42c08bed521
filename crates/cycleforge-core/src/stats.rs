//! Run-wide statistics: best-ever records, the convergence trace, and the
//! per-evaluation mutation log. One instance per session, owned by the
//! session and passed into the optimizers.

use crate::error::ForgeResult;
use crate::ir::MutationKind;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct BestRecord {
    pub asm: String,
    pub ratio: f64,
    pub cycles: f64,
    pub epoch: usize,
}

/// Which best-ever views a candidate just displaced; renders the status
/// line marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BestMarks {
    pub by_ratio: bool,
    pub by_cycles: bool,
}

impl BestMarks {
    pub fn marker(&self) -> &'static str {
        match (self.by_ratio, self.by_cycles) {
            (true, true) => " best:ratio+cycles",
            (true, false) => " best:ratio",
            (false, true) => " best:cycles",
            (false, false) => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub evaluation: u64,
    pub choice: Option<MutationKind>,
    pub kept: bool,
    pub permutation: String,
    pub decision: String,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub convergence: Vec<String>,
    pub mutation_log: Vec<MutationRecord>,
    pub best_by_ratio: Option<BestRecord>,
    pub best_by_cycles: Option<BestRecord>,
    pub evals_done: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mutation(&mut self, record: MutationRecord) {
        self.mutation_log.push(record);
        self.evals_done += 1;
    }

    pub fn note_convergence(&mut self, ratio: f64) {
        self.convergence.push(format!("{ratio:.4}"));
    }

    pub fn last_ratio(&self) -> Option<&str> {
        self.convergence.last().map(|s| s.as_str())
    }

    /// Fold one candidate into both best-ever views; reports which views
    /// it displaced so the caller can mark the status line.
    pub fn consider_best(&mut self, asm: &str, ratio: f64, cycles: f64, epoch: usize) -> BestMarks {
        let better_ratio = self
            .best_by_ratio
            .as_ref()
            .map(|b| ratio > b.ratio)
            .unwrap_or(true);
        if better_ratio {
            self.best_by_ratio = Some(BestRecord {
                asm: asm.to_string(),
                ratio,
                cycles,
                epoch,
            });
        }
        let better_cycles = self
            .best_by_cycles
            .as_ref()
            .map(|b| cycles < b.cycles)
            .unwrap_or(true);
        if better_cycles {
            self.best_by_cycles = Some(BestRecord {
                asm: asm.to_string(),
                ratio,
                cycles,
                epoch,
            });
        }
        BestMarks {
            by_ratio: better_ratio,
            by_cycles: better_cycles,
        }
    }

    pub fn write_mutation_csv<P: AsRef<Path>>(&self, path: P) -> ForgeResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "evaluation",
            "choice",
            "kept",
            "permutation-details",
            "decision-details",
        ])?;
        for r in &self.mutation_log {
            let choice = r
                .choice
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            writer.write_record([
                r.evaluation.to_string(),
                choice,
                r.kept.to_string(),
                r.permutation.clone(),
                r.decision.clone(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
