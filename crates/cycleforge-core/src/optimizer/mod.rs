//! Search engines over the model.
//!
//! Both optimizers share the same acceptance protocol: render candidates
//! into fixed-index slots, measure them together with a re-measurement of
//! the current state (the check), and let the medians decide. The check
//! column alone re-tunes the batch size, so search direction never skews
//! the sample budget.

pub mod bets;
pub mod rls;
pub mod sa;

use crate::asm::Renderer;
use crate::config::{OptimizerKind, RunOptions};
use crate::error::{ForgeError, ForgeResult};
use crate::ir::{Model, MutationKind};
use crate::measure::Measurer;
use crate::rng::Rng;
use crate::stats::Statistics;
use std::path::Path;
use tracing::warn;

pub const PRINT_EVERY: usize = 10;
pub const MIN_BATCH_SIZE: usize = 5;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const INITIAL_BATCH_SIZE: usize = 31;
pub const NUM_BATCHES: usize = 11;

/// Batch size for the next measurement, aimed at `cyclegoal` cycles per
/// batch based on the check median of the last one.
pub fn clamp_batch_size(cyclegoal: u64, batch_size: usize, median_check: f64) -> usize {
    if median_check <= 0.0 {
        return batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    }
    let next = (cyclegoal as f64 * batch_size as f64 / median_check).ceil() as usize;
    next.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Scalar objective for annealing acceptance. Identity for now; isolated so
/// a rescale is a one-line change.
pub fn energy(x: f64) -> f64 {
    x
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSlot {
    pub asm: String,
    pub stack_length: usize,
    pub kind: Option<MutationKind>,
    pub instruction_count: usize,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub asm: String,
    pub ratio: f64,
    pub cycles: f64,
    pub instruction_count: usize,
    pub evals_used: u64,
}

pub struct SearchContext<'a> {
    pub model: &'a mut Model,
    pub rng: &'a mut Rng,
    pub renderer: &'a Renderer,
    pub measurer: &'a mut dyn Measurer,
    pub stats: &'a mut Statistics,
    pub opts: &'a RunOptions,
    pub cache_dir: &'a Path,
    /// Total budget of the whole run, for schedules that cool over it.
    pub total_evals: u64,
}

impl<'a> SearchContext<'a> {
    /// Apply one mutation of a uniformly chosen kind; a decision mutation
    /// with no hot decision falls back to a permutation. Returns the log
    /// details (kind, permutation column, decision column).
    pub fn mutate_once(&mut self) -> (MutationKind, String, String) {
        let try_decision = self.rng.coin();
        if try_decision {
            if let Some(flip) = self.model.mutate_decision(self.rng) {
                return (MutationKind::Decision, String::new(), flip.to_string());
            }
        }
        let mv = self.model.mutate_permutation(self.rng);
        (MutationKind::Permutation, mv.to_string(), String::new())
    }

    /// Persist the offending artefacts next to the failure before it
    /// propagates, so a broken candidate can be inspected post mortem.
    pub fn persist_failure(&self, err: &ForgeError, slot_a: &str, slot_b: &str) {
        let write = |name: &str, content: &str| {
            let path = self.cache_dir.join(name);
            if let Err(e) = std::fs::write(&path, content) {
                warn!("could not persist {}: {e}", path.display());
            }
        };
        match err {
            ForgeError::MeasureIncorrect | ForgeError::MeasureInvalid(_) => {
                write("tested_incorrect_A.asm", slot_a);
                write("tested_incorrect_B.asm", slot_b);
                match self.model.export() {
                    Ok(json) => write("tested_incorrect.json", &json),
                    Err(e) => warn!("could not export model for dump: {e}"),
                }
            }
            ForgeError::MeasureGeneric(_) => {
                write("generic_error_A.asm", slot_a);
                write("generic_error_B.asm", slot_b);
            }
            _ => {}
        }
    }
}

/// Run the configured optimizer for `budget` evaluations.
pub fn run_search(ctx: &mut SearchContext, budget: u64) -> ForgeResult<SearchOutcome> {
    match ctx.opts.optimizer {
        OptimizerKind::Rls => rls::run(ctx, budget),
        OptimizerKind::Sa => sa::run(ctx, budget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_stays_in_bounds() {
        assert_eq!(clamp_batch_size(10_000, 100, 1e9), MIN_BATCH_SIZE);
        assert_eq!(clamp_batch_size(10_000, 10_000, 0.5), MAX_BATCH_SIZE);
        assert_eq!(clamp_batch_size(10_000, 100, 10_000.0), 100);
    }

    #[test]
    fn batch_size_is_monotone_in_goal_over_check() {
        let mut last = 0;
        for goal in [100u64, 1_000, 10_000, 100_000] {
            let next = clamp_batch_size(goal, 50, 500.0);
            assert!(next >= last, "goal {goal} gave {next} after {last}");
            last = next;
        }
        let mut last = usize::MAX;
        for check in [10.0f64, 100.0, 1_000.0, 10_000.0] {
            let next = clamp_batch_size(10_000, 50, check);
            assert!(next <= last, "check {check} gave {next} before {last}");
            last = next;
        }
    }

    #[test]
    fn energy_is_identity() {
        assert_eq!(energy(42.5), 42.5);
        assert_eq!(energy(0.0), 0.0);
    }
}
