//! Simulated annealing over the model.
//!
//! Each epoch snapshots the current state, samples N neighbours by applying
//! a Cauchy-drawn number of mutations each, measures the whole slate plus
//! the check, and accepts one neighbour either on improvement or with the
//! generalized acceptance probability `exp(-acceptParam * dE / t)` at the
//! schedule temperature. Non-positive acceptParam turns uphill moves off
//! entirely.

use crate::analyse::analyse;
use crate::config::{CoolingSchedule, NeighborStrategy, SaOptions};
use crate::error::ForgeResult;
use crate::ir::MutationKind;
use crate::optimizer::{
    clamp_batch_size, energy, CandidateSlot, SearchContext, SearchOutcome, INITIAL_BATCH_SIZE,
    NUM_BATCHES, PRINT_EVERY,
};
use crate::rng::Rng;
use crate::stats::MutationRecord;
use itertools::Itertools;
use tracing::info;

const CURRENT_SNAPSHOT: &str = "current";

/// Temperature at step `t`. `n_evals` only matters for the linear ramp.
pub fn temperature(
    schedule: CoolingSchedule,
    t: f64,
    initial: f64,
    visit_param: f64,
    n_evals: f64,
) -> f64 {
    match schedule {
        CoolingSchedule::Exp => {
            let e = visit_param - 1.0;
            initial * (2f64.powf(e) - 1.0) / ((t + 2.0).powf(e) - 1.0)
        }
        CoolingSchedule::Lin => {
            let progress = (t / n_evals).clamp(0.0, 1.0);
            initial * (1.0 - progress) * visit_param
        }
        CoolingSchedule::Log => {
            let denom = ((2.62 - visit_param) * (t + 1.0)).ln();
            if denom <= 0.0 {
                f64::INFINITY
            } else {
                (initial / denom).max(0.0)
            }
        }
    }
}

/// Pick one neighbour index in `1..=N` from the neighbour energies.
pub fn pick_neighbor(
    strategy: NeighborStrategy,
    energies: &[f64],
    rng: &mut Rng,
) -> ForgeResult<usize> {
    let n = energies.len();
    if n == 1 {
        return Ok(1);
    }
    match strategy {
        NeighborStrategy::Uniform => Ok(1 + rng.uniform_index(n)),
        NeighborStrategy::Greedy => {
            let idx = energies
                .iter()
                .position_min_by(|a, b| a.total_cmp(b))
                .unwrap_or(0);
            Ok(1 + idx)
        }
        NeighborStrategy::Weighted => {
            let sum: f64 = energies.iter().sum();
            let weights: Vec<f64> = if sum > 0.0 {
                energies
                    .iter()
                    .map(|&e| (1.0 - e / sum) / (n as f64 - 1.0))
                    .collect()
            } else {
                vec![1.0; n]
            };
            Ok(1 + rng.pick_weighted(&weights)?)
        }
    }
}

/// Metropolis-style acceptance: downhill always, uphill with the
/// generalized probability, never when the accept parameter is off.
pub fn should_accept(e0: f64, ej: f64, accept_param: f64, t: f64, rng: &mut Rng) -> bool {
    if ej < e0 {
        return true;
    }
    if accept_param <= 0.0 || t <= 0.0 {
        return false;
    }
    let p = (-accept_param * (ej - e0) / t).exp().min(1.0);
    rng.uniform_real() < p
}

/// Number of mutations for one neighbour draw: Cauchy around 1, clamped to
/// the configured cap before any mutation is applied.
fn step_count(sa: &SaOptions, temperature_now: f64, rng: &mut Rng) -> ForgeResult<usize> {
    let scale = temperature_now / sa.step_size_param;
    let raw = if scale > 0.0 && scale.is_finite() {
        rng.cauchy(1.0, scale)?.round()
    } else {
        1.0
    };
    let upper = if sa.max_mut_step_size > 0 {
        sa.max_mut_step_size as f64
    } else {
        f64::MAX
    };
    Ok(raw.clamp(1.0, upper) as usize)
}

pub fn run(ctx: &mut SearchContext, budget: u64) -> ForgeResult<SearchOutcome> {
    let program = ctx.renderer.render(ctx.model);
    let mut slots: Vec<CandidateSlot> = vec![CandidateSlot {
        asm: program.text,
        stack_length: program.stack_length,
        kind: None,
        instruction_count: program.instruction_count,
    }];
    if budget == 0 {
        return Ok(SearchOutcome {
            asm: slots[0].asm.clone(),
            ratio: 1.0,
            cycles: f64::MAX,
            instruction_count: slots[0].instruction_count,
            evals_used: 0,
        });
    }

    let sa = ctx.opts.sa.clone();
    let n = sa.num_neighbors;
    slots.resize(n + 1, CandidateSlot::default());

    let mut batch_size = INITIAL_BATCH_SIZE;
    let mut evals_used = 0u64;
    let mut epoch = 0usize;
    let mut last_ratio = 1.0;
    let mut last_cycles = f64::MAX;
    let mut last_sampled: Option<usize> = None;

    while evals_used < budget {
        ctx.model.save_snapshot(CURRENT_SNAPSHOT);
        let t_now = temperature(
            sa.cooling_schedule,
            epoch as f64,
            sa.initial_temperature,
            sa.visit_param,
            ctx.total_evals as f64,
        );

        let mut neighbor_details: Vec<(usize, MutationKind, String, String)> =
            Vec::with_capacity(n);
        for i in 1..=n {
            let k = step_count(&sa, t_now, ctx.rng)?;
            let mut perm = String::new();
            let mut dec = String::new();
            let mut permutations = 0usize;
            let mut decisions = 0usize;
            for _ in 0..k {
                let (kind, p, d) = ctx.mutate_once();
                match kind {
                    MutationKind::Permutation => {
                        permutations += 1;
                        perm = p;
                    }
                    MutationKind::Decision => {
                        decisions += 1;
                        dec = d;
                    }
                }
            }
            let dominant = if decisions > permutations {
                MutationKind::Decision
            } else {
                MutationKind::Permutation
            };
            ctx.model.save_snapshot(&i.to_string());
            let prog = ctx.renderer.render(ctx.model);
            slots[i] = CandidateSlot {
                asm: prog.text,
                stack_length: prog.stack_length,
                kind: None,
                instruction_count: prog.instruction_count,
            };
            ctx.model.restore_snapshot(CURRENT_SNAPSHOT)?;
            neighbor_details.push((k, dominant, perm, dec));
        }

        let texts: Vec<&str> = slots.iter().map(|s| s.asm.as_str()).collect();
        let raw = ctx.measurer.measure(&texts, batch_size, NUM_BATCHES)?;
        let analysis = match analyse(&raw) {
            Ok(a) => a,
            Err(e) => {
                let b = if slots.len() > 1 { &slots[1].asm } else { &slots[0].asm };
                ctx.persist_failure(&e, &slots[0].asm, b);
                return Err(e);
            }
        };
        let check = analysis.check_median();
        batch_size = clamp_batch_size(ctx.opts.cyclegoal, batch_size, check);

        let energies: Vec<f64> = (1..=n).map(|i| energy(analysis.raw_median[i])).collect();
        let j = pick_neighbor(sa.neighbor_strategy, &energies, ctx.rng)?;
        let e0 = energy(analysis.raw_median[0]);
        let ej = energies[j - 1];

        let accept = should_accept(e0, ej, sa.accept_param, t_now, ctx.rng);

        if accept {
            slots[0] = slots[j].clone();
            ctx.model.restore_snapshot(&j.to_string())?;
        } else {
            ctx.model.restore_snapshot(CURRENT_SNAPSHOT)?;
        }

        for (i, (k, dominant, perm, dec)) in neighbor_details.iter().enumerate() {
            let evaluation = ctx.stats.evals_done;
            ctx.stats.record_mutation(MutationRecord {
                evaluation,
                choice: Some(*dominant),
                kept: accept && i + 1 == j,
                permutation: format!("steps={k};{perm}"),
                decision: dec.clone(),
            });
        }
        evals_used += n as u64;

        let best = analysis
            .raw_median
            .iter()
            .take(n + 1)
            .cloned()
            .fold(f64::MAX, f64::min);
        let ratio = if best > 0.0 { check / best } else { 1.0 };
        let best_idx = analysis
            .raw_median
            .iter()
            .take(n + 1)
            .position_min_by(|a, b| a.total_cmp(b))
            .unwrap_or(0);
        let marks = ctx
            .stats
            .consider_best(&slots[best_idx].asm, ratio, best, epoch);
        last_ratio = ratio;
        last_cycles = analysis.raw_median[0];

        if epoch % PRINT_EVERY == 0 {
            info!(
                "{epoch:>6} t {t_now:>9.1} bs {batch_size:>5} [{}] cur {:>9.1} pick {j} ratio {ratio:.4}{}",
                analysis.chunks[0],
                e0,
                marks.marker(),
            );
            ctx.stats.note_convergence(ratio);
            last_sampled = Some(epoch);
        }
        epoch += 1;
    }

    if last_sampled != Some(epoch - 1) {
        ctx.stats.note_convergence(last_ratio);
    }

    for i in 1..=n {
        ctx.model.drop_snapshot(&i.to_string());
    }
    ctx.model.drop_snapshot(CURRENT_SNAPSHOT);

    Ok(SearchOutcome {
        asm: slots[0].asm.clone(),
        ratio: last_ratio,
        cycles: last_cycles,
        instruction_count: slots[0].instruction_count,
        evals_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CoolingSchedule::Exp, 1.62)]
    #[case(CoolingSchedule::Lin, 1.0)]
    #[case(CoolingSchedule::Lin, 2.5)]
    #[case(CoolingSchedule::Log, 1.0)]
    #[case(CoolingSchedule::Log, 1.62)]
    fn cooling_is_monotone_non_increasing(
        #[case] schedule: CoolingSchedule,
        #[case] q: f64,
    ) {
        let mut prev = f64::INFINITY;
        for t in 0..2000 {
            let temp = temperature(schedule, t as f64, 18351.0, q, 1000.0);
            assert!(temp <= prev, "{schedule:?} rose at t={t}: {temp} > {prev}");
            assert!(temp >= 0.0 || temp.is_infinite());
            prev = temp;
        }
    }

    #[test]
    fn exp_cooling_starts_at_initial_temperature() {
        let t0 = temperature(CoolingSchedule::Exp, 0.0, 500.0, 1.62, 1000.0);
        assert!((t0 - 500.0).abs() < 1e-9);
    }

    #[test]
    fn lin_cooling_hits_documented_points() {
        let f = |t: f64| temperature(CoolingSchedule::Lin, t, 100.0, 1.0, 1000.0);
        assert!((f(0.0) - 100.0).abs() < 1e-9);
        assert!((f(500.0) - 50.0).abs() < 1e-9);
        assert!(f(1000.0).abs() < 1e-9);
        assert!(f(5000.0).abs() < 1e-9);
    }

    #[test]
    fn greedy_returns_argmin() {
        let mut rng = Rng::with_seed(1);
        let energies = [5.0, 3.0, 9.0, 3.5];
        for _ in 0..50 {
            assert_eq!(
                pick_neighbor(NeighborStrategy::Greedy, &energies, &mut rng).unwrap(),
                2
            );
        }
    }

    #[test]
    fn single_neighbor_is_always_picked() {
        let mut rng = Rng::with_seed(2);
        for strategy in [
            NeighborStrategy::Uniform,
            NeighborStrategy::Greedy,
            NeighborStrategy::Weighted,
        ] {
            assert_eq!(pick_neighbor(strategy, &[7.0], &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn weighted_equal_energies_is_uniform() {
        let mut rng = Rng::with_seed(3);
        let energies = [10.0, 10.0, 10.0, 10.0];
        let mut counts = [0usize; 4];
        let n = 40_000;
        for _ in 0..n {
            let j = pick_neighbor(NeighborStrategy::Weighted, &energies, &mut rng).unwrap();
            counts[j - 1] += 1;
        }
        for &c in &counts {
            let share = c as f64 / n as f64;
            assert!((share - 0.25).abs() < 0.02, "share {share}");
        }
    }

    #[test]
    fn weighted_prefers_low_energy() {
        let mut rng = Rng::with_seed(4);
        let energies = [1.0, 99.0];
        let mut low = 0usize;
        for _ in 0..10_000 {
            if pick_neighbor(NeighborStrategy::Weighted, &energies, &mut rng).unwrap() == 1 {
                low += 1;
            }
        }
        assert!(low > 9_000, "low-energy neighbour picked only {low} times");
    }

    #[test]
    fn non_positive_accept_param_never_goes_uphill() {
        let mut rng = Rng::with_seed(6);
        for _ in 0..5000 {
            assert!(!should_accept(100.0, 100.1, 0.0, 1e9, &mut rng));
            assert!(!should_accept(100.0, 100.1, -1.0, 1e9, &mut rng));
        }
        // Downhill is always taken, whatever the parameter.
        assert!(should_accept(100.0, 99.9, 0.0, 1e9, &mut rng));
        assert!(should_accept(100.0, 99.9, -1.0, 0.0, &mut rng));
    }

    #[test]
    fn uphill_acceptance_shrinks_with_temperature() {
        let count_accepts = |t: f64| {
            let mut rng = Rng::with_seed(7);
            (0..10_000)
                .filter(|_| should_accept(100.0, 110.0, 1.0, t, &mut rng))
                .count()
        };
        let hot = count_accepts(1000.0);
        let cold = count_accepts(1.0);
        assert!(hot > cold, "hot {hot} <= cold {cold}");
        assert_eq!(count_accepts(0.0), 0);
    }

    #[test]
    fn step_count_respects_the_cap() {
        let sa = SaOptions {
            max_mut_step_size: 3,
            step_size_param: 0.005,
            ..Default::default()
        };
        let mut rng = Rng::with_seed(5);
        for _ in 0..1000 {
            let k = step_count(&sa, 18351.0, &mut rng).unwrap();
            assert!((1..=3).contains(&k), "step count {k}");
        }
        let unlimited = SaOptions {
            max_mut_step_size: -1,
            ..Default::default()
        };
        for _ in 0..1000 {
            assert!(step_count(&unlimited, 18351.0, &mut rng).unwrap() >= 1);
        }
    }
}
