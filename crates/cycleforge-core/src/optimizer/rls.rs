//! Random local search: one mutation per evaluation, accepted whenever the
//! mutated candidate measures no worse than the incumbent. Ties are
//! accepted on purpose; drifting across equal-cost plateaus is where many
//! scheduling wins hide.

use crate::analyse::analyse;
use crate::error::ForgeResult;
use crate::optimizer::{
    clamp_batch_size, CandidateSlot, SearchContext, SearchOutcome, INITIAL_BATCH_SIZE,
    NUM_BATCHES, PRINT_EVERY,
};
use crate::stats::MutationRecord;
use tracing::info;

pub fn run(ctx: &mut SearchContext, budget: u64) -> ForgeResult<SearchOutcome> {
    let program = ctx.renderer.render(ctx.model);
    let baseline = CandidateSlot {
        asm: program.text,
        stack_length: program.stack_length,
        kind: None,
        instruction_count: program.instruction_count,
    };
    if budget == 0 {
        return Ok(SearchOutcome {
            asm: baseline.asm,
            ratio: 1.0,
            cycles: f64::MAX,
            instruction_count: baseline.instruction_count,
            evals_used: 0,
        });
    }

    let mut slots = [baseline.clone(), baseline];
    let mut current = 0usize;
    let mut batch_size = INITIAL_BATCH_SIZE;
    let mut last_ratio = 1.0;
    let mut last_cycles = f64::MAX;
    let mut last_sampled: Option<u64> = None;

    for eval in 0..budget {
        let (kind, perm_detail, dec_detail) = if eval == 0 {
            (None, String::new(), String::new())
        } else {
            let cand = 1 - current;
            let (kind, perm, dec) = ctx.mutate_once();
            let prog = ctx.renderer.render(ctx.model);
            slots[cand] = CandidateSlot {
                asm: prog.text,
                stack_length: prog.stack_length,
                kind: Some(kind),
                instruction_count: prog.instruction_count,
            };
            (Some(kind), perm, dec)
        };

        let raw = ctx.measurer.measure(
            &[slots[0].asm.as_str(), slots[1].asm.as_str()],
            batch_size,
            NUM_BATCHES,
        )?;
        let analysis = match analyse(&raw) {
            Ok(a) => a,
            Err(e) => {
                ctx.persist_failure(&e, &slots[0].asm, &slots[1].asm);
                return Err(e);
            }
        };
        let check = analysis.check_median();
        batch_size = clamp_batch_size(ctx.opts.cyclegoal, batch_size, check);

        let kept = if eval == 0 {
            true
        } else {
            let cand = 1 - current;
            let accept = analysis.raw_median[cand] <= analysis.raw_median[current];
            if accept {
                current = cand;
            } else {
                ctx.model.revert_last_mutation()?;
            }
            accept
        };

        let evaluation = ctx.stats.evals_done;
        ctx.stats.record_mutation(MutationRecord {
            evaluation,
            choice: kind,
            kept,
            permutation: perm_detail,
            decision: dec_detail,
        });

        let m0 = analysis.raw_median[0];
        let m1 = analysis.raw_median[1];
        let best = m0.min(m1);
        let ratio = if best > 0.0 { check / best } else { 1.0 };
        let best_idx = if m0 <= m1 { 0 } else { 1 };
        let marks = ctx
            .stats
            .consider_best(&slots[best_idx].asm, ratio, best, eval as usize);
        last_ratio = ratio;
        last_cycles = analysis.raw_median[current];

        if eval % PRINT_EVERY as u64 == 0 {
            info!(
                "{eval:>6} bs {batch_size:>5} [{}] cur {:>9.1} cand {:>9.1} ratio {ratio:.4}{}",
                analysis.chunks[current],
                analysis.raw_median[current],
                analysis.raw_median[1 - current],
                marks.marker(),
            );
            ctx.stats.note_convergence(ratio);
            last_sampled = Some(eval);
        }
    }

    if last_sampled != Some(budget - 1) {
        ctx.stats.note_convergence(last_ratio);
    }

    Ok(SearchOutcome {
        asm: slots[current].asm.clone(),
        ratio: last_ratio,
        cycles: last_cycles,
        instruction_count: slots[current].instruction_count,
        evals_used: budget,
    })
}
