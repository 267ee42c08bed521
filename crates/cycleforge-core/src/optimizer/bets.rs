//! Bet controller: a tournament of cheap sub-searches.
//!
//! B children run with hash-derived seeds on a fraction of the budget; the
//! one that ends with the best ratio gets its end-state restored and spends
//! the rest. `--single` bypasses the tournament entirely so a run with the
//! master seed is reproduced exactly.

use crate::asm::Renderer;
use crate::config::RunOptions;
use crate::error::{ForgeError, ForgeResult};
use crate::ir::Model;
use crate::measure::Measurer;
use crate::optimizer::{run_search, SearchContext, SearchOutcome};
use crate::rng::Rng;
use crate::stats::Statistics;
use std::path::Path;
use tracing::info;

#[allow(clippy::too_many_arguments)]
pub fn run_tournament(
    model: &mut Model,
    rng: &Rng,
    renderer: &Renderer,
    measurer: &mut dyn Measurer,
    stats: &mut Statistics,
    opts: &RunOptions,
    cache_dir: &Path,
    total_evals: u64,
) -> ForgeResult<SearchOutcome> {
    let (bets, bet_ratio) = opts.bet_plan();

    if bets == 1 && bet_ratio >= 1.0 {
        let mut master = rng.clone();
        let mut ctx = SearchContext {
            model: &mut *model,
            rng: &mut master,
            renderer,
            measurer: &mut *measurer,
            stats: &mut *stats,
            opts,
            cache_dir,
            total_evals,
        };
        return run_search(&mut ctx, total_evals);
    }

    let child_budget = ((total_evals as f64 * bet_ratio) / bets as f64).floor() as u64;
    if child_budget == 0 {
        return Err(ForgeError::BadConfig(format!(
            "bet budget of {total_evals} evals across {bets} bets leaves nothing per child"
        )));
    }

    const BASE_SNAPSHOT: &str = "bet-base";
    model.save_snapshot(BASE_SNAPSHOT);

    let mut winner: Option<(SearchOutcome, Rng, String)> = None;
    for i in 0..bets {
        model.restore_snapshot(BASE_SNAPSHOT)?;
        let mut child_rng = rng.derive(i as u64);
        info!(
            "bet {}/{bets}: seed {} for {child_budget} evals",
            i + 1,
            child_rng.seed()
        );
        let outcome = {
            let mut ctx = SearchContext {
                model: &mut *model,
                rng: &mut child_rng,
                renderer,
                measurer: &mut *measurer,
                stats: &mut *stats,
                opts,
                cache_dir,
                total_evals,
            };
            run_search(&mut ctx, child_budget)?
        };
        info!("bet {} finished at ratio {:.4}", i + 1, outcome.ratio);
        let better = winner
            .as_ref()
            .map(|(best, _, _)| outcome.ratio > best.ratio)
            .unwrap_or(true);
        if better {
            let end_state = model.export()?;
            winner = Some((outcome, child_rng, end_state));
        }
    }

    let (best_outcome, mut best_rng, end_state) =
        winner.expect("at least one bet ran");
    let remaining = (total_evals as f64 * (1.0 - bet_ratio)).floor() as u64;
    if remaining == 0 {
        return Ok(best_outcome);
    }

    info!(
        "continuing best bet (ratio {:.4}) for {remaining} evals",
        best_outcome.ratio
    );
    *model = Model::import_str(&end_state)?;
    let mut ctx = SearchContext {
        model: &mut *model,
        rng: &mut best_rng,
        renderer,
        measurer: &mut *measurer,
        stats: &mut *stats,
        opts,
        cache_dir,
        total_evals,
    };
    run_search(&mut ctx, remaining)
}
