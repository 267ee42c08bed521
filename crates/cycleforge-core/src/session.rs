//! Run orchestration: owns the Rng, the Model, and the statistics sink,
//! wires them through the bet controller, and writes everything the run
//! leaves behind (result assembly, mutation log, state file).

use crate::asm::{Renderer, UNDEFINED};
use crate::bridge;
use crate::config::RunOptions;
use crate::error::{ForgeError, ForgeResult};
use crate::ir::Model;
use crate::measure::Measurer;
use crate::optimizer::bets::run_tournament;
use crate::rng::Rng;
use crate::stats::Statistics;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;
use tracing::{info, warn};

pub const CACHE_DIR_NAME: &str = "cycleforge.cache";

/// Environment variable naming the external equivalence prover binary.
pub const PROVER_ENV: &str = "CYCLEFORGE_PROVER";
const PROVER_DEFAULT: &str = "cfprove";

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub asm_path: PathBuf,
    pub ratio: f64,
    pub cycles: f64,
    pub evals: u64,
    pub optimize_seconds: f64,
    pub validate_seconds: Option<f64>,
}

pub struct Session {
    opts: RunOptions,
    rng: Rng,
    model: Model,
    stats: Statistics,
    cache_dir: PathBuf,
}

impl Session {
    pub fn new(opts: RunOptions) -> ForgeResult<Self> {
        opts.validate()?;
        let rng = Rng::with_seed(opts.effective_seed());
        let cache_dir = std::env::temp_dir()
            .join(CACHE_DIR_NAME)
            .join(rng.short_id());
        std::fs::create_dir_all(&cache_dir)?;
        info!("session seed {} cache {}", rng.seed(), cache_dir.display());

        let model = bridge::load_baseline(&opts)?;
        Ok(Self {
            opts,
            rng,
            model,
            stats: Statistics::new(),
            cache_dir,
        })
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    pub fn run(&mut self, measurer: &mut dyn Measurer) -> ForgeResult<RunSummary> {
        let result = self.run_inner(measurer);
        measurer.destroy();
        // A failed run leaves the cache dir behind: it holds the persisted
        // artefacts of whatever went wrong.
        if result.is_ok() && !self.opts.verbose {
            if let Err(e) = std::fs::remove_dir_all(&self.cache_dir) {
                warn!("could not clean cache dir: {e}");
            }
        }
        result
    }

    fn run_inner(&mut self, measurer: &mut dyn Measurer) -> ForgeResult<RunSummary> {
        let symbol = self.opts.symbol();
        let renderer = Renderer::new(
            &symbol,
            self.opts.redzone(),
            self.opts.frame_pointer,
            self.opts.xmm,
        );

        let baseline = renderer.render(&self.model);
        if baseline.text.contains(UNDEFINED) {
            let path = self.cache_dir.join("undefined_baseline.asm");
            std::fs::write(&path, &baseline.text)?;
            return Err(ForgeError::AssembleUndefined(format!(
                "baseline persisted to {}",
                path.display()
            )));
        }
        info!(
            "baseline: {} instructions, {} bytes of stack",
            baseline.instruction_count, baseline.stack_length
        );

        let evals = self.opts.evals()?;
        let optimize_start = Instant::now();
        let outcome = run_tournament(
            &mut self.model,
            &self.rng,
            &renderer,
            measurer,
            &mut self.stats,
            &self.opts,
            &self.cache_dir,
            evals,
        )?;
        let optimize_seconds = optimize_start.elapsed().as_secs_f64();

        let result_dir = self.opts.result_dir();
        std::fs::create_dir_all(&result_dir)?;

        let ratio_str = format!("{:.4}", outcome.ratio);
        let asm_path = result_dir.join(format!("{symbol}_ratio{ratio_str}.asm"));

        let mut content = outcome.asm.clone();
        content.push('\n');
        content.push_str(&self.statistics_block(&outcome.asm, outcome.ratio, outcome.cycles));
        content.push_str(&format!("; time optimization {optimize_seconds:.1}s\n"));
        std::fs::write(&asm_path, &content)?;

        self.stats
            .write_mutation_csv(result_dir.join(format!("{symbol}.csv")))?;
        std::fs::write(
            result_dir.join(format!("seed{}.dat", self.rng.short_id())),
            self.model.export()?,
        )?;

        // Contract line for wrapper tooling; parsed by parameter sweeps.
        println!("Final ratio: {ratio_str}");

        let validate_seconds = if self.opts.proof() {
            let secs = self.prove(&asm_path)?;
            let mut appended = std::fs::read_to_string(&asm_path)?;
            appended.push_str(&format!("; validated in {secs:.0}s\n"));
            std::fs::write(&asm_path, appended)?;
            Some(secs)
        } else {
            None
        };

        info!(
            "result written to {} (ratio {ratio_str}, {} evals)",
            asm_path.display(),
            self.stats.evals_done
        );

        Ok(RunSummary {
            asm_path,
            ratio: outcome.ratio,
            cycles: outcome.cycles,
            evals: self.stats.evals_done,
            optimize_seconds,
            validate_seconds,
        })
    }

    fn statistics_block(&self, asm: &str, ratio: f64, cycles: f64) -> String {
        let instructions = asm
            .lines()
            .filter(|l| !l.starts_with("SECTION") && !l.starts_with("GLOBAL") && !l.ends_with(':'))
            .count();
        let mut block = String::new();
        block.push_str(&format!("; seed {}\n", self.rng.seed()));
        block.push_str(&format!("; evals {}\n", self.stats.evals_done));
        block.push_str(&format!("; ratio {ratio:.4}\n"));
        block.push_str(&format!("; cycles {cycles:.1}\n"));
        block.push_str(&format!("; instructions {instructions}\n"));
        if let Some(best) = &self.stats.best_by_ratio {
            block.push_str(&format!(
                "; best epoch (by ratio) {} at {:.4}\n",
                best.epoch, best.ratio
            ));
        }
        if let Some(comment) = &self.opts.log_comment {
            block.push_str(&format!("; comment {comment}\n"));
        }
        block
    }

    /// Blocking call into the external equivalence prover. Its runtime is
    /// accounted under validation, not optimization.
    fn prove(&self, asm_path: &std::path::Path) -> ForgeResult<f64> {
        let prover =
            std::env::var(PROVER_ENV).unwrap_or_else(|_| PROVER_DEFAULT.to_string());
        let mut cmd = Command::new(&prover);
        cmd.arg(asm_path);
        if !self.opts.c_file.is_empty() {
            cmd.arg(&self.opts.c_file);
        }
        let shown = format!("{prover} {}", asm_path.display());
        info!("invoking prover: {shown}");

        let start = Instant::now();
        let status = cmd
            .status()
            .map_err(|e| ForgeError::ProofUnsuccessful(format!("{shown}: {e}")))?;
        let secs = start.elapsed().as_secs_f64();
        if !status.success() {
            return Err(ForgeError::ProofUnsuccessful(format!(
                "{shown} exited with {status}"
            )));
        }
        Ok(secs)
    }
}
