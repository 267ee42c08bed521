use cycleforge_core::config::{NeighborStrategy, OptimizerKind, RunOptions};
use cycleforge_core::error::{ForgeError, ForgeResult};
use cycleforge_core::measure::{CostModelMeasurer, MeasureFault, Measurer, RawMeasurement};
use cycleforge_core::rng::Rng;
use cycleforge_core::session::Session;
use std::path::Path;

fn base_opts(dir: &Path, seed: u64) -> RunOptions {
    RunOptions {
        seed: Some(seed),
        no_proof: true,
        result_dir: dir
            .join(format!("results-{seed}"))
            .to_string_lossy()
            .into_owned(),
        ..Default::default()
    }
}

#[test]
fn rls_single_run_reports_consistent_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path(), 42);
    opts.evals = "100".into();
    opts.single = true;

    let mut session = Session::new(opts).unwrap();
    let mut measurer = CostModelMeasurer::new(Rng::with_seed(7));
    let summary = session.run(&mut measurer).unwrap();
    assert_eq!(summary.evals, 100);

    let asm = std::fs::read_to_string(&summary.asm_path).unwrap();
    assert!(asm.contains("; evals 100"));
    // The embedded ratio is the run's final convergence sample.
    let ratio_line = asm
        .lines()
        .find(|l| l.starts_with("; ratio "))
        .expect("ratio line");
    assert_eq!(ratio_line, format!("; ratio {:.4}", summary.ratio));

    let result_dir = summary.asm_path.parent().unwrap();
    let csv = std::fs::read_to_string(result_dir.join("curve25519_square.csv")).unwrap();
    assert_eq!(csv.lines().count(), 101);
}

#[test]
fn sa_epochs_consume_neighbors_per_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path(), 43);
    opts.evals = "99".into();
    opts.single = true;
    opts.optimizer = OptimizerKind::Sa;
    opts.sa.num_neighbors = 3;
    opts.sa.neighbor_strategy = NeighborStrategy::Greedy;
    opts.sa.max_mut_step_size = 4;

    let mut session = Session::new(opts).unwrap();
    let mut measurer = CostModelMeasurer::new(Rng::with_seed(8));
    let summary = session.run(&mut measurer).unwrap();
    // 99 evals at 3 per epoch: exactly 33 epochs.
    assert_eq!(summary.evals, 99);
}

#[test]
fn tournament_spends_the_documented_split() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path(), 44);
    opts.evals = "400".into();
    opts.bets = 4;
    opts.bet_ratio = 0.25;

    let mut session = Session::new(opts).unwrap();
    let mut measurer = CostModelMeasurer::new(Rng::with_seed(9));
    let summary = session.run(&mut measurer).unwrap();
    // 4 children x 25 plus 300 for the winner.
    assert_eq!(summary.evals, 400);
}

#[test]
fn whole_pipeline_is_deterministic_per_seed() {
    let run = |tag: &str| {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_opts(dir.path(), 4242);
        opts.evals = "60".into();
        opts.single = true;
        opts.result_dir = dir
            .path()
            .join(format!("res-{tag}"))
            .to_string_lossy()
            .into_owned();
        let mut session = Session::new(opts).unwrap();
        let mut measurer = CostModelMeasurer::new(Rng::with_seed(99));
        let summary = session.run(&mut measurer).unwrap();
        let asm = std::fs::read_to_string(&summary.asm_path).unwrap();
        (summary.ratio.to_bits(), asm)
    };
    let (ratio_a, asm_a) = run("a");
    let (ratio_b, asm_b) = run("b");
    assert_eq!(ratio_a, ratio_b);
    // The assembly body must be byte-identical; the trailing timing comment
    // is wall-clock and may differ.
    let body = |s: &str| {
        s.lines()
            .filter(|l| !l.starts_with("; time "))
            .collect::<Vec<_>>()
            .join("\n")
    };
    assert_eq!(body(&asm_a), body(&asm_b));
}

#[test]
fn incorrect_measurement_aborts_and_persists_artefacts() {
    /// Real measurements until call 7, then an output-mismatch flag.
    struct Poisoned {
        inner: CostModelMeasurer,
        calls: usize,
    }
    impl Measurer for Poisoned {
        fn measure(
            &mut self,
            candidates: &[&str],
            batch_size: usize,
            num_batches: usize,
        ) -> ForgeResult<RawMeasurement> {
            self.calls += 1;
            let mut raw = self.inner.measure(candidates, batch_size, num_batches)?;
            if self.calls == 7 {
                raw.fault = Some(MeasureFault::Incorrect);
            }
            Ok(raw)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path(), 46);
    opts.evals = "100".into();
    opts.single = true;
    opts.verbose = true; // keep the cache dir for inspection

    let mut session = Session::new(opts).unwrap();
    let cache = session.cache_dir().clone();
    let mut measurer = Poisoned {
        inner: CostModelMeasurer::new(Rng::with_seed(11)),
        calls: 0,
    };
    let err = session.run(&mut measurer).unwrap_err();
    assert!(matches!(err, ForgeError::MeasureIncorrect));
    assert_eq!(err.exit_code(), 12);
    assert!(cache.join("tested_incorrect_A.asm").is_file());
    assert!(cache.join("tested_incorrect_B.asm").is_file());
    assert!(cache.join("tested_incorrect.json").is_file());
    std::fs::remove_dir_all(cache).ok();
}

#[test]
fn xmm_spills_show_up_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_opts(dir.path(), 45);
    opts.evals = "20".into();
    opts.single = true;
    opts.xmm = true;
    opts.prefer_xmm = true;

    let mut session = Session::new(opts).unwrap();
    let mut measurer = CostModelMeasurer::new(Rng::with_seed(10));
    let summary = session.run(&mut measurer).unwrap();
    let asm = std::fs::read_to_string(&summary.asm_path).unwrap();
    assert!(asm.contains("movq xmm"), "no vector spills in:\n{asm}");
}
