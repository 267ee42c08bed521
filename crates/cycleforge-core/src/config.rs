//! Run configuration: every knob of the search, shared between the CLI and
//! the library. Unknown discriminant strings are rejected by clap at parse
//! time; cross-field rules live in [`RunOptions::validate`].

use crate::error::{ForgeError, ForgeResult};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! value_enum_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let v = self.to_possible_value().expect("no skipped variants");
                write!(f, "{}", v.get_name())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Curve {
    Curve25519,
    P256,
    P384,
    P521,
    Secp256k1,
}
value_enum_display!(Curve);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Method {
    Mul,
    Square,
}
value_enum_display!(Method);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Bridge {
    Fiat,
    Manual,
    BitcoinCore,
    Jasmin,
}
value_enum_display!(Bridge);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OptimizerKind {
    Rls,
    Sa,
}
value_enum_display!(OptimizerKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum FramePointer {
    Omit,
    Save,
    Constant,
}
value_enum_display!(FramePointer);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum MemoryConstraints {
    None,
    All,
    Out1Arg1,
}
value_enum_display!(MemoryConstraints);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum CoolingSchedule {
    Exp,
    Lin,
    Log,
}
value_enum_display!(CoolingSchedule);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum NeighborStrategy {
    Uniform,
    Greedy,
    Weighted,
}
value_enum_display!(NeighborStrategy);

pub const FIAT_CURVES: &[Curve] = &[
    Curve::Curve25519,
    Curve::P256,
    Curve::P384,
    Curve::P521,
    Curve::Secp256k1,
];
pub const FIAT_METHODS: &[Method] = &[Method::Mul, Method::Square];
pub const BITCOIN_CORE_METHODS: &[Method] = &[Method::Mul, Method::Square];

/// Parse an evaluation budget: plain integers, scientific notation, and the
/// k/M/T suffixes ("10k", "0.4M", "4e9").
pub fn parse_evals(s: &str) -> ForgeResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ForgeError::BadConfig("empty evals".into()));
    }
    let (body, multiplier) = match s.chars().last().unwrap() {
        'k' => (&s[..s.len() - 1], 1e3),
        'M' => (&s[..s.len() - 1], 1e6),
        'T' => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };
    let value: f64 = body
        .parse()
        .map_err(|_| ForgeError::BadConfig(format!("cannot parse evals '{s}'")))?;
    let evals = value * multiplier;
    if !evals.is_finite() || evals < 1.0 {
        return Err(ForgeError::BadConfig(format!(
            "evals must be a positive count, got '{s}'"
        )));
    }
    Ok(evals.round() as u64)
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaOptions {
    #[arg(long = "saInitialTemperature", default_value_t = 18351.0)]
    pub initial_temperature: f64,

    #[arg(long = "saVisitParam", default_value_t = 1.62)]
    pub visit_param: f64,

    #[arg(long = "saAcceptParam", default_value_t = 1.0 / 5.515)]
    pub accept_param: f64,

    #[arg(long = "saNeighborStrategy", value_enum, default_value_t = NeighborStrategy::Greedy)]
    pub neighbor_strategy: NeighborStrategy,

    #[arg(long = "saNumNeighbors", default_value_t = 1)]
    pub num_neighbors: usize,

    #[arg(long = "saStepSizeParam", default_value_t = 0.005)]
    pub step_size_param: f64,

    /// Upper clamp on mutation step counts; any value <= 0 means unlimited.
    #[arg(long = "saMaxMutStepSize", default_value_t = -1, allow_hyphen_values = true)]
    pub max_mut_step_size: i64,

    #[arg(long = "saCoolingSchedule", value_enum, default_value_t = CoolingSchedule::Exp)]
    pub cooling_schedule: CoolingSchedule,
}

impl Default for SaOptions {
    fn default() -> Self {
        Self {
            initial_temperature: 18351.0,
            visit_param: 1.62,
            accept_param: 1.0 / 5.515,
            neighbor_strategy: NeighborStrategy::Greedy,
            num_neighbors: 1,
            step_size_param: 0.005,
            max_mut_step_size: -1,
            cooling_schedule: CoolingSchedule::Exp,
        }
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    #[arg(long, value_enum, default_value_t = Curve::Curve25519)]
    pub curve: Curve,

    #[arg(long, value_enum, default_value_t = Method::Square)]
    pub method: Method,

    #[arg(long, value_enum, default_value_t = Bridge::Fiat)]
    pub bridge: Bridge,

    /// Exported model state; required for the manual bridge.
    #[arg(long = "jsonFile", default_value = "")]
    pub json_file: String,

    /// Reference C source handed to the prover; required for the manual
    /// bridge.
    #[arg(long = "cFile", default_value = "")]
    pub c_file: String,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Rls)]
    pub optimizer: OptimizerKind,

    /// Master seed; defaults to the current time in milliseconds.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Total evaluation budget ("10k", "0.4M", "1e3", ...).
    #[arg(long, default_value = "10k")]
    pub evals: String,

    #[arg(long, default_value_t = 10)]
    pub bets: usize,

    #[arg(long = "betRatio", default_value_t = 0.2)]
    pub bet_ratio: f64,

    /// Shortcut for bets=1, betRatio=1.
    #[arg(long, default_value_t = false)]
    pub single: bool,

    /// Target cycles per batch measurement, drives batch-size self-tuning.
    #[arg(long, default_value_t = 10_000)]
    pub cyclegoal: u64,

    /// Allow vector registers as spill targets.
    #[arg(long, default_value_t = false)]
    pub xmm: bool,

    /// Start spill decisions on the vector side.
    #[arg(long = "preferXmm", default_value_t = false)]
    pub prefer_xmm: bool,

    /// Disable use of the System V red zone.
    #[arg(long = "no-redzone", default_value_t = false)]
    pub no_redzone: bool,

    #[arg(long = "framePointer", value_enum, default_value_t = FramePointer::Omit)]
    pub frame_pointer: FramePointer,

    #[arg(long = "memoryConstraints", value_enum, default_value_t = MemoryConstraints::None)]
    pub memory_constraints: MemoryConstraints,

    /// Skip the external prover after optimization.
    #[arg(long = "no-proof", default_value_t = false)]
    pub no_proof: bool,

    /// Output directory; empty means ./results-<curve>-<method>.
    #[arg(long = "resultDir", default_value = "")]
    pub result_dir: String,

    /// Resume the model from a previously exported JSON state.
    #[arg(long = "readState")]
    pub read_state: Option<PathBuf>,

    /// Resume from the best prior result in the result dir.
    #[arg(long = "startFromBestJson", default_value_t = false)]
    pub start_from_best_json: bool,

    #[arg(long = "logFile")]
    pub log_file: Option<PathBuf>,

    #[arg(long = "logComment")]
    pub log_comment: Option<String>,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    #[command(flatten)]
    #[serde(flatten)]
    pub sa: SaOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            curve: Curve::Curve25519,
            method: Method::Square,
            bridge: Bridge::Fiat,
            json_file: String::new(),
            c_file: String::new(),
            optimizer: OptimizerKind::Rls,
            seed: None,
            evals: "10k".to_string(),
            bets: 10,
            bet_ratio: 0.2,
            single: false,
            cyclegoal: 10_000,
            xmm: false,
            prefer_xmm: false,
            no_redzone: false,
            frame_pointer: FramePointer::Omit,
            memory_constraints: MemoryConstraints::None,
            no_proof: false,
            result_dir: String::new(),
            read_state: None,
            start_from_best_json: false,
            log_file: None,
            log_comment: None,
            verbose: false,
            sa: SaOptions::default(),
        }
    }
}

impl RunOptions {
    pub fn proof(&self) -> bool {
        !self.no_proof
    }

    pub fn redzone(&self) -> bool {
        !self.no_redzone
    }

    pub fn evals(&self) -> ForgeResult<u64> {
        parse_evals(&self.evals)
    }

    /// Seed actually used: explicit, or the wall clock in milliseconds.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
    }

    /// Effective bet parameters; `--single` collapses the tournament.
    pub fn bet_plan(&self) -> (usize, f64) {
        if self.single {
            (1, 1.0)
        } else {
            (self.bets, self.bet_ratio)
        }
    }

    pub fn symbol(&self) -> String {
        if self.bridge == Bridge::Manual && !self.json_file.is_empty() {
            let stem = Path::new(&self.json_file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "manual".to_string());
            return stem;
        }
        format!("{}_{}", self.curve, self.method)
    }

    pub fn result_dir(&self) -> PathBuf {
        if self.result_dir.is_empty() {
            PathBuf::from(format!("results-{}-{}", self.curve, self.method))
        } else {
            PathBuf::from(&self.result_dir)
        }
    }

    /// Cross-field validation. Violations are configuration errors that the
    /// CLI surfaces as a parameter parse failure.
    pub fn validate(&self) -> ForgeResult<()> {
        self.evals()?;

        if self.bets < 1 {
            return Err(ForgeError::BadConfig("bets must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.bet_ratio) {
            return Err(ForgeError::BadConfig(format!(
                "betRatio must be in [0,1], got {}",
                self.bet_ratio
            )));
        }
        if self.cyclegoal == 0 {
            return Err(ForgeError::BadConfig("cyclegoal must be positive".into()));
        }

        match self.bridge {
            Bridge::Fiat => {
                if !FIAT_CURVES.contains(&self.curve) {
                    return Err(ForgeError::BadConfig(format!(
                        "curve {} is not a fiat curve",
                        self.curve
                    )));
                }
                if !FIAT_METHODS.contains(&self.method) {
                    return Err(ForgeError::BadConfig(format!(
                        "method {} is not a fiat method",
                        self.method
                    )));
                }
            }
            Bridge::BitcoinCore => {
                if !BITCOIN_CORE_METHODS.contains(&self.method) {
                    return Err(ForgeError::BadConfig(format!(
                        "method {} is not a bitcoin-core method",
                        self.method
                    )));
                }
            }
            Bridge::Jasmin => {}
            Bridge::Manual => {
                if self.json_file.is_empty() || self.c_file.is_empty() {
                    return Err(ForgeError::BadConfig(
                        "bridge=manual needs --jsonFile and --cFile".into(),
                    ));
                }
                if !Path::new(&self.json_file).is_file() {
                    return Err(ForgeError::BadConfig(format!(
                        "jsonFile '{}' is not readable",
                        self.json_file
                    )));
                }
                if !Path::new(&self.c_file).is_file() {
                    return Err(ForgeError::BadConfig(format!(
                        "cFile '{}' is not readable",
                        self.c_file
                    )));
                }
            }
        }

        if self.optimizer == OptimizerKind::Sa {
            let sa = &self.sa;
            if sa.initial_temperature <= 0.0 {
                return Err(ForgeError::BadConfig(
                    "saInitialTemperature must be positive".into(),
                ));
            }
            if sa.step_size_param <= 0.0 {
                return Err(ForgeError::BadConfig(
                    "saStepSizeParam must be positive".into(),
                ));
            }
            if sa.num_neighbors < 1 {
                return Err(ForgeError::BadConfig("saNumNeighbors must be >= 1".into()));
            }
            if sa.neighbor_strategy == NeighborStrategy::Weighted && sa.num_neighbors < 2 {
                return Err(ForgeError::BadConfig(
                    "weighted neighbor strategy needs saNumNeighbors >= 2".into(),
                ));
            }
            match sa.cooling_schedule {
                CoolingSchedule::Exp => {
                    if sa.visit_param <= 1.0 {
                        return Err(ForgeError::BadConfig(
                            "exp cooling needs saVisitParam > 1".into(),
                        ));
                    }
                }
                CoolingSchedule::Lin => {
                    if sa.visit_param <= 0.0 {
                        return Err(ForgeError::BadConfig(
                            "lin cooling needs saVisitParam > 0".into(),
                        ));
                    }
                }
                CoolingSchedule::Log => {
                    if sa.visit_param <= 0.0 || sa.visit_param >= 2.62 {
                        return Err(ForgeError::BadConfig(
                            "log cooling needs saVisitParam in (0, 2.62)".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Render back to an argv that parses to an equivalent configuration.
    pub fn render_argv(&self) -> Vec<String> {
        let mut argv = vec![
            format!("--curve={}", self.curve),
            format!("--method={}", self.method),
            format!("--bridge={}", self.bridge),
            format!("--optimizer={}", self.optimizer),
            format!("--evals={}", self.evals),
            format!("--bets={}", self.bets),
            format!("--betRatio={}", self.bet_ratio),
            format!("--cyclegoal={}", self.cyclegoal),
            format!("--framePointer={}", self.frame_pointer),
            format!("--memoryConstraints={}", self.memory_constraints),
            format!("--saInitialTemperature={}", self.sa.initial_temperature),
            format!("--saVisitParam={}", self.sa.visit_param),
            format!("--saAcceptParam={}", self.sa.accept_param),
            format!("--saNeighborStrategy={}", self.sa.neighbor_strategy),
            format!("--saNumNeighbors={}", self.sa.num_neighbors),
            format!("--saStepSizeParam={}", self.sa.step_size_param),
            format!("--saMaxMutStepSize={}", self.sa.max_mut_step_size),
            format!("--saCoolingSchedule={}", self.sa.cooling_schedule),
        ];
        if let Some(seed) = self.seed {
            argv.push(format!("--seed={seed}"));
        }
        if !self.json_file.is_empty() {
            argv.push(format!("--jsonFile={}", self.json_file));
        }
        if !self.c_file.is_empty() {
            argv.push(format!("--cFile={}", self.c_file));
        }
        if self.single {
            argv.push("--single".into());
        }
        if self.xmm {
            argv.push("--xmm".into());
        }
        if self.prefer_xmm {
            argv.push("--preferXmm".into());
        }
        if self.no_redzone {
            argv.push("--no-redzone".into());
        }
        if self.no_proof {
            argv.push("--no-proof".into());
        }
        if !self.result_dir.is_empty() {
            argv.push(format!("--resultDir={}", self.result_dir));
        }
        if let Some(p) = &self.read_state {
            argv.push(format!("--readState={}", p.display()));
        }
        if self.start_from_best_json {
            argv.push("--startFromBestJson".into());
        }
        if let Some(p) = &self.log_file {
            argv.push(format!("--logFile={}", p.display()));
        }
        if let Some(c) = &self.log_comment {
            argv.push(format!("--logComment={c}"));
        }
        if self.verbose {
            argv.push("--verbose".into());
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser, Debug)]
    struct Wrapper {
        #[command(flatten)]
        opts: RunOptions,
    }

    fn parse(args: &[&str]) -> RunOptions {
        let mut argv = vec!["cycleforge"];
        argv.extend_from_slice(args);
        Wrapper::parse_from(argv).opts
    }

    #[rstest]
    #[case("10k", 10_000)]
    #[case("1e3", 1_000)]
    #[case("0.4M", 400_000)]
    #[case("4e9", 4_000_000_000)]
    #[case("2T", 2_000_000_000_000)]
    #[case("100", 100)]
    fn evals_multipliers(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_evals(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("0")]
    #[case("-5")]
    #[case("abc")]
    #[case("0.0k")]
    fn evals_rejects_bad_input(#[case] input: &str) {
        assert!(parse_evals(input).is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let opts = parse(&[]);
        assert_eq!(opts.curve, Curve::Curve25519);
        assert_eq!(opts.method, Method::Square);
        assert_eq!(opts.bridge, Bridge::Fiat);
        assert_eq!(opts.optimizer, OptimizerKind::Rls);
        assert_eq!(opts.evals().unwrap(), 10_000);
        assert_eq!(opts.bets, 10);
        assert!((opts.bet_ratio - 0.2).abs() < 1e-12);
        assert_eq!(opts.cyclegoal, 10_000);
        assert!(opts.redzone());
        assert!(opts.proof());
        assert_eq!(opts.frame_pointer, FramePointer::Omit);
        assert_eq!(opts.sa.num_neighbors, 1);
        assert_eq!(opts.sa.neighbor_strategy, NeighborStrategy::Greedy);
        assert!((opts.sa.initial_temperature - 18351.0).abs() < 1e-9);
        assert!((opts.sa.accept_param - 1.0 / 5.515).abs() < 1e-12);
        assert_eq!(opts.sa.max_mut_step_size, -1);
        opts.validate().unwrap();
    }

    #[test]
    fn single_collapses_the_tournament() {
        let opts = parse(&["--single", "--bets", "7", "--betRatio", "0.5"]);
        assert_eq!(opts.bet_plan(), (1, 1.0));
        let opts = parse(&["--bets", "7", "--betRatio", "0.5"]);
        assert_eq!(opts.bet_plan(), (7, 0.5));
    }

    #[test]
    fn manual_bridge_requires_readable_files() {
        let opts = parse(&["--bridge", "manual"]);
        assert!(opts.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("state.json");
        let c = dir.path().join("ref.c");
        std::fs::write(&json, "{}").unwrap();
        std::fs::write(&c, "int main(){}").unwrap();
        let opts = parse(&[
            "--bridge",
            "manual",
            "--jsonFile",
            json.to_str().unwrap(),
            "--cFile",
            c.to_str().unwrap(),
        ]);
        opts.validate().unwrap();
    }

    #[test]
    fn weighted_strategy_needs_two_neighbors() {
        let opts = parse(&[
            "--optimizer",
            "sa",
            "--saNeighborStrategy",
            "weighted",
            "--saNumNeighbors",
            "1",
        ]);
        assert!(opts.validate().is_err());
        let opts = parse(&[
            "--optimizer",
            "sa",
            "--saNeighborStrategy",
            "weighted",
            "--saNumNeighbors",
            "2",
        ]);
        opts.validate().unwrap();
    }

    #[test]
    fn lin_cooling_accepts_visit_param_one() {
        let opts = parse(&[
            "--optimizer",
            "sa",
            "--saCoolingSchedule",
            "lin",
            "--saVisitParam",
            "1",
        ]);
        opts.validate().unwrap();
        let opts = parse(&["--optimizer", "sa", "--saVisitParam", "1"]);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn argv_round_trip_is_equivalent() {
        let original = parse(&[
            "--curve",
            "secp256k1",
            "--method",
            "mul",
            "--optimizer",
            "sa",
            "--seed",
            "42",
            "--evals",
            "0.4M",
            "--bets",
            "4",
            "--betRatio",
            "0.25",
            "--xmm",
            "--no-redzone",
            "--no-proof",
            "--framePointer",
            "save",
            "--memoryConstraints",
            "out1-arg1",
            "--saNumNeighbors",
            "3",
            "--saCoolingSchedule",
            "log",
            "--saVisitParam",
            "1.5",
            "--verbose",
        ]);
        let rendered = original.render_argv();
        let rendered_refs: Vec<&str> = rendered.iter().map(|s| s.as_str()).collect();
        let reparsed = parse(&rendered_refs);
        assert_eq!(format!("{original:?}"), format!("{reparsed:?}"));
    }

    #[test]
    fn symbol_names_follow_curve_and_method() {
        let opts = parse(&["--curve", "p256", "--method", "mul"]);
        assert_eq!(opts.symbol(), "p256_mul");
        assert_eq!(opts.result_dir(), PathBuf::from("results-p256-mul"));
    }
}
