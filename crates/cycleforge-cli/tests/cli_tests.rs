use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run(args: &[&str], dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cycleforge"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("binary runs")
}

fn quick_args<'a>(result_dir: &'a str, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![
        "--seed",
        "42",
        "--evals",
        "50",
        "--single",
        "--no-proof",
        "--resultDir",
        result_dir,
    ];
    args.extend_from_slice(extra);
    args
}

fn extract_final_ratio(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Final ratio: "))
        .map(|s| s.trim().to_string())
}

#[test]
fn unknown_option_fails_to_parse() {
    let dir = TempDir::new().unwrap();
    let out = run(&["--definitely-not-an-option"], dir.path());
    assert_eq!(out.status.code(), Some(11));
}

#[test]
fn invalid_combination_exits_with_parameter_parse_fail() {
    let dir = TempDir::new().unwrap();
    // manual bridge without jsonFile/cFile
    let out = run(&["--bridge", "manual", "--no-proof"], dir.path());
    assert_eq!(out.status.code(), Some(11));

    let out = run(&["--evals", "0"], dir.path());
    assert_eq!(out.status.code(), Some(11));
}

#[test]
fn rls_run_produces_all_artefacts() {
    let dir = TempDir::new().unwrap();
    let out = run(&quick_args("out", &[]), dir.path());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let ratio = extract_final_ratio(&stdout).expect("Final ratio line");
    let results = dir.path().join("out");
    let asm = results.join(format!("curve25519_square_ratio{ratio}.asm"));
    assert!(asm.is_file(), "missing {}", asm.display());

    let content = std::fs::read_to_string(&asm).unwrap();
    assert!(content.starts_with("SECTION .text"));
    assert!(content.contains("; evals 50"));
    assert!(content.contains(&format!("; ratio {ratio}")));

    let csv = std::fs::read_to_string(results.join("curve25519_square.csv")).unwrap();
    assert_eq!(csv.lines().count(), 51); // header + 50 evaluations

    // The state file carries the fixed-width 16-hex seed identifier.
    let state = std::fs::read_dir(&results)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|n| n.starts_with("seed") && n.ends_with(".dat"))
        .expect("state file");
    let token = &state["seed".len()..state.len() - ".dat".len()];
    assert_eq!(token.len(), 16);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn same_seed_reproduces_the_final_ratio() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let out_a = run(&quick_args("out", &[]), dir_a.path());
    let out_b = run(&quick_args("out", &[]), dir_b.path());

    let ratio_a = extract_final_ratio(&String::from_utf8_lossy(&out_a.stdout));
    let ratio_b = extract_final_ratio(&String::from_utf8_lossy(&out_b.stdout));
    assert!(ratio_a.is_some());
    assert_eq!(ratio_a, ratio_b, "determinism check failed");
}

#[test]
fn sa_optimizer_runs_from_the_cli() {
    let dir = TempDir::new().unwrap();
    let out = run(
        &quick_args(
            "out",
            &[
                "--optimizer",
                "sa",
                "--saNumNeighbors",
                "3",
                "--saNeighborStrategy",
                "greedy",
                "--saMaxMutStepSize",
                "4",
            ],
        ),
        dir.path(),
    );
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    // 50 evals at 3 per epoch still logs one row per evaluation.
    let csv = std::fs::read_to_string(
        dir.path().join("out").join("curve25519_square.csv"),
    )
    .unwrap();
    assert_eq!(csv.lines().count(), 52); // header + 17 epochs x 3
}

#[test]
fn log_file_is_created_and_truncated() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("run.log");
    std::fs::write(&log, "stale contents\n").unwrap();
    let log_str = log.to_string_lossy().into_owned();
    let mut args = quick_args("out", &[]);
    args.push("--logFile");
    args.push(&log_str);
    let out = run(&args, dir.path());
    assert!(out.status.success());
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(!content.contains("stale contents"));
    assert!(content.contains("done: ratio"));
}
