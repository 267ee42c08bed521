use clap::Parser;
use cycleforge_core::config::RunOptions;
use cycleforge_core::error::EXIT_PARAMETER_PARSE_FAIL;
use cycleforge_core::measure::CostModelMeasurer;
use cycleforge_core::rng::Rng;
use cycleforge_core::session::Session;
use std::fs::File;
use std::process;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cycleforge",
    version,
    about = "Measurement-driven scheduling search over straight-line field arithmetic"
)]
struct Cli {
    #[command(flatten)]
    opts: RunOptions,
}

fn init_tracing(opts: &RunOptions) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if opts.verbose { "debug" } else { "info" })
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &opts.log_file {
        Some(path) => {
            // Truncated on every start; lines carry the subscriber's UTC
            // timestamps.
            let file = File::create(path).unwrap_or_else(|e| {
                eprintln!("cannot open log file {}: {e}", path.display());
                process::exit(EXIT_PARAMETER_PARSE_FAIL);
            });
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
}

fn main() {
    let mut cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not failures.
            let _ = e.print();
            let code = if e.use_stderr() {
                EXIT_PARAMETER_PARSE_FAIL
            } else {
                0
            };
            process::exit(code);
        }
    };
    init_tracing(&cli.opts);

    // Pin the wall-clock fallback seed so every component sees one value.
    cli.opts.seed = Some(cli.opts.effective_seed());

    if let Err(e) = cli.opts.validate() {
        error!("{e}");
        process::exit(EXIT_PARAMETER_PARSE_FAIL);
    }
    if let Some(comment) = &cli.opts.log_comment {
        info!("comment: {comment}");
    }

    let master = Rng::with_seed(cli.opts.effective_seed());
    let mut measurer = CostModelMeasurer::new(master.derive(u64::MAX));

    let mut session = match Session::new(cli.opts) {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            process::exit(e.exit_code());
        }
    };

    match session.run(&mut measurer) {
        Ok(summary) => {
            info!(
                "done: ratio {:.4}, {:.1} cycles, {} evals in {:.1}s",
                summary.ratio, summary.cycles, summary.evals, summary.optimize_seconds
            );
            if let Some(v) = summary.validate_seconds {
                info!("proof accepted in {v:.1}s");
            }
        }
        Err(e) => {
            error!("{e}");
            process::exit(e.exit_code());
        }
    }
}
