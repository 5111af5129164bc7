use std::env;
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;

use retro::analysis::summarise_losses;
use retro::config::RunConfig;
use retro::context::CancelToken;
use retro::engine::Session;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = match env::args().nth(2) {
        Some(path) => match RunConfig::from_json_path(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("loss_catalog: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => RunConfig::canonical(),
    };
    let n_years: u32 = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(config.years);
    let seed = config.run_seed();
    eprintln!("loss_catalog: simulating {n_years} years with seed {seed}");

    let years = match Session::new(&config).and_then(|s| s.simulate(n_years, seed, &CancelToken::new())) {
        Ok(y) => y,
        Err(e) => {
            eprintln!("loss_catalog: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Write NDJSON to stdout.
    let mut out = BufWriter::new(io::stdout().lock());
    for y in &years {
        let written = serde_json::to_writer(&mut out, y)
            .map_err(io::Error::from)
            .and_then(|_| writeln!(out));
        if let Err(e) = written {
            eprintln!("loss_catalog: {e}");
            return ExitCode::FAILURE;
        }
    }
    if out.flush().is_err() {
        return ExitCode::FAILURE;
    }

    // Distribution summary to stderr.
    let Some(summary) = summarise_losses(&years) else {
        eprintln!("loss_catalog: no years simulated");
        return ExitCode::SUCCESS;
    };
    let d = &summary.distribution;
    eprintln!(
        "loss_catalog: {} years, seed {seed}, {:.2} events/year, {} clustered",
        d.n, summary.mean_event_count, summary.clustered_years
    );
    eprintln!(
        "  mean={:.2}  stddev={:.2}  p50={:.2}  p95={:.2}  p99={:.2}  max={:.2}  cvar99={:.2}",
        d.mean, d.std_dev, d.p50, d.p95, d.p99, d.max, summary.cvar99
    );
    for rp in &summary.return_periods {
        eprintln!("  1-in-{:<4} loss={:.2}", rp.period, rp.loss);
    }
    ExitCode::SUCCESS
}
