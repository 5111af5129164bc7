use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use retro::config::RunConfig;
use retro::context::CancelToken;
use retro::engine::{self, RunReport};
use retro::reward::WeightPreset;
use retro::scenario::GeneratorConfig;
use retro::strategy::StrategyConfig;

/// Retrocession structure optimiser
#[derive(Parser, Debug)]
#[command(name = "retro")]
#[command(about = "Recommend a retrocession program for a catastrophe-exposed portfolio")]
#[command(version)]
struct Args {
    /// JSON run configuration (defaults to the built-in sample portfolio)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for simulation and search; drawn at random when neither this nor the config sets one
    #[arg(long)]
    seed: Option<u64>,

    /// Simulated loss years
    #[arg(long)]
    years: Option<u32>,

    /// Optimiser iteration budget
    #[arg(long)]
    iterations: Option<u32>,

    /// Maximum total premium, in millions
    #[arg(long)]
    budget: Option<f64>,

    /// Weight preset: balanced, budget-conscious, risk-averse, growth-focused
    #[arg(long)]
    preset: Option<WeightPreset>,

    /// Run every weight preset against the same loss years
    #[arg(long, conflicts_with = "preset")]
    all_presets: bool,

    /// Search strategy: random, cross-entropy, local-search, grid
    #[arg(long)]
    strategy: Option<StrategyConfig>,

    /// Use the clustered-season loss generator
    #[arg(long)]
    narrative: bool,

    /// Write the JSON report here
    #[arg(long)]
    output: Option<PathBuf>,

    /// Suppress the tables on stdout
    #[arg(long)]
    quiet: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig, retro::error::RetroError> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_path(path)?,
            None => RunConfig::canonical(),
        };
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(years) = self.years {
            config.years = years;
        }
        if let Some(iterations) = self.iterations {
            config.optimiser.iterations = iterations;
        }
        if let Some(budget) = self.budget {
            config.premium_budget = budget;
        }
        if let Some(preset) = self.preset {
            config.weights = preset.weights();
        }
        if let Some(strategy) = &self.strategy {
            config.optimiser.strategy = strategy.clone();
        }
        if self.narrative && config.generator == GeneratorConfig::Stochastic {
            config.generator = GeneratorConfig::default_narrative();
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match args.run_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reports: Vec<(Option<WeightPreset>, RunReport)> = if args.all_presets {
        match engine::run_presets(&config, CancelToken::new()) {
            Ok(r) => r.into_iter().map(|(p, r)| (Some(p), r)).collect(),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        match engine::run(&config, CancelToken::new()) {
            Ok(r) => vec![(args.preset, r)],
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    if !args.quiet {
        for (preset, report) in &reports {
            print_report(*preset, report);
        }
    }

    if let Some(path) = &args.output {
        let result = File::create(path).map_err(|e| e.to_string()).and_then(|f| {
            let writer = BufWriter::new(f);
            let written = match reports.as_slice() {
                [(_, only)] => serde_json::to_writer_pretty(writer, only),
                all => serde_json::to_writer_pretty(writer, all),
            };
            written.map_err(|e| e.to_string())
        });
        if let Err(e) = result {
            eprintln!("error: cannot write {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn print_report(preset: Option<WeightPreset>, report: &RunReport) {
    let label = preset.map(|p| format!(" [{p}]")).unwrap_or_default();
    println!(
        "\n=== Run{label}: seed {}, {} strategy, status {:?} after {} iterations ===",
        report.seed, report.strategy, report.status, report.iterations
    );
    println!(
        "  Weights: surplus {:.2}, tail {:.2}, cost {:.2}   Budget: {:.2}M   Pool: {} ({} rejected)",
        report.weights.surplus,
        report.weights.tail_risk,
        report.weights.cost,
        report.premium_budget,
        report.pool_size,
        report.rejected,
    );

    // ── Gross losses ──────────────────────────────────────────────────────────
    if let Some(losses) = &report.losses {
        let d = &losses.distribution;
        println!("\n--- Gross annual loss ($M, {} years) ---", d.n);
        println!(
            "{:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7}",
            "mean", "stddev", "p50", "p95", "p99", "max", "CVaR99", "Clust#"
        );
        println!(
            "{:>7.1} | {:>7.1} | {:>7.1} | {:>7.1} | {:>7.1} | {:>7.1} | {:>7.1} | {:>7}",
            d.mean, d.std_dev, d.p50, d.p95, d.p99, d.max, losses.cvar99, losses.clustered_years
        );
        let rps: Vec<String> =
            losses.return_periods.iter().map(|rp| format!("1-in-{} {:.1}", rp.period, rp.loss)).collect();
        println!("  Return periods: {}", rps.join(", "));
    }

    let b = &report.baseline;
    println!(
        "\n  Uncovered: expected loss {:.2}, expected surplus {:.2}, CVaR99 {:.2}",
        b.expected_loss, b.expected_surplus, b.cvar99
    );

    // ── Recommendation ────────────────────────────────────────────────────────
    let Some(rec) = &report.recommended else {
        println!("\n  No feasible program within budget.");
        return;
    };
    println!("\n--- Recommended program (candidate {}) ---", rec.candidate_id.0);
    println!(
        "{:>7} | {:>9} | {:>7} | {:>6} | {:>7} | {:>8}",
        "Type", "Retention", "Limit", "Rate%", "Premium", "ExpPay"
    );
    println!("{}", "-".repeat(7 + 3 + 9 + 3 + 7 + 3 + 6 + 3 + 7 + 3 + 8));
    for l in &rec.layers {
        println!(
            "{:>7} | {:>9.1} | {:>7.1} | {:>5.2}% | {:>7.2} | {:>8.2}",
            l.layer_type.to_string(),
            l.retention,
            l.limit,
            l.premium_rate * 100.0,
            l.premium,
            l.expected_payout,
        );
    }
    let m = &rec.metrics;
    let roi = m.roi.map(|r| format!("{r:.3}")).unwrap_or_else(|| "n/a".to_string());
    println!(
        "  Expected surplus {:.2}   CVaR99 {:.2}   Premium {:.2}   ROI {roi}",
        m.expected_surplus, m.cvar99, m.total_premium
    );

    // ── Frontier ──────────────────────────────────────────────────────────────
    println!("\n--- Risk/return frontier ({} points) ---", report.frontier.len());
    println!("{:>6} | {:>8} | {:>8} | {:>8} | {:>8}", "Id", "CVaR99", "ROI", "Premium", "Reward");
    for p in &report.frontier {
        let marker = if p.candidate_id == rec.candidate_id { " *" } else { "" };
        println!(
            "{:>6} | {:>8.2} | {:>8.3} | {:>8.2} | {:>8.4}{marker}",
            p.candidate_id.0, p.cvar99, p.roi, p.total_premium, p.reward,
        );
    }
}
