//! Portfolio in, recommendation out.
//!
//! A [`Session`] owns the per-portfolio state (exposure model, program space,
//! reward function). Loss years are simulated once per run and shared
//! read-only by every optimisation that scores against them.

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::analysis::{LossSummary, summarise_losses};
use crate::config::RunConfig;
use crate::context::{CancelToken, RunContext};
use crate::error::RetroResult;
use crate::frontier::{FrontierPoint, frontier, recommend, roi};
use crate::optimiser::{Candidate, OptimisationOutcome, Optimiser, OptimiserConfig, Termination};
use crate::portfolio::ExposurePortfolio;
use crate::program::{LayerType, ProgramSpace};
use crate::reward::{Baseline, RewardFunction, RewardWeights, WeightPreset, expected_layer_payouts};
use crate::scenario::{ExposureModel, LossYear, ScenarioGenerator, simulate_batch};
use crate::types::{CandidateId, Money};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub layer_type: LayerType,
    pub retention: Money,
    pub limit: Money,
    pub premium_rate: f64,
    pub premium: Money,
    pub expected_payout: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub expected_surplus: Money,
    pub cvar99: Money,
    pub total_premium: Money,
    pub roi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub candidate_id: CandidateId,
    pub layers: Vec<LayerReport>,
    pub metrics: MetricsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub strategy: &'static str,
    pub weights: RewardWeights,
    pub premium_budget: Money,
    pub status: Termination,
    pub iterations: u32,
    pub pool_size: usize,
    pub rejected: usize,
    pub recommended: Option<Recommendation>,
    pub frontier: Vec<FrontierPoint>,
    /// The uncovered position.
    pub baseline: Baseline,
    pub losses: Option<LossSummary>,
}

pub struct Session {
    portfolio: ExposurePortfolio,
    model: ExposureModel,
    generator: Box<dyn ScenarioGenerator>,
    space: ProgramSpace,
    reward: RewardFunction,
}

impl Session {
    pub fn new(config: &RunConfig) -> RetroResult<Self> {
        config.validate()?;
        let portfolio = ExposurePortfolio::from_records(&config.portfolio)?;
        let model = ExposureModel::from_portfolio(&portfolio, &config.frequencies)?;
        let generator = config.generator.build()?;
        let space = ProgramSpace::new(config.bounds.clone())?;
        let tiv = portfolio.total_insured_value();
        let reward = RewardFunction::new(config.capital.unwrap_or(tiv), tiv)?;
        Ok(Session { portfolio, model, generator, space, reward })
    }

    pub fn portfolio(&self) -> &ExposurePortfolio {
        &self.portfolio
    }

    pub fn simulate(&self, years: u32, seed: u64, cancel: &CancelToken) -> RetroResult<Vec<LossYear>> {
        simulate_batch(self.generator.as_ref(), &self.model, years, seed, cancel)
    }

    pub fn optimise(
        &self,
        years: &[LossYear],
        weights: RewardWeights,
        budget: Money,
        config: &OptimiserConfig,
        ctx: &mut RunContext,
    ) -> RetroResult<OptimisationOutcome> {
        let mut optimiser = Optimiser::new(years, &self.space, &self.reward, weights, budget, config.clone())?;
        Ok(optimiser.run(ctx))
    }

    /// Frontier, recommendation and metrics for a finished optimisation.
    pub fn report(
        &self,
        seed: u64,
        years: &[LossYear],
        weights: RewardWeights,
        budget: Money,
        outcome: &OptimisationOutcome,
    ) -> RunReport {
        let baseline = self.reward.baseline(years);
        let frontier = frontier(&outcome.pool, baseline.expected_surplus);
        let recommended = recommend(&frontier)
            .and_then(|p| outcome.pool.iter().find(|c| c.id == p.candidate_id))
            .map(|c| recommendation(c, years, baseline.expected_surplus));

        RunReport {
            seed,
            strategy: outcome.strategy,
            weights,
            premium_budget: budget,
            status: outcome.status,
            iterations: outcome.iterations,
            pool_size: outcome.pool.len(),
            rejected: outcome.rejected,
            recommended,
            frontier,
            baseline,
            losses: summarise_losses(years),
        }
    }

    fn context(&self, seed: u64, config: &OptimiserConfig, cancel: &CancelToken) -> RunContext {
        let ctx = RunContext::new(seed).with_cancel(cancel.clone());
        match config.time_budget() {
            Some(budget) => ctx.with_time_budget(budget),
            None => ctx,
        }
    }
}

fn recommendation(c: &Candidate, years: &[LossYear], baseline_surplus: Money) -> Recommendation {
    let payouts = expected_layer_payouts(&c.program, years);
    let layers = c
        .program
        .layers
        .iter()
        .zip(payouts)
        .map(|(l, expected_payout)| LayerReport {
            layer_type: l.layer_type,
            retention: l.retention,
            limit: l.limit,
            premium_rate: l.premium_rate,
            premium: l.premium(),
            expected_payout,
        })
        .collect();
    Recommendation {
        candidate_id: c.id,
        layers,
        metrics: MetricsSummary {
            expected_surplus: c.expected_surplus,
            cvar99: c.cvar99,
            total_premium: c.total_premium,
            roi: roi(c, baseline_surplus),
        },
    }
}

/// One full run: validate, simulate, optimise, report.
pub fn run(config: &RunConfig, cancel: CancelToken) -> RetroResult<RunReport> {
    let session = Session::new(config)?;
    let seed = config.run_seed();
    let weights = config.weights.normalize()?;
    let years = session.simulate(config.years, seed, &cancel)?;

    let mut ctx = session.context(seed, &config.optimiser, &cancel);
    let outcome = session.optimise(&years, weights, config.premium_budget, &config.optimiser, &mut ctx)?;
    let report = session.report(seed, &years, weights, config.premium_budget, &outcome);
    info!(
        seed,
        status = ?report.status,
        frontier = report.frontier.len(),
        recommended = report.recommended.is_some(),
        "run complete"
    );
    Ok(report)
}

/// Every weight preset against one shared loss-year batch. Each preset gets
/// its own context on the run seed, so results do not depend on scheduling.
pub fn run_presets(config: &RunConfig, cancel: CancelToken) -> RetroResult<Vec<(WeightPreset, RunReport)>> {
    let session = Session::new(config)?;
    let seed = config.run_seed();
    let years = session.simulate(config.years, seed, &cancel)?;

    WeightPreset::ALL
        .par_iter()
        .map(|&preset| {
            let weights = preset.weights().normalize()?;
            let mut ctx = session.context(seed, &config.optimiser, &cancel);
            let outcome = session.optimise(&years, weights, config.premium_budget, &config.optimiser, &mut ctx)?;
            let report = session.report(seed, &years, weights, config.premium_budget, &outcome);
            Ok((preset, report))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RetroError, Stage};
    use crate::portfolio::{LineOfBusiness, SegmentRecord};

    fn small_config() -> RunConfig {
        let mut c = RunConfig::canonical();
        c.years = 300;
        c.optimiser.iterations = 15;
        c.optimiser.batch_size = 8;
        c
    }

    #[test]
    fn canonical_run_recommends_within_budget() {
        let report = run(&small_config(), CancelToken::new()).unwrap();
        assert_eq!(report.seed, 42);
        let rec = report.recommended.unwrap();
        assert!(rec.metrics.total_premium <= 20.0);
        assert!(!rec.layers.is_empty());
        let premium: f64 = rec.layers.iter().map(|l| l.premium).sum();
        assert!((premium - rec.metrics.total_premium).abs() < 1e-9);
        assert!(report.frontier.iter().any(|p| p.candidate_id == rec.candidate_id));
    }

    #[test]
    fn layer_payouts_never_exceed_limits() {
        let report = run(&small_config(), CancelToken::new()).unwrap();
        for l in report.recommended.unwrap().layers {
            assert!(l.expected_payout >= 0.0);
            assert!(l.expected_payout <= l.limit + 1e-9);
        }
    }

    #[test]
    fn presets_share_one_loss_batch() {
        let results = run_presets(&small_config(), CancelToken::new()).unwrap();
        assert_eq!(results.len(), 4);
        let baseline = results[0].1.baseline;
        assert!(results.iter().all(|(_, r)| r.baseline == baseline));
        assert_eq!(results[2].0, WeightPreset::RiskAverse);
        assert_eq!(results[2].1.weights, WeightPreset::RiskAverse.weights().normalize().unwrap());
    }

    #[test]
    fn invalid_record_fails_before_simulation() {
        let mut c = small_config();
        c.portfolio.push(SegmentRecord {
            region: "Texas".into(),
            total_insured_value: None,
            expected_loss: Some(5.0),
            line_of_business: LineOfBusiness::PropertyCat,
        });
        let err = run(&c, CancelToken::new()).unwrap_err();
        assert!(matches!(err, RetroError::Configuration { stage: Stage::Input, .. }));
    }

    #[test]
    fn cancelled_simulation_is_an_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run(&small_config(), cancel).unwrap_err();
        assert!(matches!(err, RetroError::Cancelled { stage: Stage::Simulation }));
    }
}
