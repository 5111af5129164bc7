use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::{CancelToken, RunContext};
use crate::error::{RetroError, RetroResult, Stage};
use crate::program::{ProgramSpace, RetroProgram};
use crate::reward::{RewardFunction, RewardWeights, Score};
use crate::scenario::LossYear;
use crate::strategy::{SearchStrategy, StrategyConfig};
use crate::types::{CandidateId, Money};

/// One evaluated program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: CandidateId,
    /// Iteration that proposed it (0-based).
    pub iteration: u32,
    pub program: RetroProgram,
    pub expected_surplus: Money,
    pub cvar99: Money,
    pub total_premium: Money,
    pub expected_recovery: Money,
    pub reward: f64,
}

impl Candidate {
    fn from_score(id: CandidateId, iteration: u32, program: RetroProgram, score: Score) -> Self {
        Candidate {
            id,
            iteration,
            program,
            expected_surplus: score.expected_surplus,
            cvar99: score.cvar99,
            total_premium: score.total_premium,
            expected_recovery: score.expected_recovery,
            reward: score.reward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AgentState {
    Init,
    Sampling,
    Scoring,
    Converged,
    BudgetExhausted,
    Infeasible,
    Cancelled,
}

/// How a run ended. `Infeasible` is a business outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Termination {
    Converged,
    BudgetExhausted,
    Infeasible,
    Cancelled,
}

impl From<Termination> for AgentState {
    fn from(t: Termination) -> Self {
        match t {
            Termination::Converged => AgentState::Converged,
            Termination::BudgetExhausted => AgentState::BudgetExhausted,
            Termination::Infeasible => AgentState::Infeasible,
            Termination::Cancelled => AgentState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiserConfig {
    pub strategy: StrategyConfig,
    /// Iteration budget.
    pub iterations: u32,
    /// Programs proposed and scored per iteration.
    pub batch_size: usize,
    /// Draws per proposal slot before the slot is given up as infeasible.
    pub max_attempts: usize,
    /// Converged once the best reward gained less than `convergence_threshold`
    /// over this many iterations.
    pub convergence_window: usize,
    pub convergence_threshold: f64,
    pub time_budget_secs: Option<f64>,
}

impl Default for OptimiserConfig {
    fn default() -> Self {
        OptimiserConfig {
            strategy: StrategyConfig::default(),
            iterations: 200,
            batch_size: 16,
            max_attempts: 64,
            convergence_window: 25,
            convergence_threshold: 1e-6,
            time_budget_secs: None,
        }
    }
}

impl OptimiserConfig {
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.filter(|s| s.is_finite() && *s >= 0.0).map(Duration::from_secs_f64)
    }
}

/// Everything an optimisation run produced, including a partial pool when it
/// was cancelled.
#[derive(Debug, Clone, Serialize)]
pub struct OptimisationOutcome {
    pub status: Termination,
    pub strategy: &'static str,
    /// All evaluated candidates, best reward first (ties: lower id first).
    pub pool: Vec<Candidate>,
    pub iterations: u32,
    /// Proposals dropped for breaking the premium budget or being malformed.
    pub rejected: usize,
    /// Best reward in the pool after each iteration.
    pub best_rewards: Vec<f64>,
}

impl OptimisationOutcome {
    pub fn best(&self) -> Option<&Candidate> {
        self.pool.first()
    }
}

/// Budget-constrained search over retrocession programs.
///
/// Iterations run one after another; the proposals inside an iteration are
/// scored in parallel against the same read-only loss years.
pub struct Optimiser<'a> {
    years: &'a [LossYear],
    space: &'a ProgramSpace,
    reward: &'a RewardFunction,
    weights: RewardWeights,
    budget: Money,
    config: OptimiserConfig,
    strategy: SearchStrategy,
    state: AgentState,
    pool: Vec<Candidate>,
    next_id: u64,
    rejected: usize,
    iteration: u32,
    best_rewards: Vec<f64>,
}

impl<'a> Optimiser<'a> {
    pub fn new(
        years: &'a [LossYear],
        space: &'a ProgramSpace,
        reward: &'a RewardFunction,
        weights: RewardWeights,
        budget: Money,
        config: OptimiserConfig,
    ) -> RetroResult<Self> {
        if !budget.is_finite() || budget < 0.0 {
            return Err(RetroError::config(
                Stage::Search,
                format!("premium budget must be a non-negative amount, got {budget}"),
            ));
        }
        let weights = weights.normalize()?;
        if years.is_empty() {
            return Err(RetroError::config(Stage::Search, "no loss years to score against"));
        }
        if config.batch_size == 0 || config.max_attempts == 0 {
            return Err(RetroError::config(Stage::Search, "batch size and max attempts must be positive"));
        }
        let strategy = config.strategy.build(space)?;
        Ok(Optimiser {
            years,
            space,
            reward,
            weights,
            budget,
            config,
            strategy,
            state: AgentState::Init,
            pool: Vec::new(),
            next_id: 0,
            rejected: 0,
            iteration: 0,
            best_rewards: Vec::new(),
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Run until a termination condition holds.
    pub fn run(&mut self, ctx: &mut RunContext) -> OptimisationOutcome {
        info!(
            strategy = self.strategy.name(),
            budget = self.budget,
            iterations = self.config.iterations,
            batch = self.config.batch_size,
            seed = ctx.seed,
            "optimisation started"
        );
        let status = loop {
            if let Some(status) = self.step(ctx) {
                break status;
            }
        };

        self.state = status.into();
        let mut pool = std::mem::take(&mut self.pool);
        pool.sort_by(|a, b| b.reward.total_cmp(&a.reward).then(a.id.cmp(&b.id)));
        info!(
            status = ?status,
            iterations = self.iteration,
            pool = pool.len(),
            rejected = self.rejected,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "optimisation finished"
        );
        OptimisationOutcome {
            status,
            strategy: self.strategy.name(),
            pool,
            iterations: self.iteration,
            rejected: self.rejected,
            best_rewards: std::mem::take(&mut self.best_rewards),
        }
    }

    /// One sample-and-score iteration. Returns the termination reason once the
    /// run should stop; the pool keeps everything scored so far.
    pub fn step(&mut self, ctx: &mut RunContext) -> Option<Termination> {
        if ctx.cancel.is_cancelled() {
            return Some(Termination::Cancelled);
        }
        if self.iteration >= self.config.iterations || ctx.out_of_time() {
            return Some(Termination::BudgetExhausted);
        }

        self.state = AgentState::Sampling;
        let (proposals, exhausted) = self.sample_batch(ctx);
        if proposals.is_empty() {
            if self.pool.is_empty() {
                return Some(Termination::Infeasible);
            }
            if exhausted {
                return Some(Termination::BudgetExhausted);
            }
        }

        self.state = AgentState::Scoring;
        let complete = self.score_batch(self.iteration, proposals, &ctx.cancel);
        self.iteration += 1;
        let best = self.best_reward();
        self.best_rewards.push(best);
        debug!(iteration = self.iteration, pool = self.pool.len(), best, "iteration scored");

        if !complete {
            return Some(Termination::Cancelled);
        }
        if self.converged() {
            return Some(Termination::Converged);
        }
        if exhausted {
            return Some(Termination::BudgetExhausted);
        }
        None
    }

    /// Fill one iteration's batch with feasible proposals. The flag reports
    /// that the strategy ran out of proposals.
    ///
    /// Sampling strategies give up on a slot after `max_attempts` rejected
    /// draws. The grid is finite, so it skips rejected points until a slot is
    /// filled or the enumeration ends.
    fn sample_batch(&mut self, ctx: &mut RunContext) -> (Vec<RetroProgram>, bool) {
        let attempts = match self.strategy {
            SearchStrategy::Grid(_) => usize::MAX,
            _ => self.config.max_attempts,
        };
        let mut out = Vec::with_capacity(self.config.batch_size);
        'slots: for _ in 0..self.config.batch_size {
            for _ in 0..attempts {
                match self.strategy.propose(&self.pool, self.space, &mut ctx.rng) {
                    None => return (out, true),
                    Some(p) if self.space.validate(&p, self.budget) => {
                        out.push(p);
                        continue 'slots;
                    }
                    Some(_) => self.rejected += 1,
                }
            }
        }
        (out, false)
    }

    /// Score proposals in parallel and append them to the pool in proposal
    /// order. Returns `false` when cancellation cut the batch short; whatever
    /// was scored is kept.
    fn score_batch(&mut self, iteration: u32, programs: Vec<RetroProgram>, cancel: &CancelToken) -> bool {
        let (years, reward, weights) = (self.years, self.reward, self.weights);
        let scores: Vec<Option<Score>> = programs
            .par_iter()
            .map(|p| (!cancel.is_cancelled()).then(|| reward.score(p, years, &weights)))
            .collect();

        let mut complete = true;
        for (program, score) in programs.into_iter().zip(scores) {
            match score {
                Some(score) => {
                    let id = CandidateId(self.next_id);
                    self.next_id += 1;
                    self.pool.push(Candidate::from_score(id, iteration, program, score));
                }
                None => complete = false,
            }
        }
        complete
    }

    fn best_reward(&self) -> f64 {
        self.pool.iter().map(|c| c.reward).fold(f64::NEG_INFINITY, f64::max)
    }

    fn converged(&self) -> bool {
        let best_rewards = &self.best_rewards;
        let k = self.config.convergence_window;
        if k == 0 || best_rewards.len() <= k {
            return false;
        }
        let now = best_rewards[best_rewards.len() - 1];
        let then = best_rewards[best_rewards.len() - 1 - k];
        now.is_finite() && then.is_finite() && now - then < self.config.convergence_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::{ExposurePortfolio, LineOfBusiness, SegmentRecord};
    use crate::frontier::frontier;
    use crate::program::{LayerType, ProgramBounds};
    use crate::scenario::{ExposureModel, StochasticGenerator, default_line_frequencies, simulate_batch};

    struct Fixture {
        years: Vec<LossYear>,
        space: ProgramSpace,
        reward: RewardFunction,
    }

    fn fixture() -> Fixture {
        let p = ExposurePortfolio::from_records(&[SegmentRecord::new(
            "Florida",
            300.0,
            45.0,
            LineOfBusiness::PropertyCat,
        )])
        .unwrap();
        let model = ExposureModel::from_portfolio(&p, &default_line_frequencies()).unwrap();
        let years = simulate_batch(&StochasticGenerator, &model, 500, 42, &CancelToken::new()).unwrap();
        Fixture {
            years,
            space: ProgramSpace::new(ProgramBounds::default()).unwrap(),
            reward: RewardFunction::new(300.0, 300.0).unwrap(),
        }
    }

    fn config(strategy: StrategyConfig, iterations: u32) -> OptimiserConfig {
        OptimiserConfig { strategy, iterations, batch_size: 8, ..OptimiserConfig::default() }
    }

    fn run(f: &Fixture, budget: Money, cfg: OptimiserConfig, seed: u64) -> OptimisationOutcome {
        let mut opt = Optimiser::new(&f.years, &f.space, &f.reward, RewardWeights::DEFAULT, budget, cfg).unwrap();
        assert_eq!(opt.state(), AgentState::Init);
        let mut ctx = RunContext::new(seed);
        let outcome = opt.run(&mut ctx);
        assert_eq!(opt.state(), AgentState::from(outcome.status));
        outcome
    }

    #[test]
    fn pool_is_sorted_and_within_budget() {
        let f = fixture();
        let outcome = run(&f, 20.0, config(StrategyConfig::Random, 20), 1);
        assert!(!outcome.pool.is_empty());
        assert!(outcome.pool.windows(2).all(|w| w[0].reward >= w[1].reward));
        assert!(outcome.pool.iter().all(|c| c.total_premium <= 20.0));
        assert_eq!(outcome.best().unwrap().reward, outcome.pool[0].reward);
    }

    #[test]
    fn zero_budget_is_infeasible_without_error() {
        let f = fixture();
        let outcome = run(&f, 0.0, config(StrategyConfig::default(), 200), 42);
        assert_eq!(outcome.status, Termination::Infeasible);
        assert!(outcome.pool.is_empty());
        assert!(outcome.rejected > 0);
    }

    #[test]
    fn iteration_budget_bounds_the_run() {
        let f = fixture();
        let cfg = OptimiserConfig { convergence_window: 0, ..config(StrategyConfig::Random, 5) };
        let outcome = run(&f, 20.0, cfg, 3);
        assert_eq!(outcome.status, Termination::BudgetExhausted);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.pool.len(), 40);
        assert_eq!(outcome.best_rewards.len(), 5);
    }

    #[test]
    fn best_reward_never_decreases() {
        let f = fixture();
        let outcome = run(&f, 20.0, config(StrategyConfig::default(), 30), 9);
        assert!(outcome.best_rewards.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn flat_rewards_converge() {
        let f = fixture();
        // A generous threshold makes any window count as flat.
        let cfg = OptimiserConfig {
            convergence_window: 3,
            convergence_threshold: 1.0,
            ..config(StrategyConfig::Random, 100)
        };
        let outcome = run(&f, 20.0, cfg, 4);
        assert_eq!(outcome.status, Termination::Converged);
        assert_eq!(outcome.iterations, 4);
    }

    #[test]
    fn same_seed_same_pool() {
        let f = fixture();
        let a = run(&f, 15.0, config(StrategyConfig::default(), 10), 77);
        let b = run(&f, 15.0, config(StrategyConfig::default(), 10), 77);
        assert_eq!(a.pool, b.pool);
    }

    #[test]
    fn exhausted_grid_ends_the_run() {
        let f = fixture();
        let cfg = OptimiserConfig { convergence_window: 0, ..config(StrategyConfig::Grid { steps: 1 }, 100) };
        let outcome = run(&f, 100.0, cfg, 1);
        assert_eq!(outcome.status, Termination::BudgetExhausted);
        assert_eq!(outcome.pool.len(), 7);
    }

    #[test]
    fn cancelled_run_returns_partial_pool() {
        let f = fixture();
        let mut opt = Optimiser::new(
            &f.years,
            &f.space,
            &f.reward,
            RewardWeights::DEFAULT,
            20.0,
            config(StrategyConfig::Random, 50),
        )
        .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ctx = RunContext::new(1).with_cancel(cancel);
        let outcome = opt.run(&mut ctx);
        assert_eq!(outcome.status, Termination::Cancelled);
        assert_eq!(opt.state(), AgentState::Cancelled);
        assert!(outcome.pool.is_empty());
    }

    #[test]
    fn cancelling_between_iterations_keeps_scored_candidates() {
        let f = fixture();
        let mut opt = Optimiser::new(
            &f.years,
            &f.space,
            &f.reward,
            RewardWeights::DEFAULT,
            20.0,
            config(StrategyConfig::Random, 50),
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut ctx = RunContext::new(5).with_cancel(cancel.clone());
        assert_eq!(opt.step(&mut ctx), None);
        assert_eq!(opt.step(&mut ctx), None);
        cancel.cancel();

        let outcome = opt.run(&mut ctx);
        assert_eq!(outcome.status, Termination::Cancelled);
        assert_eq!(opt.state(), AgentState::Cancelled);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.pool.len(), 16);
        assert!(outcome.pool.windows(2).all(|w| w[0].reward >= w[1].reward));

        let baseline = f.reward.baseline(&f.years).expected_surplus;
        let points = frontier(&outcome.pool, baseline);
        assert!(!points.is_empty());
        for a in &points {
            for b in &points {
                let dominates = a.cvar99 <= b.cvar99 && a.roi >= b.roi && (a.cvar99 < b.cvar99 || a.roi > b.roi);
                assert!(!dominates, "{a:?} dominates {b:?}");
            }
        }
    }

    #[test]
    fn grid_skips_unaffordable_points_until_cheap_layers_appear() {
        let f = fixture();
        // Only sidecar layers fit the budget, and the odometer reaches them
        // after every XoL/ILW combination of the first sidecar option.
        let mut bounds = ProgramBounds::default();
        for b in &mut bounds.layers {
            b.premium_rate = match b.layer_type {
                LayerType::Sidecar => (0.01, 0.01),
                _ => (0.5, 0.5),
            };
        }
        let space = ProgramSpace::new(bounds).unwrap();
        let total = space.enumerate(8).total();
        let cfg = OptimiserConfig { convergence_window: 0, ..config(StrategyConfig::Grid { steps: 8 }, 50) };
        let mut opt = Optimiser::new(&f.years, &space, &f.reward, RewardWeights::DEFAULT, 1.0, cfg).unwrap();
        let outcome = opt.run(&mut RunContext::new(1));

        assert_eq!(outcome.status, Termination::BudgetExhausted);
        assert_eq!(outcome.pool.len(), 64);
        assert_eq!(outcome.rejected, total - 64);
        assert!(outcome.pool.iter().all(|c| c.total_premium <= 1.0));
        assert!(
            outcome
                .pool
                .iter()
                .all(|c| c.program.layers.iter().all(|l| l.layer_type == LayerType::Sidecar))
        );
    }

    #[test]
    fn exhausted_time_budget_stops_before_sampling() {
        let f = fixture();
        let mut opt = Optimiser::new(
            &f.years,
            &f.space,
            &f.reward,
            RewardWeights::DEFAULT,
            20.0,
            config(StrategyConfig::Random, 50),
        )
        .unwrap();
        let mut ctx = RunContext::new(1).with_time_budget(Duration::ZERO);
        let outcome = opt.run(&mut ctx);
        assert_eq!(outcome.status, Termination::BudgetExhausted);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn negative_budget_is_a_configuration_error() {
        let f = fixture();
        let err = Optimiser::new(
            &f.years,
            &f.space,
            &f.reward,
            RewardWeights::DEFAULT,
            -1.0,
            OptimiserConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RetroError::Configuration { stage: Stage::Search, .. }));
    }

    #[test]
    fn cross_entropy_beats_its_first_iteration() {
        let f = fixture();
        let cfg = OptimiserConfig { convergence_window: 0, ..config(StrategyConfig::default(), 40) };
        let outcome = run(&f, 20.0, cfg, 11);
        let first = outcome.best_rewards[0];
        let last = *outcome.best_rewards.last().unwrap();
        assert!(last >= first);
    }
}
