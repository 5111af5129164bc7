//! Search strategies behind a single `propose(history)` call.
//!
//! Each strategy sees the pool of candidates evaluated so far and returns the
//! next program to try. Rewards are the only feedback; nothing here knows how
//! a program is scored.

use std::cmp::Ordering;
use std::str::FromStr;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{RetroError, RetroResult, Stage};
use crate::optimiser::Candidate;
use crate::program::{LayerBounds, ProgramGrid, ProgramSpace, RetroLayer, RetroProgram};

/// Inclusion probabilities stay inside this band so no layer type is frozen in or out.
const INCLUSION_FLOOR: f64 = 0.05;
const INCLUSION_CEILING: f64 = 0.95;

/// Chance per layer type that local search toggles the type in or out.
const TOGGLE_PROBABILITY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Random,
    CrossEntropy {
        /// Share of the history refitted to, by reward.
        elite_fraction: f64,
        /// Weight of the elite statistics in each refit (1 = replace).
        smoothing: f64,
        /// Standard deviation floor as a share of each range.
        min_std_fraction: f64,
    },
    LocalSearch {
        /// Perturbation standard deviation as a share of each range.
        step_fraction: f64,
        restart_probability: f64,
    },
    Grid {
        steps: usize,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::CrossEntropy { elite_fraction: 0.1, smoothing: 0.7, min_std_fraction: 0.02 }
    }
}

impl FromStr for StrategyConfig {
    type Err = String;

    /// Strategy by name, with default tuning.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "random" => Ok(StrategyConfig::Random),
            "cross-entropy" | "cem" => Ok(StrategyConfig::default()),
            "local-search" | "local" => {
                Ok(StrategyConfig::LocalSearch { step_fraction: 0.1, restart_probability: 0.05 })
            }
            "grid" => Ok(StrategyConfig::Grid { steps: 4 }),
            other => Err(format!("unknown search strategy '{other}'")),
        }
    }
}

impl StrategyConfig {
    pub fn build(&self, space: &ProgramSpace) -> RetroResult<SearchStrategy> {
        let unit = |name: &str, v: f64, allow_zero: bool| {
            let lower_ok = if allow_zero { v >= 0.0 } else { v > 0.0 };
            if v.is_finite() && v <= 1.0 && lower_ok {
                Ok(())
            } else {
                Err(RetroError::config(Stage::Search, format!("{name} {v} outside its range")))
            }
        };
        Ok(match *self {
            StrategyConfig::Random => SearchStrategy::Random,
            StrategyConfig::CrossEntropy { elite_fraction, smoothing, min_std_fraction } => {
                unit("elite_fraction", elite_fraction, false)?;
                unit("smoothing", smoothing, false)?;
                unit("min_std_fraction", min_std_fraction, true)?;
                SearchStrategy::CrossEntropy(CrossEntropy::new(space, elite_fraction, smoothing, min_std_fraction))
            }
            StrategyConfig::LocalSearch { step_fraction, restart_probability } => {
                unit("step_fraction", step_fraction, false)?;
                unit("restart_probability", restart_probability, true)?;
                SearchStrategy::LocalSearch(LocalSearch { step_fraction, restart_probability })
            }
            StrategyConfig::Grid { steps } => {
                if steps == 0 {
                    return Err(RetroError::config(Stage::Search, "grid needs at least one step"));
                }
                SearchStrategy::Grid(space.enumerate(steps))
            }
        })
    }
}

pub enum SearchStrategy {
    Random,
    CrossEntropy(CrossEntropy),
    LocalSearch(LocalSearch),
    Grid(ProgramGrid),
}

impl SearchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SearchStrategy::Random => "random",
            SearchStrategy::CrossEntropy(_) => "cross-entropy",
            SearchStrategy::LocalSearch(_) => "local-search",
            SearchStrategy::Grid(_) => "grid",
        }
    }

    /// Next program to evaluate, or `None` once the strategy has nothing left
    /// to offer (only an exhausted grid).
    pub fn propose(
        &mut self,
        history: &[Candidate],
        space: &ProgramSpace,
        rng: &mut ChaCha20Rng,
    ) -> Option<RetroProgram> {
        match self {
            SearchStrategy::Random => Some(space.sample(rng)),
            SearchStrategy::CrossEntropy(ce) => Some(ce.propose(history, space, rng)),
            SearchStrategy::LocalSearch(ls) => Some(ls.propose(history, space, rng)),
            SearchStrategy::Grid(grid) => grid.next(),
        }
    }
}

/// Highest reward first; equal rewards by lower id.
fn by_reward(a: &Candidate, b: &Candidate) -> Ordering {
    b.reward.total_cmp(&a.reward).then(a.id.cmp(&b.id))
}

fn best(history: &[Candidate]) -> Option<&Candidate> {
    history.iter().min_by(|a, b| by_reward(a, b))
}

fn gaussian(mean: f64, std: f64, rng: &mut impl Rng) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + std * z
}

fn span((lo, hi): (f64, f64)) -> f64 {
    hi - lo
}

/// Sampling distribution for one layer type.
#[derive(Debug, Clone)]
struct TypeDistribution {
    bounds: LayerBounds,
    inclusion: f64,
    retention: (f64, f64),
    limit: (f64, f64),
}

impl TypeDistribution {
    fn sample(&self, rng: &mut impl Rng) -> RetroLayer {
        let r = gaussian(self.retention.0, self.retention.1, rng);
        let l = gaussian(self.limit.0, self.limit.1, rng);
        self.bounds.layer(r, l)
    }
}

/// Cross-entropy method: a per-type Gaussian over (retention, limit) plus an
/// inclusion probability, refitted to the elite candidates whenever the
/// history grows.
pub struct CrossEntropy {
    elite_fraction: f64,
    smoothing: f64,
    min_std_fraction: f64,
    dists: Vec<TypeDistribution>,
    fitted_len: usize,
}

impl CrossEntropy {
    fn new(space: &ProgramSpace, elite_fraction: f64, smoothing: f64, min_std_fraction: f64) -> Self {
        let inclusion = space.bounds().inclusion_probability.clamp(INCLUSION_FLOOR, INCLUSION_CEILING);
        let dists = space
            .enabled()
            .map(|b| TypeDistribution {
                bounds: *b,
                inclusion,
                retention: ((b.retention.0 + b.retention.1) / 2.0, span(b.retention) / 4.0),
                limit: ((b.limit.0 + b.limit.1) / 2.0, span(b.limit) / 4.0),
            })
            .collect();
        CrossEntropy { elite_fraction, smoothing, min_std_fraction, dists, fitted_len: 0 }
    }

    fn refit(&mut self, history: &[Candidate]) {
        let mut ranked: Vec<&Candidate> = history.iter().collect();
        ranked.sort_by(|a, b| by_reward(a, b));
        let n_elite = ((history.len() as f64 * self.elite_fraction).ceil() as usize).clamp(1, history.len());
        let elites = &ranked[..n_elite];

        let a = self.smoothing;
        let min_std_fraction = self.min_std_fraction;
        for d in &mut self.dists {
            let layers: Vec<&RetroLayer> =
                elites.iter().filter_map(|c| c.program.layer(d.bounds.layer_type)).collect();
            let share = layers.len() as f64 / n_elite as f64;
            d.inclusion = (a * share + (1.0 - a) * d.inclusion).clamp(INCLUSION_FLOOR, INCLUSION_CEILING);
            if layers.is_empty() {
                continue;
            }
            let fit = |values: Vec<f64>, prev: (f64, f64), range: (f64, f64)| {
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                let floor = min_std_fraction * span(range);
                (a * mean + (1.0 - a) * prev.0, (a * var.sqrt() + (1.0 - a) * prev.1).max(floor))
            };
            d.retention = fit(layers.iter().map(|l| l.retention).collect(), d.retention, d.bounds.retention);
            d.limit = fit(layers.iter().map(|l| l.limit).collect(), d.limit, d.bounds.limit);
        }
        self.fitted_len = history.len();
    }

    fn propose(&mut self, history: &[Candidate], space: &ProgramSpace, rng: &mut ChaCha20Rng) -> RetroProgram {
        if history.is_empty() {
            return space.sample(rng);
        }
        if history.len() != self.fitted_len {
            self.refit(history);
        }
        let mut layers = Vec::new();
        for d in &self.dists {
            if rng.random::<f64>() < d.inclusion {
                layers.push(d.sample(rng));
            }
        }
        if layers.is_empty() {
            match self.dists.iter().max_by(|a, b| a.inclusion.total_cmp(&b.inclusion)) {
                Some(favourite) => layers.push(favourite.sample(rng)),
                None => return space.sample(rng),
            }
        }
        RetroProgram::new(layers)
    }
}

/// Gaussian perturbation of the best program found so far.
pub struct LocalSearch {
    step_fraction: f64,
    restart_probability: f64,
}

impl LocalSearch {
    fn propose(&self, history: &[Candidate], space: &ProgramSpace, rng: &mut ChaCha20Rng) -> RetroProgram {
        let Some(incumbent) = best(history) else {
            return space.sample(rng);
        };
        if rng.random::<f64>() < self.restart_probability {
            return space.sample(rng);
        }

        let mut layers = Vec::new();
        for b in space.enabled() {
            let toggle = rng.random::<f64>() < TOGGLE_PROBABILITY;
            match (incumbent.program.layer(b.layer_type), toggle) {
                (Some(_), true) => {}
                (Some(l), false) => layers.push(self.step(b, l, rng)),
                (None, true) => layers.push(b.sample(rng)),
                (None, false) => {}
            }
        }
        if layers.is_empty() {
            return incumbent.program.clone();
        }
        RetroProgram::new(layers)
    }

    fn step(&self, bounds: &LayerBounds, layer: &RetroLayer, rng: &mut impl Rng) -> RetroLayer {
        let r = gaussian(layer.retention, self.step_fraction * span(bounds.retention), rng);
        let l = gaussian(layer.limit, self.step_fraction * span(bounds.limit), rng);
        bounds.layer(r, l)
    }
}
