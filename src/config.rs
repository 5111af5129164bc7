use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::fresh_seed;
use crate::error::{RetroError, RetroResult, Stage};
use crate::optimiser::OptimiserConfig;
use crate::portfolio::{LineOfBusiness, SegmentRecord};
use crate::program::ProgramBounds;
use crate::reward::RewardWeights;
use crate::scenario::{GeneratorConfig, LineFrequency, default_line_frequencies};
use crate::types::Money;

/// Everything one optimisation run needs. All amounts in millions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Drawn from the OS when absent and echoed in the report.
    pub seed: Option<u64>,
    /// Simulated loss years per batch.
    pub years: u32,
    pub portfolio: Vec<SegmentRecord>,
    /// Raw weights; normalised before use.
    pub weights: RewardWeights,
    pub premium_budget: Money,
    /// Capital held against the portfolio; defaults to its total insured value.
    pub capital: Option<Money>,
    pub generator: GeneratorConfig,
    pub frequencies: Vec<LineFrequency>,
    pub bounds: ProgramBounds,
    pub optimiser: OptimiserConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            seed: None,
            years: 1000,
            portfolio: Vec::new(),
            weights: RewardWeights::DEFAULT,
            premium_budget: 20.0,
            capital: None,
            generator: GeneratorConfig::default(),
            frequencies: default_line_frequencies(),
            bounds: ProgramBounds::default(),
            optimiser: OptimiserConfig::default(),
        }
    }
}

impl RunConfig {
    /// The three-region sample book with balanced weights and a $20M budget.
    pub fn canonical() -> Self {
        RunConfig {
            seed: Some(42),
            portfolio: vec![
                // ── Cat-exposed south-east ────────────────────────────────────
                SegmentRecord::new("Florida", 300.0, 45.0, LineOfBusiness::PropertyCat),
                SegmentRecord::new("Gulf Coast", 250.0, 38.0, LineOfBusiness::PropertyAllRisk),
                // ── Attritional north-east ────────────────────────────────────
                SegmentRecord::new("Northeast", 180.0, 20.0, LineOfBusiness::CommercialLines),
            ],
            ..RunConfig::default()
        }
    }

    /// The configured seed, or a fresh one when none was given. Callers echo
    /// the result so the run can be repeated.
    pub fn run_seed(&self) -> u64 {
        self.seed.unwrap_or_else(fresh_seed)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> RetroResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            RetroError::config(Stage::Input, format!("cannot read {}: {e}", path.display()))
        })?;
        let config: RunConfig = serde_json::from_str(&text).map_err(|e| {
            RetroError::config(Stage::Input, format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that can be made before any simulation work. Portfolio rows,
    /// frequencies and bounds are checked again where they are consumed.
    pub fn validate(&self) -> RetroResult<()> {
        if self.years == 0 {
            return Err(RetroError::config(Stage::Input, "years must be positive"));
        }
        if self.portfolio.is_empty() {
            return Err(RetroError::config(Stage::Input, "portfolio has no segments"));
        }
        if !self.premium_budget.is_finite() || self.premium_budget < 0.0 {
            return Err(RetroError::config(
                Stage::Input,
                format!("premium budget must be a non-negative amount, got {}", self.premium_budget),
            ));
        }
        if let Some(c) = self.capital
            && (!c.is_finite() || c < 0.0)
        {
            return Err(RetroError::config(Stage::Input, format!("capital {c} invalid")));
        }
        self.weights.normalize()?;
        Ok(())
    }
}
