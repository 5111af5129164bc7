use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analysis::cvar;
use crate::error::{RetroError, RetroResult, Stage};
use crate::program::RetroProgram;
use crate::scenario::LossYear;
use crate::types::Money;

pub const CVAR_LEVEL: f64 = 0.99;

/// Objective weights. Constructed through [`RewardWeights::normalized`], which
/// guarantees non-negative components summing to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub surplus: f64,
    pub tail_risk: f64,
    pub cost: f64,
}

impl RewardWeights {
    /// Used when every raw weight is zero.
    pub const DEFAULT: RewardWeights = RewardWeights { surplus: 0.4, tail_risk: 0.4, cost: 0.2 };

    pub fn normalized(surplus: f64, tail_risk: f64, cost: f64) -> RetroResult<Self> {
        for (name, w) in [("surplus", surplus), ("tail_risk", tail_risk), ("cost", cost)] {
            if !w.is_finite() || w < 0.0 {
                return Err(RetroError::config(
                    Stage::Input,
                    format!("weight {name} must be a non-negative number, got {w}"),
                ));
            }
        }
        let total = surplus + tail_risk + cost;
        if total == 0.0 {
            return Ok(Self::DEFAULT);
        }
        Ok(RewardWeights {
            surplus: surplus / total,
            tail_risk: tail_risk / total,
            cost: cost / total,
        })
    }

    /// Re-normalise raw (slider) values held in this struct.
    pub fn normalize(self) -> RetroResult<Self> {
        Self::normalized(self.surplus, self.tail_risk, self.cost)
    }

    pub fn sum(&self) -> f64 {
        self.surplus + self.tail_risk + self.cost
    }
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Named weight profiles from the product's priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPreset {
    Balanced,
    BudgetConscious,
    RiskAverse,
    GrowthFocused,
}

impl WeightPreset {
    pub const ALL: [WeightPreset; 4] = [
        WeightPreset::Balanced,
        WeightPreset::BudgetConscious,
        WeightPreset::RiskAverse,
        WeightPreset::GrowthFocused,
    ];

    pub fn weights(self) -> RewardWeights {
        let (surplus, tail_risk, cost) = match self {
            WeightPreset::Balanced => (0.4, 0.4, 0.2),
            WeightPreset::BudgetConscious => (0.3, 0.3, 0.4),
            WeightPreset::RiskAverse => (0.2, 0.6, 0.2),
            WeightPreset::GrowthFocused => (0.6, 0.2, 0.2),
        };
        RewardWeights { surplus, tail_risk, cost }
    }
}

impl fmt::Display for WeightPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WeightPreset::Balanced => "balanced",
            WeightPreset::BudgetConscious => "budget-conscious",
            WeightPreset::RiskAverse => "risk-averse",
            WeightPreset::GrowthFocused => "growth-focused",
        })
    }
}

impl FromStr for WeightPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "balanced" => Ok(WeightPreset::Balanced),
            "budget-conscious" => Ok(WeightPreset::BudgetConscious),
            "risk-averse" => Ok(WeightPreset::RiskAverse),
            "growth-focused" => Ok(WeightPreset::GrowthFocused),
            other => Err(format!("unknown weight preset '{other}'")),
        }
    }
}

/// Metrics of one program against one loss-year batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub reward: f64,
    /// Capital − mean net loss − premium.
    pub expected_surplus: Money,
    /// Mean of the worst 1 % of net annual losses (nearest rank).
    pub cvar99: Money,
    pub total_premium: Money,
    pub expected_recovery: Money,
}

/// Uncovered position, the reference point for ROI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub expected_loss: Money,
    pub expected_surplus: Money,
    pub cvar99: Money,
}

/// Scores programs in currency terms and combines the objectives, each
/// divided by portfolio TIV, into a single reward:
///
/// `reward = w_s·surplus/TIV − w_t·cvar99/TIV − w_c·premium/TIV`
///
/// The divisor is fixed per portfolio, so a score never depends on which
/// other candidates happen to be in the pool.
#[derive(Debug, Clone, Copy)]
pub struct RewardFunction {
    capital: Money,
    scale: Money,
}

impl RewardFunction {
    pub fn new(capital: Money, portfolio_tiv: Money) -> RetroResult<Self> {
        if !capital.is_finite() || capital < 0.0 {
            return Err(RetroError::config(Stage::Scoring, format!("capital {capital} invalid")));
        }
        if !portfolio_tiv.is_finite() || portfolio_tiv <= 0.0 {
            return Err(RetroError::config(
                Stage::Scoring,
                format!("portfolio TIV {portfolio_tiv} must be positive"),
            ));
        }
        Ok(RewardFunction { capital, scale: portfolio_tiv })
    }

    pub fn capital(&self) -> Money {
        self.capital
    }

    pub fn score(&self, program: &RetroProgram, years: &[LossYear], weights: &RewardWeights) -> Score {
        let n = years.len().max(1) as f64;
        let mut net_losses = Vec::with_capacity(years.len());
        let mut total_net = 0.0;
        let mut total_recovery = 0.0;
        for y in years {
            let recovery = program.recovery(y.gross_loss);
            let net = y.gross_loss - recovery;
            total_recovery += recovery;
            total_net += net;
            net_losses.push(net);
        }

        let total_premium = program.total_premium();
        let expected_surplus = self.capital - total_net / n - total_premium;
        let cvar99 = cvar(&net_losses, CVAR_LEVEL);
        let reward = weights.surplus * (expected_surplus / self.scale)
            - weights.tail_risk * (cvar99 / self.scale)
            - weights.cost * (total_premium / self.scale);

        Score {
            reward,
            expected_surplus,
            cvar99,
            total_premium,
            expected_recovery: total_recovery / n,
        }
    }

    pub fn baseline(&self, years: &[LossYear]) -> Baseline {
        let gross: Vec<f64> = years.iter().map(|y| y.gross_loss).collect();
        let expected_loss = gross.iter().sum::<f64>() / years.len().max(1) as f64;
        Baseline {
            expected_loss,
            expected_surplus: self.capital - expected_loss,
            cvar99: cvar(&gross, CVAR_LEVEL),
        }
    }
}

/// Mean annual payout of each layer on its own, in program order.
pub fn expected_layer_payouts(program: &RetroProgram, years: &[LossYear]) -> Vec<Money> {
    let n = years.len().max(1) as f64;
    program
        .layers
        .iter()
        .map(|l| years.iter().map(|y| l.recovery(y.gross_loss)).sum::<f64>() / n)
        .collect()
}
