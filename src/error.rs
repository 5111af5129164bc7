//! Error taxonomy for the simulation and optimisation core.
//!
//! Every failure carries the [`Stage`] it came from so callers can report
//! which part of a run failed. Running out of feasible programs is not an
//! error: the optimiser reports it as `Termination::Infeasible`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    /// Portfolio records, weights, budget and other run inputs.
    Input,
    Simulation,
    Scoring,
    Search,
    Frontier,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Simulation => "simulation",
            Stage::Scoring => "scoring",
            Stage::Search => "search",
            Stage::Frontier => "frontier",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetroError {
    /// Malformed input; the run never starts.
    #[error("configuration error ({stage}): {reason}")]
    Configuration { stage: Stage, reason: String },

    /// A numeric failure that local clamping/resampling could not repair.
    #[error("numeric error ({stage}): {reason}")]
    Numeric { stage: Stage, reason: String },

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },
}

impl RetroError {
    pub fn config(stage: Stage, reason: impl Into<String>) -> Self {
        RetroError::Configuration { stage, reason: reason.into() }
    }

    pub fn numeric(stage: Stage, reason: impl Into<String>) -> Self {
        RetroError::Numeric { stage, reason: reason.into() }
    }

    pub fn stage(&self) -> Stage {
        match self {
            RetroError::Configuration { stage, .. }
            | RetroError::Numeric { stage, .. }
            | RetroError::Cancelled { stage } => *stage,
        }
    }
}

pub type RetroResult<T> = Result<T, RetroError>;
