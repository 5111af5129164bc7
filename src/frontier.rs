//! Risk/return frontier over an optimisation pool.
//!
//! A point dominates another when its CVaR99 is no higher and its ROI no lower,
//! with at least one strict. Candidates with identical (CVaR99, ROI) are both
//! kept.

use std::cmp::Ordering;

use serde::Serialize;

use crate::optimiser::Candidate;
use crate::types::{CandidateId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrontierPoint {
    pub candidate_id: CandidateId,
    pub cvar99: Money,
    pub roi: f64,
    pub total_premium: Money,
    pub reward: f64,
}

/// Surplus gained over the uncovered position per unit of premium. `None` for
/// programs without premium, where the ratio is undefined.
pub fn roi(candidate: &Candidate, baseline_surplus: Money) -> Option<f64> {
    if candidate.total_premium <= 0.0 {
        return None;
    }
    let r = (candidate.expected_surplus - baseline_surplus) / candidate.total_premium;
    r.is_finite().then_some(r)
}

fn frontier_order(a: &FrontierPoint, b: &FrontierPoint) -> Ordering {
    a.cvar99
        .total_cmp(&b.cvar99)
        .then(b.roi.total_cmp(&a.roi))
        .then(a.candidate_id.cmp(&b.candidate_id))
}

/// Non-dominated candidates ordered by increasing CVaR99 (then decreasing ROI,
/// then id). Pure: the same pool always gives the same frontier, and feeding
/// the frontier's own candidates back in reproduces it.
pub fn frontier(candidates: &[Candidate], baseline_surplus: Money) -> Vec<FrontierPoint> {
    let mut points: Vec<FrontierPoint> = candidates
        .iter()
        .filter(|c| c.cvar99.is_finite())
        .filter_map(|c| {
            roi(c, baseline_surplus).map(|roi| FrontierPoint {
                candidate_id: c.id,
                cvar99: c.cvar99,
                roi,
                total_premium: c.total_premium,
                reward: c.reward,
            })
        })
        .collect();
    points.sort_by(frontier_order);

    // Sweep in CVaR order; a point survives if no cheaper-tail point has a
    // better-or-equal ROI. Equal (cvar, roi) pairs survive together.
    let mut kept: Vec<FrontierPoint> = Vec::new();
    for p in points {
        let survives = match kept.last() {
            None => true,
            Some(last) => p.roi > last.roi || (p.roi == last.roi && p.cvar99 == last.cvar99),
        };
        if survives {
            kept.push(p);
        }
    }
    kept
}

/// The frontier point with the highest reward. Ties go to the lower premium,
/// then the lower CVaR99, then the lower id.
pub fn recommend(frontier: &[FrontierPoint]) -> Option<&FrontierPoint> {
    frontier.iter().min_by(|a, b| {
        b.reward
            .total_cmp(&a.reward)
            .then(a.total_premium.total_cmp(&b.total_premium))
            .then(a.cvar99.total_cmp(&b.cvar99))
            .then(a.candidate_id.cmp(&b.candidate_id))
    })
}
