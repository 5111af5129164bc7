use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RetroError, RetroResult, Stage};
use crate::types::Money;

/// Share of layer losses ceded to sidecar investors.
pub const SIDECAR_CESSION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerType {
    #[serde(rename = "XoL")]
    Xol,
    #[serde(rename = "ILW")]
    Ilw,
    Sidecar,
}

impl LayerType {
    pub const ALL: [LayerType; 3] = [LayerType::Xol, LayerType::Ilw, LayerType::Sidecar];
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerType::Xol => "XoL",
            LayerType::Ilw => "ILW",
            LayerType::Sidecar => "Sidecar",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetroLayer {
    pub layer_type: LayerType,
    /// Attachment for XoL and Sidecar; industry-loss trigger for ILW.
    pub retention: Money,
    pub limit: Money,
    /// Rate on line.
    pub premium_rate: f64,
}

impl RetroLayer {
    pub fn premium(&self) -> Money {
        self.premium_rate * self.limit
    }

    /// Amount this layer pays for a year with gross loss `loss`.
    ///
    /// - XoL pays the loss between retention and retention + limit.
    /// - ILW is binary on a portfolio-loss basis: the full limit once the
    ///   year's loss reaches the trigger.
    /// - Sidecar pays [`SIDECAR_CESSION`] of the loss above retention, capped at limit.
    pub fn recovery(&self, loss: Money) -> Money {
        let excess = (loss - self.retention).max(0.0);
        match self.layer_type {
            LayerType::Xol => excess.min(self.limit),
            LayerType::Ilw => {
                if loss >= self.retention && loss > 0.0 {
                    self.limit
                } else {
                    0.0
                }
            }
            LayerType::Sidecar => (SIDECAR_CESSION * excess).min(self.limit),
        }
    }

    fn is_well_formed(&self) -> bool {
        self.retention.is_finite()
            && self.retention >= 0.0
            && self.limit.is_finite()
            && self.limit > 0.0
            && self.premium_rate.is_finite()
            && (0.0..=1.0).contains(&self.premium_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetroProgram {
    pub layers: Vec<RetroLayer>,
}

impl RetroProgram {
    pub fn new(layers: Vec<RetroLayer>) -> Self {
        RetroProgram { layers }
    }

    pub fn total_premium(&self) -> Money {
        self.layers.iter().map(|l| l.premium()).sum()
    }

    /// Total recovery for a year, never more than the loss itself.
    pub fn recovery(&self, loss: Money) -> Money {
        let total: f64 = self.layers.iter().map(|l| l.recovery(loss)).sum();
        total.min(loss.max(0.0))
    }

    pub fn net_loss(&self, loss: Money) -> Money {
        loss - self.recovery(loss)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, layer_type: LayerType) -> Option<&RetroLayer> {
        self.layers.iter().find(|l| l.layer_type == layer_type)
    }
}

/// Allowed parameter ranges for one layer type, with its pricing curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerBounds {
    pub layer_type: LayerType,
    pub enabled: bool,
    pub retention: (Money, Money),
    pub limit: (Money, Money),
    /// Rate on line at the highest and the lowest retention: (min, max).
    pub premium_rate: (f64, f64),
}

impl LayerBounds {
    /// Rate on line falls linearly from the maximum at the lowest retention to
    /// the minimum at the highest retention.
    pub fn rate_for(&self, retention: Money) -> f64 {
        let (lo, hi) = self.retention;
        let (rate_min, rate_max) = self.premium_rate;
        if hi <= lo {
            return rate_max;
        }
        let t = ((retention - lo) / (hi - lo)).clamp(0.0, 1.0);
        rate_max - (rate_max - rate_min) * t
    }

    pub fn layer(&self, retention: Money, limit: Money) -> RetroLayer {
        let retention = retention.clamp(self.retention.0, self.retention.1);
        let limit = limit.clamp(self.limit.0, self.limit.1);
        RetroLayer {
            layer_type: self.layer_type,
            retention,
            limit,
            premium_rate: self.rate_for(retention),
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> RetroLayer {
        let retention = sample_range(self.retention, rng);
        let limit = sample_range(self.limit, rng);
        self.layer(retention, limit)
    }

    fn check(&self) -> RetroResult<()> {
        let ordered = |(a, b): (f64, f64)| a.is_finite() && b.is_finite() && a <= b;
        if !ordered(self.retention) || self.retention.0 < 0.0 {
            return Err(RetroError::config(
                Stage::Search,
                format!("{}: retention range {:?} invalid", self.layer_type, self.retention),
            ));
        }
        if !ordered(self.limit) || self.limit.0 <= 0.0 {
            return Err(RetroError::config(
                Stage::Search,
                format!("{}: limit range {:?} invalid", self.layer_type, self.limit),
            ));
        }
        if !ordered(self.premium_rate) || self.premium_rate.0 < 0.0 || self.premium_rate.1 > 1.0 {
            return Err(RetroError::config(
                Stage::Search,
                format!("{}: premium rate range {:?} invalid", self.layer_type, self.premium_rate),
            ));
        }
        Ok(())
    }
}

fn sample_range((lo, hi): (f64, f64), rng: &mut impl Rng) -> f64 {
    if hi > lo { rng.random_range(lo..=hi) } else { lo }
}

/// `steps` evenly spaced points across `[lo, hi]` (just `lo` for one step or a point range).
fn grid_points((lo, hi): (f64, f64), steps: usize) -> Vec<f64> {
    if steps <= 1 || hi <= lo {
        return vec![lo];
    }
    (0..steps).map(|i| lo + (hi - lo) * i as f64 / (steps - 1) as f64).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramBounds {
    pub layers: Vec<LayerBounds>,
    /// Chance that a sampled program includes each enabled layer type.
    pub inclusion_probability: f64,
}

impl Default for ProgramBounds {
    /// Product-table defaults, in millions.
    fn default() -> Self {
        ProgramBounds {
            layers: vec![
                LayerBounds {
                    layer_type: LayerType::Xol,
                    enabled: true,
                    retention: (10.0, 100.0),
                    limit: (25.0, 150.0),
                    premium_rate: (0.06, 0.12),
                },
                LayerBounds {
                    layer_type: LayerType::Ilw,
                    enabled: true,
                    retention: (20.0, 150.0),
                    limit: (25.0, 100.0),
                    premium_rate: (0.04, 0.08),
                },
                LayerBounds {
                    layer_type: LayerType::Sidecar,
                    enabled: true,
                    retention: (10.0, 80.0),
                    limit: (20.0, 80.0),
                    premium_rate: (0.08, 0.14),
                },
            ],
            inclusion_probability: 0.7,
        }
    }
}

/// The searchable set of retrocession programs.
#[derive(Debug, Clone)]
pub struct ProgramSpace {
    bounds: ProgramBounds,
}

impl ProgramSpace {
    pub fn new(bounds: ProgramBounds) -> RetroResult<Self> {
        if !(0.0..=1.0).contains(&bounds.inclusion_probability) {
            return Err(RetroError::config(
                Stage::Search,
                format!("inclusion probability {} outside [0, 1]", bounds.inclusion_probability),
            ));
        }
        for b in &bounds.layers {
            b.check()?;
        }
        if !bounds.layers.iter().any(|b| b.enabled) {
            return Err(RetroError::config(Stage::Search, "no layer type is enabled"));
        }
        Ok(ProgramSpace { bounds })
    }

    pub fn bounds(&self) -> &ProgramBounds {
        &self.bounds
    }

    pub fn enabled(&self) -> impl Iterator<Item = &LayerBounds> {
        self.bounds.layers.iter().filter(|b| b.enabled)
    }

    pub fn layer_bounds(&self, layer_type: LayerType) -> Option<&LayerBounds> {
        self.enabled().find(|b| b.layer_type == layer_type)
    }

    /// Draw a random non-empty program: each enabled type is included independently,
    /// and one type is forced in when the draw comes up empty.
    pub fn sample(&self, rng: &mut impl Rng) -> RetroProgram {
        let p = self.bounds.inclusion_probability;
        let mut layers = Vec::new();
        for b in self.enabled() {
            if rng.random::<f64>() < p {
                layers.push(b.sample(rng));
            }
        }
        if layers.is_empty() {
            let enabled: Vec<&LayerBounds> = self.enabled().collect();
            let pick = enabled[rng.random_range(0..enabled.len())];
            layers.push(pick.sample(rng));
        }
        RetroProgram::new(layers)
    }

    /// Every non-empty program on a `steps × steps` (retention × limit) grid
    /// per enabled layer type, each type either absent or at one grid point.
    pub fn enumerate(&self, steps: usize) -> ProgramGrid {
        let options: Vec<Vec<Option<RetroLayer>>> = self
            .enabled()
            .map(|b| {
                let mut opts = vec![None];
                for r in grid_points(b.retention, steps) {
                    for l in grid_points(b.limit, steps) {
                        opts.push(Some(b.layer(r, l)));
                    }
                }
                opts
            })
            .collect();
        ProgramGrid { cursor: vec![0; options.len()], options, done: false }
    }

    /// A program is acceptable when it is non-empty, every layer is well formed
    /// and the total premium stays within `max_premium`.
    pub fn validate(&self, program: &RetroProgram, max_premium: Money) -> bool {
        !program.is_empty()
            && max_premium.is_finite()
            && program.layers.iter().all(RetroLayer::is_well_formed)
            && program.total_premium() <= max_premium
    }
}

/// Odometer over per-type layer options; yields programs lazily.
pub struct ProgramGrid {
    options: Vec<Vec<Option<RetroLayer>>>,
    cursor: Vec<usize>,
    done: bool,
}

impl ProgramGrid {
    fn advance(&mut self) {
        for (i, c) in self.cursor.iter_mut().enumerate() {
            *c += 1;
            if *c < self.options[i].len() {
                return;
            }
            *c = 0;
        }
        self.done = true;
    }

    pub fn total(&self) -> usize {
        self.options.iter().map(Vec::len).product::<usize>().saturating_sub(1)
    }
}

impl Iterator for ProgramGrid {
    type Item = RetroProgram;

    fn next(&mut self) -> Option<RetroProgram> {
        while !self.done {
            let layers: Vec<RetroLayer> = self
                .cursor
                .iter()
                .zip(&self.options)
                .filter_map(|(&c, opts)| opts[c])
                .collect();
            self.advance();
            if !layers.is_empty() {
                return Some(RetroProgram::new(layers));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(42)
    }

    fn space() -> ProgramSpace {
        ProgramSpace::new(ProgramBounds::default()).unwrap()
    }

    fn xol(retention: f64, limit: f64) -> RetroLayer {
        RetroLayer { layer_type: LayerType::Xol, retention, limit, premium_rate: 0.1 }
    }

    #[test]
    fn premium_is_rate_times_limit() {
        let l = RetroLayer { layer_type: LayerType::Xol, retention: 30.0, limit: 100.0, premium_rate: 0.082 };
        assert!((l.premium() - 8.2).abs() < 1e-12);
    }

    #[test]
    fn xol_pays_between_retention_and_exhaustion() {
        let l = xol(30.0, 100.0);
        assert_eq!(l.recovery(10.0), 0.0);
        assert_eq!(l.recovery(30.0), 0.0);
        assert_eq!(l.recovery(80.0), 50.0);
        assert_eq!(l.recovery(500.0), 100.0);
    }

    #[test]
    fn ilw_is_binary_on_trigger() {
        let l = RetroLayer { layer_type: LayerType::Ilw, retention: 50.0, limit: 75.0, premium_rate: 0.06 };
        assert_eq!(l.recovery(49.9), 0.0);
        assert_eq!(l.recovery(50.0), 75.0);
        assert_eq!(l.recovery(300.0), 75.0);
    }

    #[test]
    fn sidecar_pays_ceded_share_up_to_limit() {
        let l = RetroLayer { layer_type: LayerType::Sidecar, retention: 20.0, limit: 50.0, premium_rate: 0.12 };
        assert_eq!(l.recovery(40.0), 10.0);
        assert_eq!(l.recovery(1_000.0), 50.0);
    }

    #[test]
    fn program_recovery_never_exceeds_loss() {
        let program = RetroProgram::new(vec![
            RetroLayer { layer_type: LayerType::Ilw, retention: 10.0, limit: 75.0, premium_rate: 0.06 },
            xol(5.0, 100.0),
        ]);
        assert_eq!(program.recovery(12.0), 12.0);
        assert_eq!(program.net_loss(12.0), 0.0);
        assert_eq!(program.recovery(0.0), 0.0);
    }

    #[test]
    fn pricing_curve_is_dearer_at_low_retention() {
        let b = ProgramBounds::default().layers[0];
        assert!((b.rate_for(10.0) - 0.12).abs() < 1e-12);
        assert!((b.rate_for(100.0) - 0.06).abs() < 1e-12);
        assert!(b.rate_for(30.0) > b.rate_for(60.0));
    }

    #[test]
    fn sampled_programs_are_non_empty_and_in_bounds() {
        let space = space();
        let mut rng = rng();
        for _ in 0..500 {
            let p = space.sample(&mut rng);
            assert!(!p.is_empty());
            for l in &p.layers {
                let b = space.layer_bounds(l.layer_type).unwrap();
                assert!(l.retention >= b.retention.0 && l.retention <= b.retention.1);
                assert!(l.limit >= b.limit.0 && l.limit <= b.limit.1);
            }
        }
    }

    #[test]
    fn disabled_types_are_never_sampled() {
        let mut bounds = ProgramBounds::default();
        bounds.layers[1].enabled = false;
        let space = ProgramSpace::new(bounds).unwrap();
        let mut rng = rng();
        for _ in 0..200 {
            assert!(space.sample(&mut rng).layer(LayerType::Ilw).is_none());
        }
    }

    #[test]
    fn validate_rejects_over_budget_and_empty() {
        let space = space();
        let p = RetroProgram::new(vec![xol(30.0, 100.0)]);
        assert!(space.validate(&p, 10.0));
        assert!(!space.validate(&p, 9.99));
        assert!(!space.validate(&RetroProgram::default(), 100.0));
    }

    #[test]
    fn validate_rejects_malformed_layers() {
        let space = space();
        let p = RetroProgram::new(vec![xol(f64::NAN, 100.0)]);
        assert!(!space.validate(&p, 100.0));
        let p = RetroProgram::new(vec![xol(10.0, -1.0)]);
        assert!(!space.validate(&p, 100.0));
    }

    #[test]
    fn grid_enumerates_every_non_empty_combination() {
        let space = space();
        let grid = space.enumerate(2);
        // (2 × 2 + 1)³ − 1 combinations.
        assert_eq!(grid.total(), 124);
        let programs: Vec<RetroProgram> = space.enumerate(2).collect();
        assert_eq!(programs.len(), 124);
        assert!(programs.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn bounds_with_inverted_range_are_rejected() {
        let mut bounds = ProgramBounds::default();
        bounds.layers[0].limit = (100.0, 10.0);
        assert!(ProgramSpace::new(bounds).is_err());
    }

    #[test]
    fn all_layers_disabled_is_rejected() {
        let mut bounds = ProgramBounds::default();
        for b in &mut bounds.layers {
            b.enabled = false;
        }
        assert!(ProgramSpace::new(bounds).is_err());
    }

    #[test]
    fn layer_type_serializes_with_market_names() {
        assert_eq!(serde_json::to_string(&LayerType::Xol).unwrap(), r#""XoL""#);
        assert_eq!(serde_json::to_string(&LayerType::Ilw).unwrap(), r#""ILW""#);
    }

    proptest! {
        #[test]
        fn accepted_programs_respect_budget(seed in any::<u64>(), budget in 0.0f64..30.0) {
            let space = space();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            for _ in 0..20 {
                let p = space.sample(&mut rng);
                if space.validate(&p, budget) {
                    prop_assert!(p.total_premium() <= budget);
                }
            }
        }

        #[test]
        fn recovery_bounded_by_loss_and_limits(loss in 0.0f64..1_000.0, seed in any::<u64>()) {
            let space = space();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let p = space.sample(&mut rng);
            let r = p.recovery(loss);
            let limits: f64 = p.layers.iter().map(|l| l.limit).sum();
            prop_assert!(r >= 0.0);
            prop_assert!(r <= loss + 1e-12);
            prop_assert!(r <= limits + 1e-12);
        }
    }
}
