use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, LogNormal, Poisson};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::CancelToken;
use crate::error::{RetroError, RetroResult, Stage};
use crate::portfolio::{ExposurePortfolio, LineOfBusiness};
use crate::types::{Money, SegmentId, Year};

/// Draws allowed per event before a non-finite severity is escalated.
pub const MAX_RESAMPLES: usize = 8;

/// Frequency and severity shape for one line of business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineFrequency {
    pub line_of_business: LineOfBusiness,
    /// Poisson λ: expected number of loss events per year.
    pub annual_frequency: f64,
    /// ln-space standard deviation of event severity.
    pub severity_sigma: f64,
}

/// Default per-line assumptions.
/// All numeric values are PLACEHOLDER calibration.
pub fn default_line_frequencies() -> Vec<LineFrequency> {
    vec![
        // ── Catastrophe-driven lines: rare, heavy events ─────────────────────
        LineFrequency {
            line_of_business: LineOfBusiness::PropertyCat,
            annual_frequency: 0.8, // PLACEHOLDER
            severity_sigma: 1.1,   // PLACEHOLDER
        },
        LineFrequency {
            line_of_business: LineOfBusiness::Specialty,
            annual_frequency: 1.0, // PLACEHOLDER
            severity_sigma: 1.0,   // PLACEHOLDER
        },
        // ── Broader lines: more frequent, milder events ──────────────────────
        LineFrequency {
            line_of_business: LineOfBusiness::PropertyAllRisk,
            annual_frequency: 1.5, // PLACEHOLDER
            severity_sigma: 0.9,   // PLACEHOLDER
        },
        LineFrequency {
            line_of_business: LineOfBusiness::CommercialLines,
            annual_frequency: 3.0, // PLACEHOLDER
            severity_sigma: 0.7,   // PLACEHOLDER
        },
    ]
}

/// Log-normal event severity; ln-space params.
/// E[X] = exp(mu + sigma²/2).
#[derive(Debug, Clone)]
pub struct SeverityModel {
    pub mu: f64,
    pub sigma: f64,
    dist: LogNormal<f64>,
}

impl SeverityModel {
    pub fn new(mu: f64, sigma: f64) -> RetroResult<Self> {
        if !mu.is_finite() || !sigma.is_finite() || sigma <= 0.0 {
            return Err(RetroError::config(
                Stage::Simulation,
                format!("degenerate LogNormal parameters mu={mu}, sigma={sigma}"),
            ));
        }
        let dist = LogNormal::new(mu, sigma)
            .map_err(|e| RetroError::config(Stage::Simulation, format!("LogNormal: {e}")))?;
        Ok(SeverityModel { mu, sigma, dist })
    }

    /// Parameterise so that the mean severity equals `mean`.
    pub fn with_mean(mean: f64, sigma: f64) -> RetroResult<Self> {
        Self::new(mean.ln() - sigma * sigma / 2.0, sigma)
    }

    pub fn mean(&self) -> f64 {
        (self.mu + self.sigma * self.sigma / 2.0).exp()
    }

    /// Draw one severity, resampling non-finite draws up to [`MAX_RESAMPLES`] times.
    pub fn sample(&self, rng: &mut impl Rng) -> RetroResult<f64> {
        for attempt in 0..MAX_RESAMPLES {
            let x = self.dist.sample(rng);
            if x.is_finite() && x >= 0.0 {
                return Ok(x);
            }
            warn!(attempt, mu = self.mu, sigma = self.sigma, value = x, "non-finite severity, resampling");
        }
        Err(RetroError::numeric(
            Stage::Simulation,
            format!("severity draw non-finite after {MAX_RESAMPLES} attempts (mu={}, sigma={})", self.mu, self.sigma),
        ))
    }
}

/// Frequency/severity parameters for one exposure segment.
#[derive(Debug, Clone)]
pub struct SegmentModel {
    pub tiv: Money,
    pub annual_frequency: f64,
    /// `None` when the segment cannot produce losses (zero expected loss or TIV).
    pub severity: Option<SeverityModel>,
}

impl SegmentModel {
    /// Draw the segment's annual loss under a frequency and severity scaling.
    /// Each event and the annual total are capped at the segment TIV.
    fn draw_year(
        &self,
        frequency_multiplier: f64,
        severity_multiplier: f64,
        rng: &mut impl Rng,
    ) -> RetroResult<(Money, u32)> {
        let Some(severity) = &self.severity else {
            return Ok((0.0, 0));
        };
        let lambda = self.annual_frequency * frequency_multiplier;
        let poisson = Poisson::new(lambda)
            .map_err(|e| RetroError::numeric(Stage::Simulation, format!("Poisson({lambda}): {e}")))?;
        let draws: f64 = poisson.sample(rng);
        let n = draws as u32;

        let mut total = 0.0;
        for _ in 0..n {
            let mut event = severity.sample(rng)? * severity_multiplier;
            if !event.is_finite() {
                warn!(severity_multiplier, "non-finite scaled event, clamping to TIV");
                event = self.tiv;
            }
            total += event.min(self.tiv);
        }
        Ok((total.min(self.tiv), n))
    }
}

/// Portfolio turned into per-segment stochastic parameters, built once per session.
#[derive(Debug, Clone)]
pub struct ExposureModel {
    segments: Vec<SegmentModel>,
    total_tiv: Money,
}

impl ExposureModel {
    /// The severity mean is set so that `λ · E[severity] = expected_loss`,
    /// matching each segment's expected-loss/TIV ratio.
    pub fn from_portfolio(
        portfolio: &ExposurePortfolio,
        frequencies: &[LineFrequency],
    ) -> RetroResult<Self> {
        if portfolio.is_empty() {
            return Err(RetroError::config(Stage::Simulation, "portfolio has no segments"));
        }
        let mut segments = Vec::with_capacity(portfolio.len());
        for s in portfolio.segments() {
            if !s.total_insured_value.is_finite() || s.total_insured_value < 0.0 {
                return Err(RetroError::config(
                    Stage::Simulation,
                    format!("segment {}: invalid TIV {}", s.region, s.total_insured_value),
                ));
            }
            let line = frequencies
                .iter()
                .find(|f| f.line_of_business == s.line_of_business)
                .ok_or_else(|| {
                    RetroError::config(
                        Stage::Simulation,
                        format!("no frequency assumption for {:?}", s.line_of_business),
                    )
                })?;
            if !line.annual_frequency.is_finite() || line.annual_frequency <= 0.0 {
                return Err(RetroError::config(
                    Stage::Simulation,
                    format!("{:?}: annual frequency must be positive", s.line_of_business),
                ));
            }

            let severity = if s.expected_loss > 0.0 && s.total_insured_value > 0.0 {
                let mean = s.loss_ratio() * s.total_insured_value / line.annual_frequency;
                Some(SeverityModel::with_mean(mean, line.severity_sigma)?)
            } else {
                None
            };
            segments.push(SegmentModel {
                tiv: s.total_insured_value,
                annual_frequency: line.annual_frequency,
                severity,
            });
        }
        Ok(ExposureModel { segments, total_tiv: portfolio.total_insured_value() })
    }

    pub fn segments(&self) -> &[SegmentModel] {
        &self.segments
    }

    pub fn total_tiv(&self) -> Money {
        self.total_tiv
    }
}

/// One simulated annual loss, decomposed by segment in portfolio order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossYear {
    pub year: Year,
    pub gross_loss: Money,
    pub segment_losses: Vec<Money>,
    pub event_count: u32,
    /// Drawn as a clustered multi-event season by a narrative generator.
    pub clustered: bool,
}

impl LossYear {
    pub fn segment_loss(&self, id: SegmentId) -> Option<Money> {
        self.segment_losses.get(id.0).copied()
    }
}

/// A loss-year generator. Implementations must draw only from the supplied RNG.
pub trait ScenarioGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate_year(
        &self,
        model: &ExposureModel,
        year: Year,
        rng: &mut ChaCha20Rng,
    ) -> RetroResult<LossYear>;
}

/// Independent Poisson counts with log-normal severities per segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StochasticGenerator;

impl ScenarioGenerator for StochasticGenerator {
    fn name(&self) -> &'static str {
        "stochastic"
    }

    fn generate_year(
        &self,
        model: &ExposureModel,
        year: Year,
        rng: &mut ChaCha20Rng,
    ) -> RetroResult<LossYear> {
        assemble_year(model, year, 1.0, 1.0, false, rng)
    }
}

/// Stress generator: some years are clustered seasons in which every segment
/// sees elevated frequency and a shared severity shock, so losses move together.
#[derive(Debug, Clone)]
pub struct NarrativeGenerator {
    pub cluster_probability: f64,
    pub frequency_multiplier: f64,
    pub shock_sigma: f64,
    shock: LogNormal<f64>,
}

impl NarrativeGenerator {
    pub fn new(cluster_probability: f64, frequency_multiplier: f64, shock_sigma: f64) -> RetroResult<Self> {
        if !(0.0..=1.0).contains(&cluster_probability) {
            return Err(RetroError::config(
                Stage::Simulation,
                format!("cluster probability {cluster_probability} outside [0, 1]"),
            ));
        }
        if !frequency_multiplier.is_finite() || frequency_multiplier < 1.0 {
            return Err(RetroError::config(
                Stage::Simulation,
                format!("frequency multiplier {frequency_multiplier} must be >= 1"),
            ));
        }
        if !shock_sigma.is_finite() || shock_sigma < 0.0 {
            return Err(RetroError::config(
                Stage::Simulation,
                format!("shock sigma {shock_sigma} must be >= 0"),
            ));
        }
        // Mean-one shock: E[exp(N(-σ²/2, σ))] = 1.
        let shock = LogNormal::new(-shock_sigma * shock_sigma / 2.0, shock_sigma)
            .map_err(|e| RetroError::config(Stage::Simulation, format!("shock LogNormal: {e}")))?;
        Ok(NarrativeGenerator { cluster_probability, frequency_multiplier, shock_sigma, shock })
    }
}

impl ScenarioGenerator for NarrativeGenerator {
    fn name(&self) -> &'static str {
        "narrative"
    }

    fn generate_year(
        &self,
        model: &ExposureModel,
        year: Year,
        rng: &mut ChaCha20Rng,
    ) -> RetroResult<LossYear> {
        let clustered = rng.random::<f64>() < self.cluster_probability;
        if !clustered {
            return assemble_year(model, year, 1.0, 1.0, false, rng);
        }
        let mut shock = self.shock.sample(rng);
        if !shock.is_finite() {
            warn!(year = year.0, "non-finite season shock, using 1.0");
            shock = 1.0;
        }
        assemble_year(model, year, self.frequency_multiplier, shock, true, rng)
    }
}

fn assemble_year(
    model: &ExposureModel,
    year: Year,
    frequency_multiplier: f64,
    severity_multiplier: f64,
    clustered: bool,
    rng: &mut ChaCha20Rng,
) -> RetroResult<LossYear> {
    let mut segment_losses = Vec::with_capacity(model.segments.len());
    let mut event_count = 0;
    for seg in &model.segments {
        let (loss, n) = seg.draw_year(frequency_multiplier, severity_multiplier, rng)?;
        segment_losses.push(loss);
        event_count += n;
    }
    let gross_loss = segment_losses.iter().sum::<f64>().min(model.total_tiv);
    Ok(LossYear { year, gross_loss, segment_losses, event_count, clustered })
}

/// Selects a generator from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorConfig {
    #[default]
    Stochastic,
    Narrative {
        cluster_probability: f64,
        frequency_multiplier: f64,
        shock_sigma: f64,
    },
}

impl GeneratorConfig {
    /// Narrative settings used when the clustered generator is switched on without tuning.
    pub fn default_narrative() -> Self {
        GeneratorConfig::Narrative {
            cluster_probability: 0.08, // PLACEHOLDER
            frequency_multiplier: 3.0, // PLACEHOLDER
            shock_sigma: 0.5,          // PLACEHOLDER
        }
    }

    pub fn build(&self) -> RetroResult<Box<dyn ScenarioGenerator>> {
        Ok(match self {
            GeneratorConfig::Stochastic => Box::new(StochasticGenerator),
            GeneratorConfig::Narrative { cluster_probability, frequency_multiplier, shock_sigma } => {
                Box::new(NarrativeGenerator::new(*cluster_probability, *frequency_multiplier, *shock_sigma)?)
            }
        })
    }
}

/// The RNG for one loss year: stream `year` of the ChaCha20 generator keyed by `seed`.
pub fn year_rng(seed: u64, year: Year) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(year.stream());
    rng
}

/// Lazily produced, restartable loss-year sequence.
pub struct LossYearStream<'a> {
    generator: &'a dyn ScenarioGenerator,
    model: &'a ExposureModel,
    seed: u64,
    count: u32,
    next: u32,
}

impl LossYearStream<'_> {
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Rewind to the first year; the replay is identical to the first pass.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for LossYearStream<'_> {
    type Item = RetroResult<LossYear>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let year = Year(self.next);
        self.next += 1;
        let mut rng = year_rng(self.seed, year);
        Some(self.generator.generate_year(self.model, year, &mut rng))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for LossYearStream<'_> {}

pub fn simulate<'a>(
    generator: &'a dyn ScenarioGenerator,
    model: &'a ExposureModel,
    count: u32,
    seed: u64,
) -> LossYearStream<'a> {
    LossYearStream { generator, model, seed, count, next: 0 }
}

/// Generate the same years as [`simulate`], in parallel.
/// Checks `cancel` before every year; a cancelled batch is discarded whole.
pub fn simulate_batch(
    generator: &dyn ScenarioGenerator,
    model: &ExposureModel,
    count: u32,
    seed: u64,
    cancel: &CancelToken,
) -> RetroResult<Vec<LossYear>> {
    info!(generator = generator.name(), years = count, seed, "simulating loss years");
    let years = (0..count)
        .into_par_iter()
        .map(|i| {
            if cancel.is_cancelled() {
                return Err(RetroError::Cancelled { stage: Stage::Simulation });
            }
            let year = Year(i);
            let mut rng = year_rng(seed, year);
            generator.generate_year(model, year, &mut rng)
        })
        .collect::<RetroResult<Vec<LossYear>>>()?;
    Ok(years)
}
