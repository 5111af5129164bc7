use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{RetroError, RetroResult, Stage};
use crate::types::{Money, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineOfBusiness {
    #[serde(alias = "Property CAT")]
    PropertyCat,
    #[serde(alias = "Property All Risk")]
    PropertyAllRisk,
    #[serde(alias = "Commercial Lines")]
    CommercialLines,
    Specialty,
}

/// A portfolio row as handed over by the input collaborator.
/// Amounts are optional so that missing values can be told apart from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub region: String,
    pub total_insured_value: Option<Money>,
    pub expected_loss: Option<Money>,
    pub line_of_business: LineOfBusiness,
}

impl SegmentRecord {
    pub fn new(
        region: &str,
        total_insured_value: Money,
        expected_loss: Money,
        line_of_business: LineOfBusiness,
    ) -> Self {
        SegmentRecord {
            region: region.to_string(),
            total_insured_value: Some(total_insured_value),
            expected_loss: Some(expected_loss),
            line_of_business,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureSegment {
    pub region: String,
    pub total_insured_value: Money,
    /// Average annual loss.
    pub expected_loss: Money,
    pub line_of_business: LineOfBusiness,
}

impl ExposureSegment {
    pub fn loss_ratio(&self) -> f64 {
        if self.total_insured_value > 0.0 {
            self.expected_loss / self.total_insured_value
        } else {
            0.0
        }
    }
}

/// Normalised exposure, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposurePortfolio {
    segments: Vec<ExposureSegment>,
}

impl ExposurePortfolio {
    /// Validate external records and take ownership of the resulting segments.
    ///
    /// Rejects an empty list, missing/negative/non-finite amounts, expected loss
    /// above TIV, and a repeated (region, line of business) pair.
    pub fn from_records(records: &[SegmentRecord]) -> RetroResult<Self> {
        if records.is_empty() {
            return Err(RetroError::config(Stage::Input, "portfolio has no segments"));
        }

        let mut seen = HashSet::new();
        let mut segments = Vec::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            let tiv = require_amount(i, &r.region, "total_insured_value", r.total_insured_value)?;
            let el = require_amount(i, &r.region, "expected_loss", r.expected_loss)?;
            if el > tiv {
                return Err(RetroError::config(
                    Stage::Input,
                    format!("segment {i} ({}): expected loss {el} exceeds TIV {tiv}", r.region),
                ));
            }
            if !seen.insert((r.region.clone(), r.line_of_business)) {
                return Err(RetroError::config(
                    Stage::Input,
                    format!(
                        "segment {i}: duplicate region/line pair ({}, {:?})",
                        r.region, r.line_of_business
                    ),
                ));
            }
            segments.push(ExposureSegment {
                region: r.region.clone(),
                total_insured_value: tiv,
                expected_loss: el,
                line_of_business: r.line_of_business,
            });
        }

        if segments.iter().all(|s| s.total_insured_value == 0.0) {
            return Err(RetroError::config(Stage::Input, "portfolio TIV is zero"));
        }

        Ok(ExposurePortfolio { segments })
    }

    pub fn segments(&self) -> &[ExposureSegment] {
        &self.segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<&ExposureSegment> {
        self.segments.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_insured_value(&self) -> Money {
        self.segments.iter().map(|s| s.total_insured_value).sum()
    }

    pub fn expected_loss(&self) -> Money {
        self.segments.iter().map(|s| s.expected_loss).sum()
    }
}

fn require_amount(index: usize, region: &str, field: &str, value: Option<Money>) -> RetroResult<Money> {
    match value {
        None => Err(RetroError::config(
            Stage::Input,
            format!("segment {index} ({region}): missing {field}"),
        )),
        Some(v) if !v.is_finite() || v < 0.0 => Err(RetroError::config(
            Stage::Input,
            format!("segment {index} ({region}): {field} must be a non-negative amount, got {v}"),
        )),
        Some(v) => Ok(v),
    }
}
