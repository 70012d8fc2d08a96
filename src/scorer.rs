//! Deterministic rule-based stroke risk scoring.
//!
//! Pure and allocation-light: no I/O, no shared state, safe to call from any
//! number of threads at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::records::{PatientFeatureSet, PatientInput};

/// Probability ceiling; a rule score never claims certainty.
pub const MAX_PROBABILITY: f64 = 0.95;
pub const MAX_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLabel {
    #[serde(rename = "High Risk")]
    High,
    #[serde(rename = "Medium Risk")]
    Medium,
    #[serde(rename = "Low Risk")]
    Low,
}

impl RiskLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLabel::High => "High Risk",
            RiskLabel::Medium => "Medium Risk",
            RiskLabel::Low => "Low Risk",
        }
    }
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const THREE_TIER: &[(f64, RiskLabel)] = &[(0.5, RiskLabel::High), (0.3, RiskLabel::Medium)];
const TWO_TIER: &[(f64, RiskLabel)] = &[(0.5, RiskLabel::High)];

/// Named mapping from probability to label. Cutoffs are strict (`>`), checked
/// from highest to lowest; anything below every cutoff is `Low Risk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierPolicy {
    #[default]
    ThreeTier,
    TwoTier,
}

impl TierPolicy {
    pub fn cutoffs(self) -> &'static [(f64, RiskLabel)] {
        match self {
            TierPolicy::ThreeTier => THREE_TIER,
            TierPolicy::TwoTier => TWO_TIER,
        }
    }

    pub fn label(self, probability: f64) -> RiskLabel {
        self.cutoffs()
            .iter()
            .find(|(cutoff, _)| probability > *cutoff)
            .map(|(_, label)| *label)
            .unwrap_or(RiskLabel::Low)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// Raw additive rule points; can exceed 100 when many factors stack.
    pub points: u32,
    pub probability: f64,
    pub label: RiskLabel,
}

impl RiskAssessment {
    /// Rule points clamped to `[0, 100]`.
    pub fn score(&self) -> u32 {
        self.points.min(MAX_SCORE)
    }
}

/// Wire shape of the scoring entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResponse {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskScorer {
    pub policy: TierPolicy,
    pub include_probability: bool,
}

impl Default for RiskScorer {
    fn default() -> Self {
        RiskScorer::new(TierPolicy::default())
    }
}

fn age_points(age: f64) -> u32 {
    if age > 60.0 {
        30
    } else if age > 45.0 {
        15
    } else {
        0
    }
}

fn glucose_points(glucose: f64) -> u32 {
    if glucose > 125.0 {
        15
    } else if glucose > 100.0 {
        10
    } else {
        0
    }
}

fn bmi_points(bmi: Option<f64>) -> u32 {
    match bmi {
        Some(b) if b > 30.0 => 10,
        Some(b) if b > 25.0 => 5,
        _ => 0,
    }
}

fn smoking_points(status: &str) -> u32 {
    match status {
        "smokes" => 15,
        "formerly smoked" => 8,
        _ => 0,
    }
}

/// Sum of the independent rule buckets.
pub fn rule_points(patient: &PatientFeatureSet) -> u32 {
    let mut points = age_points(patient.age);
    if patient.hypertension == 1 {
        points += 25;
    }
    if patient.heart_disease == 1 {
        points += 25;
    }
    points += glucose_points(patient.avg_glucose_level);
    points += bmi_points(patient.bmi);
    points += smoking_points(&patient.smoking_status);
    points
}

impl RiskScorer {
    pub fn new(policy: TierPolicy) -> Self {
        RiskScorer {
            policy,
            include_probability: true,
        }
    }

    pub fn without_probability(mut self) -> Self {
        self.include_probability = false;
        self
    }

    pub fn assess(&self, patient: &PatientFeatureSet) -> RiskAssessment {
        let points = rule_points(patient);
        let probability = (f64::from(points) / 100.0).min(MAX_PROBABILITY);
        RiskAssessment {
            points,
            probability,
            label: self.policy.label(probability),
        }
    }

    /// Validates the boundary value, then scores it.
    pub fn score(&self, input: &PatientInput) -> Result<ScoringResponse, ValidationError> {
        let patient = input.validate()?;
        let assessment = self.assess(&patient);
        Ok(ScoringResponse {
            label: assessment.label.to_string(),
            probability: self.include_probability.then_some(assessment.probability),
        })
    }
}
