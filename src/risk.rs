use crate::constants::{DEFAULT_TIDE_HIGH_LEVEL_FT, THRESHOLD_TOLERANCE_IN};
use crate::types::{RiskAssessment, RiskTier, StructureType};

fn meets_limit(value: f64, limit: f64) -> bool {
    value + THRESHOLD_TOLERANCE_IN >= limit
}

/// Rate (in/hr) and 6-hour accumulation (in) limits. `None` disables that
/// metric for the tier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdPair {
    pub rate_in_hr: Option<f64>,
    pub accum_6hr_in: Option<f64>,
}

impl ThresholdPair {
    pub const fn new(rate_in_hr: Option<f64>, accum_6hr_in: Option<f64>) -> Self {
        Self {
            rate_in_hr,
            accum_6hr_in,
        }
    }

    /// Describes every metric meeting its limit, or `None` when neither does.
    fn crossed_by(&self, rate_in_hr: f64, accum_6hr_in: f64, accum_label: &str) -> Option<String> {
        let mut crossed = Vec::new();
        if let Some(limit) = self.rate_in_hr {
            if meets_limit(rate_in_hr, limit) {
                crossed.push(format!("rate {rate_in_hr:.2} in/hr >= {limit:.2}"));
            }
        }
        if let Some(limit) = self.accum_6hr_in {
            if meets_limit(accum_6hr_in, limit) {
                crossed.push(format!("{accum_label} {accum_6hr_in:.2} in >= {limit:.2}"));
            }
        }
        if crossed.is_empty() {
            None
        } else {
            Some(crossed.join(" and "))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StructureThresholds {
    pub high: ThresholdPair,
    pub at_risk: ThresholdPair,
}

impl StructureThresholds {
    pub const fn new(high: ThresholdPair, at_risk: ThresholdPair) -> Self {
        Self { high, at_risk }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdTable {
    pub underground: StructureThresholds,
    pub open_cut: StructureThresholds,
    pub elevated: StructureThresholds,
    pub coastal: StructureThresholds,
    pub default: StructureThresholds,
    pub tide_high_level_ft: f64,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            underground: StructureThresholds::new(
                ThresholdPair::new(Some(0.5), Some(2.0)),
                ThresholdPair::new(Some(0.25), Some(1.0)),
            ),
            open_cut: StructureThresholds::new(
                ThresholdPair::new(Some(0.75), Some(2.5)),
                ThresholdPair::new(Some(0.4), Some(1.5)),
            ),
            elevated: StructureThresholds::new(
                ThresholdPair::new(None, None),
                ThresholdPair::new(Some(1.5), None),
            ),
            coastal: StructureThresholds::new(
                ThresholdPair::new(Some(0.3), Some(2.5)),
                ThresholdPair::new(Some(0.15), Some(1.5)),
            ),
            default: StructureThresholds::new(
                ThresholdPair::new(Some(0.75), Some(2.5)),
                ThresholdPair::new(Some(0.4), Some(1.5)),
            ),
            tide_high_level_ft: DEFAULT_TIDE_HIGH_LEVEL_FT,
        }
    }
}

/// Live inputs for one station.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Observation {
    pub precip_rate_in_hr: f64,
    pub accum_6hr_in: f64,
    pub tide_level_ft: Option<f64>,
    pub is_coastal: bool,
}

impl ThresholdTable {
    pub fn for_structure(&self, structure: &StructureType, is_coastal: bool) -> &StructureThresholds {
        match structure {
            StructureType::Underground => &self.underground,
            StructureType::OpenCut => &self.open_cut,
            StructureType::Elevated => &self.elevated,
            StructureType::AtGrade if is_coastal => &self.coastal,
            StructureType::AtGrade | StructureType::Other(_) => &self.default,
        }
    }

    pub fn classify(&self, structure: &StructureType, observation: &Observation) -> RiskAssessment {
        self.assess(
            structure,
            observation.precip_rate_in_hr,
            observation.accum_6hr_in,
            "6h accumulation",
            observation.tide_level_ft,
            observation.is_coastal,
        )
    }

    /// Classifies a forecast total for the next `window_hours`. The total is
    /// held against the 6-hour accumulation limits and its hourly average
    /// against the rate limits.
    pub fn classify_forecast(
        &self,
        structure: &StructureType,
        forecast_total_in: f64,
        window_hours: u32,
        tide_level_ft: Option<f64>,
        is_coastal: bool,
    ) -> RiskAssessment {
        let average_rate = forecast_total_in / f64::from(window_hours.max(1));
        let label = format!("{window_hours}h forecast");
        self.assess(
            structure,
            average_rate,
            forecast_total_in,
            &label,
            tide_level_ft,
            is_coastal,
        )
    }

    fn assess(
        &self,
        structure: &StructureType,
        rate_in_hr: f64,
        accum_in: f64,
        accum_label: &str,
        tide_level_ft: Option<f64>,
        is_coastal: bool,
    ) -> RiskAssessment {
        let thresholds = self.for_structure(structure, is_coastal);
        let structure_name = String::from(structure.clone());

        let mut assessment =
            if let Some(crossed) = thresholds.high.crossed_by(rate_in_hr, accum_in, accum_label) {
                RiskAssessment {
                    tier: RiskTier::High,
                    reason: format!("{structure_name}: {crossed} (HIGH)"),
                }
            } else if let Some(crossed) =
                thresholds.at_risk.crossed_by(rate_in_hr, accum_in, accum_label)
            {
                RiskAssessment {
                    tier: RiskTier::AtRisk,
                    reason: format!("{structure_name}: {crossed} (AT_RISK)"),
                }
            } else {
                RiskAssessment {
                    tier: RiskTier::Low,
                    reason: format!(
                        "{structure_name}: rate {rate_in_hr:.2} in/hr and {accum_label} {accum_in:.2} in below thresholds"
                    ),
                }
            };

        if is_coastal {
            self.escalate_coastal(&mut assessment, rate_in_hr, tide_level_ft);
        }
        assessment
    }

    fn escalate_coastal(
        &self,
        assessment: &mut RiskAssessment,
        rate_in_hr: f64,
        tide_level_ft: Option<f64>,
    ) {
        let coastal_rate = self.coastal.high.rate_in_hr;
        let rate_elevated = coastal_rate.is_some_and(|limit| meets_limit(rate_in_hr, limit));
        let high_tide = tide_level_ft.filter(|tide| *tide >= self.tide_high_level_ft);

        let (tier, note) = match high_tide {
            Some(tide) if rate_elevated => (
                RiskTier::High,
                format!(
                    "high tide {tide:.2} ft >= {:.2} ft with coastal rate {rate_in_hr:.2} in/hr",
                    self.tide_high_level_ft
                ),
            ),
            Some(tide) => (
                RiskTier::AtRisk,
                format!("high tide {tide:.2} ft >= {:.2} ft", self.tide_high_level_ft),
            ),
            None if rate_elevated => (
                RiskTier::AtRisk,
                format!("coastal rate {rate_in_hr:.2} in/hr"),
            ),
            None => return,
        };

        if tier > assessment.tier {
            assessment.tier = tier;
            assessment.reason = format!("{}; escalated to {tier}: {note}", assessment.reason);
        }
    }
}
