//! Discrete-time safety-car hazard model.
//!
//! Per-lap hazard is a track baseline, decayed up to 20% over race distance,
//! scaled by `exp(w · x)` over six field-state features and clamped to
//! [0, 0.95].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rng::clamp_probability;

pub const MAX_LAP_HAZARD: f64 = 0.95;
pub const VSC_SHARE: f64 = 0.4;
const BASELINE_DECAY: f64 = 0.2;
const DEFAULT_BASELINE: f64 = 0.007;
const MATERIALITY_THRESHOLD: f64 = 0.1;
const LINEAR_CLAMP: f64 = 20.0;

/// Field state at one lap. Recomputed every lap and never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HazardFeatures {
    /// Share of adjacent gaps under one second.
    pub gap_compression: f64,
    /// Variance of tyre age across the field, in hundreds of laps².
    pub tyre_age_variance: f64,
    pub weather_intensity: f64,
    /// Retirements so far per starter.
    pub incident_density: f64,
    pub mean_aggression: f64,
    /// Share of running cars at least a lap down.
    pub lapped_traffic_density: f64,
}

impl HazardFeatures {
    fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("gap_compression", self.gap_compression),
            ("tyre_age_variance", self.tyre_age_variance),
            ("weather_intensity", self.weather_intensity),
            ("incident_density", self.incident_density),
            ("mean_aggression", self.mean_aggression),
            ("lapped_traffic_density", self.lapped_traffic_density),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardWeights {
    pub gap_compression: f64,
    pub tyre_age_variance: f64,
    pub weather_intensity: f64,
    pub incident_density: f64,
    pub mean_aggression: f64,
    pub lapped_traffic_density: f64,
}

impl Default for HazardWeights {
    fn default() -> Self {
        Self {
            gap_compression: 0.6,
            tyre_age_variance: 0.3,
            weather_intensity: 1.2,
            incident_density: 2.0,
            mean_aggression: 0.5,
            lapped_traffic_density: 0.5,
        }
    }
}

impl HazardWeights {
    fn as_array(&self) -> [f64; 6] {
        [
            self.gap_compression,
            self.tyre_age_variance,
            self.weather_intensity,
            self.incident_density,
            self.mean_aggression,
            self.lapped_traffic_density,
        ]
    }
}

/// Advisory prior: consecutive quiet laps gradually depress forecasts, an
/// incident resets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietLapPrior {
    quiet_laps: u32,
    decay: f64,
    floor: f64,
}

impl Default for QuietLapPrior {
    fn default() -> Self {
        Self {
            quiet_laps: 0,
            decay: 0.97,
            floor: 0.5,
        }
    }
}

impl QuietLapPrior {
    pub fn observe(&mut self, incident: bool) {
        if incident {
            self.quiet_laps = 0;
        } else {
            self.quiet_laps = self.quiet_laps.saturating_add(1);
        }
    }

    pub fn factor(&self) -> f64 {
        let exponent = i32::try_from(self.quiet_laps).unwrap_or(i32::MAX);
        self.decay.powi(exponent).max(self.floor)
    }

    pub fn quiet_laps(&self) -> u32 {
        self.quiet_laps
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: &'static str,
    pub weighted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HazardForecast {
    pub window_laps: u32,
    pub cumulative_hazard: f64,
    pub sc_probability: f64,
    pub vsc_probability: f64,
    pub top_factors: Vec<FeatureContribution>,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct HazardModel {
    weights: HazardWeights,
    baselines: BTreeMap<String, f64>,
    default_baseline: f64,
    prior: QuietLapPrior,
}

impl Default for HazardModel {
    fn default() -> Self {
        Self::new(HazardWeights::default())
    }
}

impl HazardModel {
    pub fn new(weights: HazardWeights) -> Self {
        let baselines = [
            ("bahrain", 0.005),
            ("jeddah", 0.012),
            ("melbourne", 0.010),
            ("monaco", 0.008),
            ("silverstone", 0.006),
            ("spa", 0.008),
            ("monza", 0.005),
            ("singapore", 0.013),
            ("suzuka", 0.005),
            ("interlagos", 0.008),
        ]
        .into_iter()
        .map(|(id, h)| (id.to_string(), h))
        .collect();
        Self {
            weights,
            baselines,
            default_baseline: DEFAULT_BASELINE,
            prior: QuietLapPrior::default(),
        }
    }

    pub fn with_baseline(mut self, track_id: &str, per_lap: f64) -> Self {
        self.baselines
            .insert(track_id.to_string(), clamp_probability(per_lap));
        self
    }

    pub fn baseline(&self, track_id: &str) -> f64 {
        self.baselines
            .get(track_id)
            .copied()
            .unwrap_or(self.default_baseline)
    }

    /// Weighted feature terms in declaration order. Non-finite inputs count as 0.
    pub fn contributions(&self, features: &HazardFeatures) -> [FeatureContribution; 6] {
        let weights = self.weights.as_array();
        let named = features.named();
        std::array::from_fn(|i| {
            let (feature, value) = named[i];
            let value = if value.is_finite() { value } else { 0.0 };
            FeatureContribution {
                feature,
                weighted: weights[i] * value,
            }
        })
    }

    /// Instantaneous SC probability for `lap`.
    pub fn hazard(
        &self,
        track_id: &str,
        features: &HazardFeatures,
        lap: u32,
        total_laps: u32,
    ) -> f64 {
        let progress = if total_laps == 0 {
            0.0
        } else {
            (f64::from(lap) / f64::from(total_laps)).clamp(0.0, 1.0)
        };
        let base = self.baseline(track_id) * (1.0 - BASELINE_DECAY * progress);
        let linear: f64 = self
            .contributions(features)
            .iter()
            .map(|c| c.weighted)
            .sum::<f64>()
            .clamp(-LINEAR_CLAMP, LINEAR_CLAMP);
        let h = base * linear.exp();
        if h.is_finite() {
            h.clamp(0.0, MAX_LAP_HAZARD)
        } else {
            0.0
        }
    }

    /// SC/VSC risk over the `n` laps following `current_lap`, with features
    /// held at their current values.
    pub fn predict_next_n_laps(
        &self,
        track_id: &str,
        features: &HazardFeatures,
        current_lap: u32,
        n: u32,
        total_laps: u32,
    ) -> HazardForecast {
        let first = current_lap.saturating_add(1);
        let last = current_lap.saturating_add(n).min(total_laps);
        let cumulative_hazard: f64 = if first > last {
            0.0
        } else {
            (first..=last)
                .map(|lap| self.hazard(track_id, features, lap, total_laps))
                .sum()
        };
        let sc_probability =
            clamp_probability((1.0 - (-cumulative_hazard).exp()) * self.prior.factor());
        let vsc_probability = clamp_probability(VSC_SHARE * sc_probability);

        let mut ranked = self.contributions(features).to_vec();
        let material = ranked
            .iter()
            .filter(|c| c.weighted.abs() > MATERIALITY_THRESHOLD)
            .count();
        ranked.sort_by(|a, b| b.weighted.abs().total_cmp(&a.weighted.abs()));
        ranked.truncate(2);

        HazardForecast {
            window_laps: if first > last { 0 } else { last - first + 1 },
            cumulative_hazard,
            sc_probability,
            vsc_probability,
            top_factors: ranked,
            confidence: (0.4 + 0.1 * material as f64).min(1.0),
        }
    }

    pub fn observe_lap(&mut self, incident: bool) {
        self.prior.observe(incident);
        tracing::trace!(
            "hazard prior observe incident={} quiet_laps={} factor={:.3}",
            incident,
            self.prior.quiet_laps(),
            self.prior.factor()
        );
    }

    pub fn prior(&self) -> &QuietLapPrior {
        &self.prior
    }
}
