use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::optimizer::UtilityParams;
use crate::types::SimulationEvent;

pub const DEFAULT_ITERATIONS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Single-car races per optimizer candidate.
    pub optimizer_iterations: u32,
    pub max_candidates: usize,
    /// Below this many iterations causal attribution is skipped as noise.
    pub causal_min_iterations: u32,
    pub parallel: bool,
    /// Trials per rayon shard.
    pub shard_size: u32,
    /// Monte Carlo iterations per stress-test perturbation.
    pub stress_iterations: u32,
    pub model_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimizer_iterations: 120,
            max_candidates: 48,
            causal_min_iterations: 500,
            parallel: true,
            shard_size: 250,
            stress_iterations: 200,
            model_version: concat!("strategy-engine/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> EngineResult<Self> {
        let data = fs::read_to_string(Path::new(path)).map_err(|source| EngineError::Io {
            path: path.to_string(),
            source,
        })?;
        let cfg: Self = serde_json::from_str(&data)?;
        if cfg.shard_size == 0 {
            return Err(EngineError::InvalidParameter {
                name: "shard_size",
                value: 0.0,
            });
        }
        Ok(cfg)
    }
}

/// Caller-facing option map; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub tyre_deg_multiplier: f64,
    pub sc_probability: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub seed: Option<u64>,
    pub iterations: Option<u32>,
    pub use_ml: bool,
    pub events: Vec<SimulationEvent>,
    pub focal_competitor: Option<String>,
    pub optimizer_iterations: Option<u32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            tyre_deg_multiplier: 1.0,
            sc_probability: None,
            alpha: None,
            beta: None,
            seed: None,
            iterations: None,
            use_ml: false,
            events: Vec::new(),
            focal_competitor: None,
            optimizer_iterations: None,
        }
    }
}

impl RequestOptions {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_request(self, track_id: impl Into<String>) -> SimulationRequest {
        let defaults = UtilityParams::default();
        SimulationRequest {
            track_id: track_id.into(),
            iterations: self.iterations.unwrap_or(DEFAULT_ITERATIONS),
            seed: self.seed,
            use_ml: self.use_ml,
            params: SimulationParams {
                tyre_deg_multiplier: self.tyre_deg_multiplier,
                sc_probability: self.sc_probability,
                utility: UtilityParams::new(
                    self.alpha.unwrap_or(defaults.alpha()),
                    self.beta.unwrap_or(defaults.beta()),
                ),
                focal_competitor: self.focal_competitor,
                optimizer_iterations: self.optimizer_iterations,
            },
            events: self.events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationParams {
    pub tyre_deg_multiplier: f64,
    pub sc_probability: Option<f64>,
    pub utility: UtilityParams,
    /// Defaults to the first competitor in the roster.
    pub focal_competitor: Option<String>,
    pub optimizer_iterations: Option<u32>,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            tyre_deg_multiplier: 1.0,
            sc_probability: None,
            utility: UtilityParams::default(),
            focal_competitor: None,
            optimizer_iterations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRequest {
    pub track_id: String,
    pub iterations: u32,
    pub seed: Option<u64>,
    pub use_ml: bool,
    pub params: SimulationParams,
    pub events: Vec<SimulationEvent>,
}

impl SimulationRequest {
    pub fn new(track_id: impl Into<String>, iterations: u32, seed: Option<u64>) -> Self {
        Self {
            track_id: track_id.into(),
            iterations,
            seed,
            use_ml: false,
            params: SimulationParams::default(),
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<SimulationEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_params(mut self, params: SimulationParams) -> Self {
        self.params = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_map_defaults() {
        let opts = RequestOptions::from_json("{}").unwrap();
        assert_eq!(opts, RequestOptions::default());
        let req = opts.into_request("bahrain");
        assert_eq!(req.iterations, DEFAULT_ITERATIONS);
        assert_eq!(req.params.tyre_deg_multiplier, 1.0);
        assert_eq!(req.seed, None);
        assert!(req.events.is_empty());
    }

    #[test]
    fn option_map_full() {
        let json = r#"{
            "tyre_deg_multiplier": 1.4,
            "sc_probability": 0.6,
            "alpha": 5.0,
            "beta": 0.5,
            "seed": 42,
            "iterations": 800,
            "use_ml": true,
            "events": [{"type": "VSC", "lap": 20}],
            "dashboard_theme": "dark"
        }"#;
        let req = RequestOptions::from_json(json).unwrap().into_request("spa");
        assert_eq!(req.track_id, "spa");
        assert_eq!(req.seed, Some(42));
        assert_eq!(req.iterations, 800);
        assert!(req.use_ml);
        assert_eq!(req.params.utility.alpha(), 2.0);
        assert_eq!(req.params.utility.beta(), 0.5);
        assert_eq!(req.params.sc_probability, Some(0.6));
        assert_eq!(req.events, vec![SimulationEvent::virtual_safety_car(20)]);
    }

    #[test]
    fn engine_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"optimizer_iterations": 30, "parallel": false}"#).unwrap();
        let cfg = EngineConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.optimizer_iterations, 30);
        assert!(!cfg.parallel);
        assert_eq!(cfg.causal_min_iterations, 500);
        assert!(matches!(
            EngineConfig::load("/definitely/not/here.json"),
            Err(EngineError::Io { .. })
        ));
    }
}
