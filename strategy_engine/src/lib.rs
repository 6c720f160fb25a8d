//! Monte Carlo race strategy engine: lap physics, safety-car hazard, strategy
//! search, seeded full-field simulation with causal attribution, and
//! perturbation stress testing.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod hazard;
pub mod optimizer;
pub mod rng;
pub mod simulator;
pub mod stats;
pub mod stress;
pub mod types;

pub use catalog::{default_roster, full_roster, load_roster, TrackCatalog};
pub use config::{EngineConfig, RequestOptions, SimulationParams, SimulationRequest};
pub use engine::{CausalAttribution, ComparisonReport, SimulationEngine, SimulationResponse};
pub use error::{EngineError, EngineResult};
pub use hazard::{HazardFeatures, HazardForecast, HazardModel, HazardWeights};
pub use optimizer::{OptimizationResult, RiskProfile, StrategyOptimizer, UtilityParams};
pub use simulator::{FinishResult, RaceOptions, RaceOutcome, RaceSimulator};
pub use stress::{stress_test, StressTestReport, Verdict};
pub use types::{
    Compound, CompetitorProfile, SimulationEvent, Strategy, StrategyStint, Track,
};
