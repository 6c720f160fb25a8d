//! Perturbation sweeps over a finished run.
//!
//! Each perturbation replays the baseline request through the full engine
//! (optimizer included) with one parameter moved, at a reduced Monte Carlo
//! count and the baseline's effective seed. A perturbation "flips" when the
//! focal competitor's recommended strategy changes name.

use rayon::prelude::*;
use serde::Serialize;

use crate::config::SimulationRequest;
use crate::engine::{SimulationEngine, SimulationResponse};
use crate::error::{EngineError, EngineResult};
use crate::optimizer::UtilityParams;

pub const TYRE_DEG_VALUES: [f64; 3] = [0.8, 1.2, 1.5];
pub const SC_PROBABILITY_VALUES: [f64; 4] = [0.1, 0.4, 0.7, 0.9];
pub const ALPHA_VALUES: [f64; 3] = [0.0, 1.0, 2.0];
pub const BETA_VALUES: [f64; 3] = [0.0, 1.0, 2.0];

const MAX_REPORTED_FLIPS: usize = 3;
const SENSITIVE_MAX_FLIPS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationAxis {
    TyreDegMultiplier,
    ScProbability,
    Alpha,
    Beta,
}

impl PerturbationAxis {
    pub fn name(self) -> &'static str {
        match self {
            Self::TyreDegMultiplier => "tyre_deg_multiplier",
            Self::ScProbability => "sc_probability",
            Self::Alpha => "alpha",
            Self::Beta => "beta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Perturbation {
    pub axis: PerturbationAxis,
    pub value: f64,
}

impl Perturbation {
    pub fn label(&self) -> String {
        format!("{}={}", self.axis.name(), self.value)
    }

    /// Copy of `request` with this axis moved. Everything else, including
    /// optimizer iterations, is left alone.
    pub fn apply(&self, request: &SimulationRequest) -> SimulationRequest {
        let mut out = request.clone();
        let utility = out.params.utility;
        match self.axis {
            PerturbationAxis::TyreDegMultiplier => out.params.tyre_deg_multiplier = self.value,
            PerturbationAxis::ScProbability => out.params.sc_probability = Some(self.value),
            PerturbationAxis::Alpha => {
                out.params.utility = UtilityParams::new(self.value, utility.beta())
            }
            PerturbationAxis::Beta => {
                out.params.utility = UtilityParams::new(utility.alpha(), self.value)
            }
        }
        out
    }
}

/// The full sweep, axis by axis.
pub fn perturbations() -> Vec<Perturbation> {
    let axis = |axis: PerturbationAxis, values: &[f64]| {
        values
            .iter()
            .map(move |&value| Perturbation { axis, value })
            .collect::<Vec<_>>()
    };
    let mut all = axis(PerturbationAxis::TyreDegMultiplier, &TYRE_DEG_VALUES);
    all.extend(axis(PerturbationAxis::ScProbability, &SC_PROBABILITY_VALUES));
    all.extend(axis(PerturbationAxis::Alpha, &ALPHA_VALUES));
    all.extend(axis(PerturbationAxis::Beta, &BETA_VALUES));
    all
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Robust,
    Sensitive,
    Unstable,
}

/// Verdict plus whether the recommendation still stands. It stops standing
/// once flips exceed 40% of tests.
pub fn classify(flip_count: usize, tests_run: usize) -> (Verdict, bool) {
    let verdict = match flip_count {
        0 => Verdict::Robust,
        n if n <= SENSITIVE_MAX_FLIPS => Verdict::Sensitive,
        _ => Verdict::Unstable,
    };
    (verdict, flip_count * 10 <= tests_run * 4)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerturbationOutcome {
    pub perturbation: Perturbation,
    pub strategy: String,
    pub flipped: bool,
    pub focal_win_probability: f64,
    /// Focal win probability minus the baseline's.
    pub win_probability_swing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressTestReport {
    pub baseline_strategy: String,
    pub verdict: Verdict,
    pub flip_count: usize,
    pub tests_run: usize,
    pub recommendation_valid: bool,
    pub flip_causes: Vec<String>,
    pub outcomes: Vec<PerturbationOutcome>,
    pub iterations: u32,
    pub seed: u64,
}

pub fn stress_test(
    engine: &SimulationEngine,
    baseline_request: &SimulationRequest,
    baseline_response: &SimulationResponse,
) -> EngineResult<StressTestReport> {
    if baseline_request.iterations == 0 {
        return Err(EngineError::InvalidIterations(0));
    }
    let iterations = engine.config().stress_iterations.clamp(1, baseline_request.iterations);
    let seed = baseline_response.metadata.effective_seed;
    let baseline_strategy = baseline_response.strategy.name().to_string();
    let focal = baseline_response.focal_competitor.as_str();
    let baseline_win = baseline_response.win_probability.get(focal).copied().unwrap_or(0.0);

    let mut reduced = baseline_request.clone();
    reduced.iterations = iterations;
    reduced.seed = Some(seed);
    reduced.params.focal_competitor = Some(focal.to_string());

    tracing::info!(
        "stress test baseline={} iterations={} seed={}",
        baseline_strategy,
        iterations,
        seed
    );

    let run_one = |perturbation: Perturbation| -> EngineResult<PerturbationOutcome> {
        let response = engine.run(&perturbation.apply(&reduced))?;
        let focal_win = response.win_probability.get(focal).copied().unwrap_or(0.0);
        let strategy = response.strategy.name().to_string();
        let flipped = strategy != baseline_strategy;
        if flipped {
            tracing::debug!(
                "stress flip {}: {} -> {}",
                perturbation.label(),
                baseline_strategy,
                strategy
            );
        }
        Ok(PerturbationOutcome {
            perturbation,
            flipped,
            strategy,
            focal_win_probability: focal_win,
            win_probability_swing: focal_win - baseline_win,
        })
    };

    let outcomes: Vec<PerturbationOutcome> = if engine.config().parallel {
        perturbations().into_par_iter().map(run_one).collect::<EngineResult<_>>()?
    } else {
        perturbations().into_iter().map(run_one).collect::<EngineResult<_>>()?
    };

    let flip_count = outcomes.iter().filter(|o| o.flipped).count();
    let tests_run = outcomes.len();
    let (verdict, recommendation_valid) = classify(flip_count, tests_run);
    let flip_causes = outcomes
        .iter()
        .filter(|o| o.flipped)
        .take(MAX_REPORTED_FLIPS)
        .map(|o| o.perturbation.label())
        .collect();

    tracing::info!(
        "stress verdict={:?} flips={}/{} valid={}",
        verdict,
        flip_count,
        tests_run,
        recommendation_valid
    );

    Ok(StressTestReport {
        baseline_strategy,
        verdict,
        flip_count,
        tests_run,
        recommendation_valid,
        flip_causes,
        outcomes,
        iterations,
        seed,
    })
}
