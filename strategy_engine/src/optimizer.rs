//! Utility-driven search over one- and two-stop strategies for a single car.

use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::rng::candidate_seed;
use crate::simulator::{FinishResult, RaceOptions, RaceSimulator};
use crate::stats::{percentile, RunningStats};
use crate::types::{Compound, CompetitorProfile, Strategy, StrategyEvaluation, StrategyStint};

const SECONDS_PER_POSITION: f64 = 3.0;
const POINTS: [f64; 10] = [25.0, 18.0, 15.0, 12.0, 10.0, 8.0, 6.0, 4.0, 2.0, 1.0];
const MAX_POSITION: u32 = 20;
const ONE_STOP_WINDOW: (f64, f64, usize) = (0.30, 0.65, 5);
const TWO_STOP_FIRST: [f64; 2] = [0.25, 0.35];
const TWO_STOP_SECOND: [f64; 2] = [0.60, 0.72];
const TWO_STOP_COMPOUNDS: [[Compound; 3]; 4] = [
    [Compound::Soft, Compound::Medium, Compound::Hard],
    [Compound::Soft, Compound::Hard, Compound::Hard],
    [Compound::Medium, Compound::Hard, Compound::Soft],
    [Compound::Soft, Compound::Medium, Compound::Soft],
];

/// Risk weights, each clamped to [0, 2].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "UtilityDef")]
pub struct UtilityParams {
    alpha: f64,
    beta: f64,
}

#[derive(Deserialize)]
struct UtilityDef {
    alpha: f64,
    beta: f64,
}

impl From<UtilityDef> for UtilityParams {
    fn from(def: UtilityDef) -> Self {
        Self::new(def.alpha, def.beta)
    }
}

impl Default for UtilityParams {
    fn default() -> Self {
        Self { alpha: 0.5, beta: 1.0 }
    }
}

impl UtilityParams {
    pub fn new(alpha: f64, beta: f64) -> Self {
        let clamp = |v: f64, fallback: f64| if v.is_nan() { fallback } else { v.clamp(0.0, 2.0) };
        let defaults = Self::default();
        Self {
            alpha: clamp(alpha, defaults.alpha),
            beta: clamp(beta, defaults.beta),
        }
    }

    /// Position-variance aversion.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// DNF aversion.
    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn utility(&self, expected_points: f64, position_variance: f64, dnf_rate: f64) -> f64 {
        expected_points - self.alpha * position_variance - self.beta * dnf_rate * 25.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskProfile {
    Conservative,
    Balanced,
    Aggressive,
}

impl RiskProfile {
    pub fn from_dnf_rate(dnf_rate: f64) -> Self {
        if dnf_rate < 0.05 {
            Self::Conservative
        } else if dnf_rate < 0.12 {
            Self::Balanced
        } else {
            Self::Aggressive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationResult {
    pub best: Strategy,
    pub runner_up: Option<String>,
    /// Utility gap to the runner-up.
    pub dominance_margin: Option<f64>,
    pub risk_profile: RiskProfile,
    pub candidates_evaluated: usize,
    /// Candidates whose every trial ended in a DNF.
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StrategyOptimizer {
    max_candidates: usize,
    parallel: bool,
}

impl Default for StrategyOptimizer {
    fn default() -> Self {
        Self::new(48, true)
    }
}

struct CandidateSample {
    strategy: Strategy,
    times: Vec<f64>,
    /// Finish times with the flat SC/VSC loss removed. A lone car pays that
    /// loss with nobody to share it, so it is noise for ranking purposes.
    green_times: Vec<f64>,
    dnfs: u32,
    trials: u32,
}

fn pit_laps(total_laps: u32, fractions: impl IntoIterator<Item = f64>) -> Vec<u32> {
    let mut laps: Vec<u32> = fractions
        .into_iter()
        .map(|f| (f64::from(total_laps) * f).round() as u32)
        .filter(|&lap| lap >= 1 && lap < total_laps)
        .collect();
    laps.dedup();
    laps
}

/// One-stop and two-stop candidates for a race of `total_laps`. Every returned
/// strategy partitions `[1, total_laps]`; anything that would not is dropped.
pub fn generate_candidates(total_laps: u32, max_candidates: usize) -> Vec<Strategy> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |stints: Vec<StrategyStint>| match Strategy::for_race(stints, total_laps) {
        Ok(strategy) => {
            if seen.insert(strategy.name().to_string()) {
                out.push(strategy);
            }
        }
        Err(err) => tracing::trace!("candidate rejected: {}", err),
    };

    let (lo, hi, steps) = ONE_STOP_WINDOW;
    let one_stop = pit_laps(
        total_laps,
        (0..steps).map(|i| lo + (hi - lo) * i as f64 / (steps - 1) as f64),
    );
    for &pit in &one_stop {
        for first in Compound::DRY {
            for second in Compound::DRY {
                if first == second {
                    continue;
                }
                push(vec![
                    StrategyStint::new(first, pit),
                    StrategyStint::new(second, total_laps),
                ]);
            }
        }
    }

    for &first_pit in &pit_laps(total_laps, TWO_STOP_FIRST) {
        for &second_pit in &pit_laps(total_laps, TWO_STOP_SECOND) {
            for [a, b, c] in TWO_STOP_COMPOUNDS {
                push(vec![
                    StrategyStint::new(a, first_pit),
                    StrategyStint::new(b, second_pit),
                    StrategyStint::new(c, total_laps),
                ]);
            }
        }
    }

    out.truncate(max_candidates);
    out
}

/// One place per `SECONDS_PER_POSITION` behind the reference. Deliberately
/// uncapped so a car stuck at the back still shows its spread.
fn finishing_position(time: f64, reference: f64) -> u32 {
    let behind = ((time - reference).max(0.0) / SECONDS_PER_POSITION).floor();
    1 + behind as u32
}

fn points_for(position: u32) -> f64 {
    let idx = position.saturating_sub(1) as usize;
    POINTS.get(idx).copied().unwrap_or(0.0)
}

impl StrategyOptimizer {
    pub fn new(max_candidates: usize, parallel: bool) -> Self {
        Self {
            max_candidates: max_candidates.max(1),
            parallel,
        }
    }

    /// Evaluates every candidate with `iterations` seeded single-car races and
    /// returns the max-utility strategy with its evaluation attached.
    pub fn optimize(
        &self,
        simulator: &RaceSimulator<'_>,
        competitor: &CompetitorProfile,
        utility: UtilityParams,
        iterations: u32,
        base: &RaceOptions<'_>,
    ) -> EngineResult<OptimizationResult> {
        if iterations == 0 {
            return Err(EngineError::InvalidIterations(iterations));
        }
        competitor.validate()?;
        simulator.check_options(base)?;

        let candidates = generate_candidates(simulator.track().laps, self.max_candidates);
        let sample =
            |strategy: Strategy| self.sample(simulator, competitor, strategy, iterations, base);
        let samples: Vec<CandidateSample> = if self.parallel {
            candidates.into_par_iter().map(sample).collect()
        } else {
            candidates.into_iter().map(sample).collect()
        };

        let result = rank(samples, utility)?;
        tracing::info!(
            "optimizer competitor={} evaluated={} excluded={} best={} utility={:.3} margin={:?}",
            competitor.id,
            result.candidates_evaluated,
            result.excluded.len(),
            result.best.name(),
            result.best.evaluation().map_or(f64::NAN, |e| e.utility),
            result.dominance_margin
        );
        Ok(result)
    }

    fn sample(
        &self,
        simulator: &RaceSimulator<'_>,
        competitor: &CompetitorProfile,
        strategy: Strategy,
        iterations: u32,
        base: &RaceOptions<'_>,
    ) -> CandidateSample {
        let mut times = Vec::with_capacity(iterations as usize);
        let mut green_times = Vec::with_capacity(iterations as usize);
        let mut dnfs = 0;
        for trial in 0..iterations {
            let opts = base.with_seed(candidate_seed(base.seed, trial, strategy.name()));
            let outcome = simulator.run_unchecked(
                std::slice::from_ref(competitor),
                std::slice::from_ref(&strategy),
                &opts,
            );
            match outcome.results[0] {
                FinishResult::Finished { time } => {
                    times.push(time);
                    green_times.push(time - outcome.neutral_time_loss);
                }
                FinishResult::Dnf { .. } => dnfs += 1,
            }
        }
        CandidateSample {
            strategy,
            times,
            green_times,
            dnfs,
            trials: iterations,
        }
    }
}

fn rank(samples: Vec<CandidateSample>, utility: UtilityParams) -> EngineResult<OptimizationResult> {
    let (viable, dead): (Vec<CandidateSample>, Vec<CandidateSample>) =
        samples.into_iter().partition(|s| !s.times.is_empty());
    let excluded: Vec<String> = dead.into_iter().map(|s| s.strategy.name().to_string()).collect();

    // fastest green-flag median anchors the pace-to-position mapping
    let reference = viable
        .iter()
        .filter_map(|s| {
            let mut sorted = s.green_times.clone();
            sorted.sort_by(f64::total_cmp);
            percentile(&sorted, 0.5)
        })
        .fold(f64::INFINITY, f64::min);
    if !reference.is_finite() {
        return Err(EngineError::NoViableStrategy);
    }

    let mut scored: Vec<Strategy> = viable
        .into_iter()
        .map(|s| {
            let time_stats: RunningStats = s.times.iter().copied().collect();
            let green_stats: RunningStats = s.green_times.iter().copied().collect();
            let positions: Vec<u32> = s
                .green_times
                .iter()
                .map(|&t| finishing_position(t, reference))
                .collect();
            let position_stats: RunningStats = positions.iter().map(|&p| f64::from(p)).collect();
            let expected_points =
                positions.iter().map(|&p| points_for(p)).sum::<f64>() / f64::from(s.trials);
            let dnf_rate = f64::from(s.dnfs) / f64::from(s.trials);
            let position_variance = position_stats.variance();
            let evaluation = StrategyEvaluation {
                trials: s.trials,
                finished_trials: s.times.len() as u32,
                mean_time: time_stats.mean(),
                time_variance: time_stats.variance(),
                dnf_rate,
                expected_points,
                position_variance,
                utility: utility.utility(expected_points, position_variance, dnf_rate),
                expected_time_loss: green_stats.mean() - reference,
                risk_score: (dnf_rate + position_variance.sqrt() / f64::from(MAX_POSITION))
                    .min(1.0),
                robustness: 1.0 / (1.0 + green_stats.std_dev() / SECONDS_PER_POSITION),
            };
            s.strategy.with_evaluation(evaluation)
        })
        .collect();

    let score = |s: &Strategy| s.evaluation().map_or(f64::NEG_INFINITY, |e| e.utility);
    scored.sort_by(|a, b| score(b).total_cmp(&score(a)).then_with(|| a.name().cmp(b.name())));

    let candidates_evaluated = scored.len() + excluded.len();
    let mut ranked = scored.into_iter();
    let best = ranked.next().ok_or(EngineError::NoViableStrategy)?;
    let runner_up = ranked.next();
    let dominance_margin = runner_up.as_ref().map(|r| score(&best) - score(r));
    let risk_profile = RiskProfile::from_dnf_rate(best.evaluation().map_or(0.0, |e| e.dnf_rate));

    Ok(OptimizationResult {
        runner_up: runner_up.map(|r| r.name().to_string()),
        best,
        dominance_margin,
        risk_profile,
        candidates_evaluated,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_roster, TrackCatalog};
    use crate::hazard::HazardModel;
    use crate::types::{SimulationEvent, Strategy};
    use proptest::prelude::*;

    fn sample(strategy: Strategy, times: Vec<f64>, dnfs: u32, trials: u32) -> CandidateSample {
        CandidateSample {
            strategy,
            green_times: times.clone(),
            times,
            dnfs,
            trials,
        }
    }

    #[test]
    fn one_stop_candidates_change_compound() {
        let candidates = generate_candidates(57, 100);
        assert!(!candidates.is_empty());
        for s in candidates.iter().filter(|s| s.stop_count() == 1) {
            assert_ne!(s.stints()[0].compound, s.stints()[1].compound, "{}", s.name());
        }
        assert!(candidates.iter().any(|s| s.stop_count() == 2));
        assert!(candidates.iter().all(|s| s.evaluation().is_none()));
    }

    #[test]
    fn candidate_cap_is_respected() {
        assert_eq!(generate_candidates(57, 5).len(), 5);
        assert!(generate_candidates(1, 48).is_empty());
    }

    #[test]
    fn utility_weights_are_clamped() {
        let p = UtilityParams::new(-1.0, 9.0);
        assert_eq!((p.alpha(), p.beta()), (0.0, 2.0));
        let p: UtilityParams = serde_json::from_str(r#"{"alpha":3.5,"beta":0.25}"#).unwrap();
        assert_eq!((p.alpha(), p.beta()), (2.0, 0.25));
        assert_eq!(UtilityParams::new(0.0, 1.0).utility(18.0, 2.0, 0.1), 15.5);
    }

    #[test]
    fn risk_profile_thresholds() {
        assert_eq!(RiskProfile::from_dnf_rate(0.0), RiskProfile::Conservative);
        assert_eq!(RiskProfile::from_dnf_rate(0.08), RiskProfile::Balanced);
        assert_eq!(RiskProfile::from_dnf_rate(0.3), RiskProfile::Aggressive);
    }

    #[test]
    fn all_dnf_candidates_are_excluded_not_zeroed() {
        let strategy = |laps| Strategy::default_for_race(laps).unwrap();
        let soft_hard = Strategy::for_race(
            vec![
                StrategyStint::new(Compound::Soft, 20),
                StrategyStint::new(Compound::Hard, 57),
            ],
            57,
        )
        .unwrap();
        let samples = vec![
            sample(strategy(57), vec![], 10, 10),
            sample(soft_hard, vec![5300.0, 5302.0, 5301.0], 7, 10),
        ];
        let result = rank(samples, UtilityParams::default()).unwrap();
        assert_eq!(result.best.name(), "S-H@20");
        assert_eq!(result.excluded, vec!["M-H@26".to_string()]);
        assert_eq!(result.runner_up, None);
        assert_eq!(result.dominance_margin, None);
        assert_eq!(result.risk_profile, RiskProfile::Aggressive);
        assert_eq!(result.candidates_evaluated, 2);
    }

    #[test]
    fn every_trial_dnf_means_no_viable_strategy() {
        let track = TrackCatalog::builtin().get("monza").unwrap().clone();
        let hazard = HazardModel::default();
        let sim = RaceSimulator::new(&track, &hazard);
        let doomed = default_roster()[0].clone();
        let events = [SimulationEvent::failure(1, doomed.id.clone())];
        let err = StrategyOptimizer::new(6, false)
            .optimize(
                &sim,
                &doomed,
                UtilityParams::default(),
                5,
                &RaceOptions::new(1).with_events(&events),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::NoViableStrategy));
    }

    #[test]
    fn optimize_is_reproducible_and_parallel_safe() {
        let track = TrackCatalog::builtin().get("bahrain").unwrap().clone();
        let hazard = HazardModel::default();
        let sim = RaceSimulator::new(&track, &hazard);
        let driver = default_roster()[1].clone();
        let events = [SimulationEvent::safety_car(30)];
        let base = RaceOptions::new(42).with_events(&events);

        let a = StrategyOptimizer::new(48, true)
            .optimize(&sim, &driver, UtilityParams::default(), 40, &base)
            .unwrap();
        let b = StrategyOptimizer::new(48, false)
            .optimize(&sim, &driver, UtilityParams::default(), 40, &base)
            .unwrap();
        assert_eq!(a, b);
        let eval = a.best.evaluation().unwrap();
        assert_eq!(eval.trials, 40);
        assert!(eval.expected_points > 0.0);
        assert!(a.dominance_margin.unwrap() >= 0.0);
        assert!(eval.robustness > 0.0 && eval.robustness <= 1.0);
    }

    #[test]
    fn steady_backmarker_never_beats_a_fast_candidate() {
        let fast = Strategy::default_for_race(57).unwrap();
        let slow = Strategy::for_race(
            vec![
                StrategyStint::new(Compound::Hard, 17),
                StrategyStint::new(Compound::Soft, 57),
            ],
            57,
        )
        .unwrap();
        // the fast car lost 100 s behind a safety car in two of six races
        let fast_sample = CandidateSample {
            strategy: fast,
            times: vec![5400.0, 5501.0, 5402.5, 5399.0, 5500.5, 5401.0],
            green_times: vec![5400.0, 5401.0, 5402.5, 5399.0, 5400.5, 5401.0],
            dnfs: 0,
            trials: 6,
        };
        let slow_sample = sample(slow, vec![5490.0; 6], 0, 6);

        let result = rank(vec![slow_sample, fast_sample], UtilityParams::new(2.0, 1.0)).unwrap();
        assert_eq!(result.best.name(), "M-H@26");
        let eval = result.best.evaluation().unwrap();
        assert!(eval.expected_points > 20.0);
        assert!(eval.expected_time_loss < SECONDS_PER_POSITION);
        assert!(result.dominance_margin.unwrap() > 20.0);
        assert_eq!(result.runner_up.as_deref(), Some("H-S@17"));
    }

    #[test]
    fn safety_car_laps_do_not_push_the_pick_to_the_back() {
        let track = TrackCatalog::builtin().get("bahrain").unwrap().clone();
        let hazard = HazardModel::default();
        let sim = RaceSimulator::new(&track, &hazard);
        let driver = default_roster()[1].clone();
        for events in [vec![SimulationEvent::safety_car(30)], vec![]] {
            let base = RaceOptions::new(42).with_events(&events);
            let result = StrategyOptimizer::new(48, true)
                .optimize(&sim, &driver, UtilityParams::default(), 40, &base)
                .unwrap();
            let eval = result.best.evaluation().unwrap();
            assert!(eval.expected_points > 0.0, "{} scored no points", result.best.name());
            assert!(
                eval.expected_time_loss < 2.0 * SECONDS_PER_POSITION,
                "{} is {:.1}s off the fastest median",
                result.best.name(),
                eval.expected_time_loss
            );
        }
    }

    proptest! {
        #[test]
        fn generated_candidates_partition_the_race(laps in 2u32..120) {
            for s in generate_candidates(laps, 200) {
                prop_assert_eq!(s.total_laps(), laps);
                let mut start = 1;
                for stint in s.stints() {
                    prop_assert!(stint.end_lap >= start);
                    start = stint.end_lap + 1;
                }
                prop_assert_eq!(start, laps + 1);
            }
        }
    }
}
