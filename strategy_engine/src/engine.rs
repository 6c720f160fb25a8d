//! Monte Carlo orchestration.
//!
//! A request resolves its track and roster, asks the optimizer for the focal
//! competitor's strategy, then runs the full field through `iterations` seeded
//! races. Trials are sharded across rayon workers; each shard fills its own
//! [`Tally`] and shards are merged in index order, so results do not depend on
//! scheduling.

use std::collections::BTreeMap;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::TrackCatalog;
use crate::config::{EngineConfig, SimulationParams, SimulationRequest};
use crate::error::{EngineError, EngineResult};
use crate::hazard::HazardModel;
use crate::optimizer::{OptimizationResult, RiskProfile, StrategyOptimizer};
use crate::rng::{fresh_seed, trial_seed};
use crate::simulator::{RaceOptions, RaceOutcome, RaceSimulator};
use crate::stats::PaceDistribution;
use crate::types::{CompetitorProfile, SimulationEvent, Strategy, Track};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalAttribution {
    /// Joined signatures of every injected event, e.g. `SC@L20+FAILURE@L31[NOR]`.
    pub event_signature: String,
    pub competitor_id: String,
    pub with_events_win_probability: f64,
    pub baseline_win_probability: f64,
    pub impact: f64,
    pub podium_impact: f64,
    pub dnf_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationSummary {
    pub runner_up: Option<String>,
    pub dominance_margin: Option<f64>,
    pub risk_profile: RiskProfile,
    pub candidates_evaluated: usize,
    pub excluded: Vec<String>,
    /// Set when no candidate finished a trial and the default strategy was used.
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub track_id: String,
    pub iterations: u32,
    pub model_version: String,
    pub compute_time_ms: u64,
    /// Seed as supplied by the caller.
    pub seed: Option<u64>,
    /// Seed actually used; replaying with it reproduces the run.
    pub effective_seed: u64,
    pub use_ml: bool,
    pub params: SimulationParams,
    pub events: Vec<SimulationEvent>,
    /// Trials in which nobody finished; they carry no winner.
    pub trials_without_finisher: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResponse {
    pub focal_competitor: String,
    pub win_probability: BTreeMap<String, f64>,
    pub podium_probability: BTreeMap<String, f64>,
    pub dnf_risk: BTreeMap<String, f64>,
    /// Finishers only; a competitor that never finished has no entry.
    pub pace_distribution: BTreeMap<String, PaceDistribution>,
    /// Focal competitor's `(p95 - p05) / p50`.
    pub robustness_score: f64,
    pub strategy: Strategy,
    pub optimization: OptimizationSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub causal_attribution: Vec<CausalAttribution>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonEntry {
    pub strategy: Strategy,
    pub win_probability: f64,
    pub podium_probability: f64,
    pub dnf_risk: f64,
    pub pace: Option<PaceDistribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub focal_competitor: String,
    pub entries: Vec<ComparisonEntry>,
    pub metadata: ResponseMetadata,
}

/// Per-shard counters. Only these survive a trial.
#[derive(Debug, Clone)]
struct Tally {
    trials: u32,
    wins: Vec<u32>,
    podiums: Vec<u32>,
    dnfs: Vec<u32>,
    times: Vec<Vec<f64>>,
    no_finisher: u32,
}

impl Tally {
    fn new(competitors: usize) -> Self {
        Self {
            trials: 0,
            wins: vec![0; competitors],
            podiums: vec![0; competitors],
            dnfs: vec![0; competitors],
            times: vec![Vec::new(); competitors],
            no_finisher: 0,
        }
    }

    fn record(&mut self, outcome: &RaceOutcome) {
        self.trials += 1;
        let order = outcome.finishing_order();
        match order.first() {
            Some(&winner) => self.wins[winner] += 1,
            None => self.no_finisher += 1,
        }
        for &idx in order.iter().take(3) {
            self.podiums[idx] += 1;
        }
        for (idx, result) in outcome.results.iter().enumerate() {
            match result.time() {
                Some(t) => self.times[idx].push(t),
                None => self.dnfs[idx] += 1,
            }
        }
    }

    fn merge(&mut self, other: Tally) {
        self.trials += other.trials;
        self.no_finisher += other.no_finisher;
        for i in 0..self.wins.len() {
            self.wins[i] += other.wins[i];
            self.podiums[i] += other.podiums[i];
            self.dnfs[i] += other.dnfs[i];
        }
        for (mine, theirs) in self.times.iter_mut().zip(other.times) {
            mine.extend(theirs);
        }
    }

    fn rate(&self, count: u32) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            f64::from(count) / f64::from(self.trials)
        }
    }
}

struct Prepared<'a> {
    track: &'a Track,
    focal: usize,
    seed: u64,
}

pub struct SimulationEngine {
    tracks: TrackCatalog,
    roster: Vec<CompetitorProfile>,
    hazard: HazardModel,
    config: EngineConfig,
}

impl SimulationEngine {
    pub fn new(
        tracks: TrackCatalog,
        roster: Vec<CompetitorProfile>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        if roster.is_empty() {
            return Err(EngineError::EmptyRoster);
        }
        for (i, profile) in roster.iter().enumerate() {
            profile.validate()?;
            if roster[..i].iter().any(|p| p.id == profile.id) {
                return Err(EngineError::DuplicateCompetitor(profile.id.clone()));
            }
        }
        if config.shard_size == 0 {
            return Err(EngineError::InvalidParameter {
                name: "shard_size",
                value: 0.0,
            });
        }
        Ok(Self {
            tracks,
            roster,
            hazard: HazardModel::default(),
            config,
        })
    }

    pub fn with_hazard_model(mut self, hazard: HazardModel) -> Self {
        self.hazard = hazard;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn roster(&self) -> &[CompetitorProfile] {
        &self.roster
    }

    pub fn hazard(&self) -> &HazardModel {
        &self.hazard
    }

    pub fn tracks(&self) -> &TrackCatalog {
        &self.tracks
    }

    /// Rejects the request before any trial runs if anything is malformed.
    fn prepare(&self, request: &SimulationRequest) -> EngineResult<Prepared<'_>> {
        if request.iterations == 0 {
            return Err(EngineError::InvalidIterations(0));
        }
        let track = self.tracks.get(&request.track_id)?;
        track.validate()?;

        let params = &request.params;
        if !params.tyre_deg_multiplier.is_finite() || params.tyre_deg_multiplier < 0.0 {
            return Err(EngineError::InvalidParameter {
                name: "tyre_deg_multiplier",
                value: params.tyre_deg_multiplier,
            });
        }
        if let Some(p) = params.sc_probability {
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::InvalidParameter {
                    name: "sc_probability",
                    value: p,
                });
            }
        }
        for event in &request.events {
            event.validate(track.laps, &self.roster)?;
        }

        let focal = match params.focal_competitor.as_deref() {
            Some(id) => self
                .roster
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| EngineError::UnknownCompetitor(id.to_string()))?,
            None => 0,
        };

        Ok(Prepared {
            track,
            focal,
            seed: request.seed.unwrap_or_else(fresh_seed),
        })
    }

    fn race_options<'e>(&self, request: &'e SimulationRequest, seed: u64) -> RaceOptions<'e> {
        RaceOptions {
            seed,
            tyre_deg_multiplier: request.params.tyre_deg_multiplier,
            sc_probability_override: request.params.sc_probability,
            events: &request.events,
            use_ml: request.use_ml,
            record_trace: false,
        }
    }

    /// Runs the optimizer for the focal competitor and the full-field Monte
    /// Carlo, plus a shadow run without injected events when there are any
    /// and the sample is large enough.
    pub fn run(&self, request: &SimulationRequest) -> EngineResult<SimulationResponse> {
        let started = Instant::now();
        let prepared = self.prepare(request)?;
        let track = prepared.track;
        let focal = &self.roster[prepared.focal];
        tracing::info!(
            "run track={} iterations={} seed={} focal={} events={}",
            track.id,
            request.iterations,
            prepared.seed,
            focal.id,
            request.events.len()
        );

        let simulator = RaceSimulator::new(track, &self.hazard);
        let base = self.race_options(request, prepared.seed);

        let optimizer_iterations = request
            .params
            .optimizer_iterations
            .unwrap_or(self.config.optimizer_iterations);
        let default_strategy = Strategy::default_for_race(track.laps)?;
        let optimizer = StrategyOptimizer::new(self.config.max_candidates, self.config.parallel);
        let utility = request.params.utility;
        let (optimization, fallback) =
            match optimizer.optimize(&simulator, focal, utility, optimizer_iterations, &base) {
                Ok(result) => (result, false),
                // every candidate retired, e.g. an injected failure on the focal car
                Err(EngineError::NoViableStrategy) => {
                    tracing::warn!(
                        "no candidate finished for {}; using {}",
                        focal.id,
                        default_strategy.name()
                    );
                    let result = OptimizationResult {
                        best: default_strategy.clone(),
                        runner_up: None,
                        dominance_margin: None,
                        risk_profile: RiskProfile::Aggressive,
                        candidates_evaluated: 0,
                        excluded: Vec::new(),
                    };
                    (result, true)
                }
                Err(err) => return Err(err),
            };

        let mut strategies = vec![default_strategy; self.roster.len()];
        strategies[prepared.focal] = optimization.best.clone();
        simulator.check_inputs(&self.roster, &strategies)?;

        let attribute =
            !request.events.is_empty() && request.iterations >= self.config.causal_min_iterations;
        let shadow_base = RaceOptions {
            events: &[],
            ..base.clone()
        };
        let (tally, shadow) = if attribute && self.config.parallel {
            let (with_events, without) = rayon::join(
                || self.monte_carlo(&simulator, &strategies, &base, request.iterations),
                || self.monte_carlo(&simulator, &strategies, &shadow_base, request.iterations),
            );
            (with_events, Some(without))
        } else if attribute {
            (
                self.monte_carlo(&simulator, &strategies, &base, request.iterations),
                Some(self.monte_carlo(&simulator, &strategies, &shadow_base, request.iterations)),
            )
        } else {
            if !request.events.is_empty() {
                tracing::debug!(
                    "causal attribution skipped: iterations={} below {}",
                    request.iterations,
                    self.config.causal_min_iterations
                );
            }
            (self.monte_carlo(&simulator, &strategies, &base, request.iterations), None)
        };

        let causal_attribution = shadow
            .map(|baseline| {
                vec![self.attribute(&request.events, prepared.focal, &tally, &baseline)]
            })
            .unwrap_or_default();

        let mut win_probability = BTreeMap::new();
        let mut podium_probability = BTreeMap::new();
        let mut dnf_risk = BTreeMap::new();
        let mut pace_distribution = BTreeMap::new();
        let Tally {
            trials,
            wins,
            podiums,
            dnfs,
            times,
            no_finisher,
        } = tally;
        let rate = |count: u32| f64::from(count) / f64::from(trials.max(1));
        for (idx, (profile, mut sample)) in self.roster.iter().zip(times).enumerate() {
            win_probability.insert(profile.id.clone(), rate(wins[idx]));
            podium_probability.insert(profile.id.clone(), rate(podiums[idx]));
            dnf_risk.insert(profile.id.clone(), rate(dnfs[idx]));
            if let Some(pace) = PaceDistribution::from_times(&mut sample) {
                pace_distribution.insert(profile.id.clone(), pace);
            }
        }
        let robustness_score = pace_distribution.get(&focal.id).map_or(0.0, |p| p.robustness);

        let compute_time_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "run complete track={} strategy={} focal_win={:.4} compute_ms={}",
            track.id,
            optimization.best.name(),
            win_probability.get(&focal.id).copied().unwrap_or(0.0),
            compute_time_ms
        );

        Ok(SimulationResponse {
            focal_competitor: focal.id.clone(),
            win_probability,
            podium_probability,
            dnf_risk,
            pace_distribution,
            robustness_score,
            optimization: OptimizationSummary {
                runner_up: optimization.runner_up,
                dominance_margin: optimization.dominance_margin,
                risk_profile: optimization.risk_profile,
                candidates_evaluated: optimization.candidates_evaluated,
                excluded: optimization.excluded,
                fallback,
            },
            strategy: optimization.best,
            causal_attribution,
            metadata: self.metadata(request, prepared.seed, compute_time_ms, no_finisher),
        })
    }

    /// Evaluates explicit focal strategies under identical seeds; everyone
    /// else runs the default strategy.
    pub fn run_comparison(
        &self,
        request: &SimulationRequest,
        candidates: &[Strategy],
    ) -> EngineResult<ComparisonReport> {
        let started = Instant::now();
        let prepared = self.prepare(request)?;
        let track = prepared.track;
        if candidates.is_empty() {
            return Err(EngineError::malformed("comparison", "no strategies supplied"));
        }
        for strategy in candidates {
            strategy.check_laps(track.laps)?;
        }

        let simulator = RaceSimulator::new(track, &self.hazard);
        let base = self.race_options(request, prepared.seed);
        let default_strategy = Strategy::default_for_race(track.laps)?;
        let focal = prepared.focal;

        let evaluate = |strategy: &Strategy| {
            let mut strategies = vec![default_strategy.clone(); self.roster.len()];
            strategies[focal] = strategy.clone();
            let mut tally = self.monte_carlo(&simulator, &strategies, &base, request.iterations);
            ComparisonEntry {
                strategy: strategy.clone(),
                win_probability: tally.rate(tally.wins[focal]),
                podium_probability: tally.rate(tally.podiums[focal]),
                dnf_risk: tally.rate(tally.dnfs[focal]),
                pace: PaceDistribution::from_times(&mut tally.times[focal]),
            }
        };
        let entries: Vec<ComparisonEntry> = if self.config.parallel {
            candidates.par_iter().map(evaluate).collect()
        } else {
            candidates.iter().map(evaluate).collect()
        };

        let compute_time_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "comparison track={} strategies={} compute_ms={}",
            track.id,
            entries.len(),
            compute_time_ms
        );
        Ok(ComparisonReport {
            focal_competitor: self.roster[focal].id.clone(),
            entries,
            metadata: self.metadata(request, prepared.seed, compute_time_ms, 0),
        })
    }

    /// The trial loop. Trial `i` always runs with `trial_seed(base.seed, i)`.
    fn monte_carlo(
        &self,
        simulator: &RaceSimulator<'_>,
        strategies: &[Strategy],
        base: &RaceOptions<'_>,
        iterations: u32,
    ) -> Tally {
        let n = self.roster.len();
        let shard_size = self.config.shard_size.max(1);
        let shards: Vec<(u32, u32)> = (0..iterations)
            .step_by(shard_size as usize)
            .map(|start| (start, start.saturating_add(shard_size).min(iterations)))
            .collect();

        let run_shard = |(start, end): (u32, u32)| {
            let mut tally = Tally::new(n);
            for trial in start..end {
                let opts = base.with_seed(trial_seed(base.seed, trial));
                let outcome = simulator.run_unchecked(&self.roster, strategies, &opts);
                tally.record(&outcome);
            }
            tally
        };

        let partials: Vec<Tally> = if self.config.parallel {
            shards.into_par_iter().map(run_shard).collect()
        } else {
            shards.into_iter().map(run_shard).collect()
        };
        partials.into_iter().fold(Tally::new(n), |mut acc, partial| {
            acc.merge(partial);
            acc
        })
    }

    fn attribute(
        &self,
        events: &[SimulationEvent],
        focal: usize,
        with_events: &Tally,
        baseline: &Tally,
    ) -> CausalAttribution {
        let signature = events
            .iter()
            .map(SimulationEvent::signature)
            .collect::<Vec<_>>()
            .join("+");
        let with_win = with_events.rate(with_events.wins[focal]);
        let base_win = baseline.rate(baseline.wins[focal]);
        let attribution = CausalAttribution {
            event_signature: signature,
            competitor_id: self.roster[focal].id.clone(),
            with_events_win_probability: with_win,
            baseline_win_probability: base_win,
            impact: with_win - base_win,
            podium_impact: with_events.rate(with_events.podiums[focal])
                - baseline.rate(baseline.podiums[focal]),
            dnf_impact: with_events.rate(with_events.dnfs[focal])
                - baseline.rate(baseline.dnfs[focal]),
        };
        tracing::info!(
            "causal attribution signature={} competitor={} impact={:+.4}",
            attribution.event_signature,
            attribution.competitor_id,
            attribution.impact
        );
        attribution
    }

    fn metadata(
        &self,
        request: &SimulationRequest,
        seed: u64,
        compute_time_ms: u64,
        trials_without_finisher: u32,
    ) -> ResponseMetadata {
        ResponseMetadata {
            track_id: request.track_id.clone(),
            iterations: request.iterations,
            model_version: self.config.model_version.clone(),
            compute_time_ms,
            seed: request.seed,
            effective_seed: seed,
            use_ml: request.use_ml,
            params: request.params.clone(),
            events: request.events.clone(),
            trials_without_finisher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_roster;

    fn engine(parallel: bool) -> SimulationEngine {
        let config = EngineConfig {
            optimizer_iterations: 20,
            max_candidates: 12,
            shard_size: 64,
            parallel,
            ..EngineConfig::default()
        };
        SimulationEngine::new(TrackCatalog::builtin(), default_roster(), config).unwrap()
    }

    #[test]
    fn configuration_errors_fail_before_trials() {
        let e = engine(false);
        assert!(matches!(
            e.run(&SimulationRequest::new("atlantis", 10, Some(1))),
            Err(EngineError::UnknownTrack(_))
        ));
        assert!(matches!(
            e.run(&SimulationRequest::new("bahrain", 0, Some(1))),
            Err(EngineError::InvalidIterations(0))
        ));
        let bad_event = SimulationRequest::new("bahrain", 10, Some(1))
            .with_events(vec![SimulationEvent::failure(5, "SCHUMACHER")]);
        assert!(matches!(e.run(&bad_event), Err(EngineError::UnknownCompetitor(_))));
        let bad_focal =
            SimulationRequest::new("bahrain", 10, Some(1)).with_params(SimulationParams {
                focal_competitor: Some("XXX".into()),
                ..SimulationParams::default()
            });
        assert!(matches!(e.run(&bad_focal), Err(EngineError::UnknownCompetitor(_))));
        assert!(matches!(
            SimulationEngine::new(TrackCatalog::builtin(), vec![], EngineConfig::default()),
            Err(EngineError::EmptyRoster)
        ));
        let mut dup = default_roster();
        dup.push(dup[0].clone());
        assert!(matches!(
            SimulationEngine::new(TrackCatalog::builtin(), dup, EngineConfig::default()),
            Err(EngineError::DuplicateCompetitor(_))
        ));
    }

    #[test]
    fn sharded_and_sequential_runs_agree() {
        let request = SimulationRequest::new("monza", 300, Some(7));
        let a = engine(true).run(&request).unwrap();
        let b = engine(false).run(&request).unwrap();
        assert_eq!(a.win_probability, b.win_probability);
        assert_eq!(a.pace_distribution, b.pace_distribution);
        assert_eq!(a.strategy, b.strategy);
    }

    #[test]
    fn unseeded_run_echoes_effective_seed() {
        let e = engine(true);
        let first = e.run(&SimulationRequest::new("monza", 50, None)).unwrap();
        assert_eq!(first.metadata.seed, None);
        let replay = e
            .run(&SimulationRequest::new("monza", 50, Some(first.metadata.effective_seed)))
            .unwrap();
        assert_eq!(first.win_probability, replay.win_probability);
    }

    #[test]
    fn focal_gets_optimized_strategy_with_evaluation() {
        let params = SimulationParams {
            focal_competitor: Some("LEC".into()),
            ..SimulationParams::default()
        };
        let request = SimulationRequest::new("silverstone", 100, Some(3)).with_params(params);
        let response = engine(true).run(&request).unwrap();
        assert_eq!(response.focal_competitor, "LEC");
        assert!(response.strategy.evaluation().is_some());
        assert_eq!(response.strategy.total_laps(), 52);
        assert!(response.causal_attribution.is_empty());
        assert_eq!(response.metadata.iterations, 100);
    }

    #[test]
    fn small_samples_skip_causal_attribution() {
        let request = SimulationRequest::new("bahrain", 100, Some(3))
            .with_events(vec![SimulationEvent::safety_car(10)]);
        let response = engine(true).run(&request).unwrap();
        assert!(response.causal_attribution.is_empty());
    }

    #[test]
    fn focal_failure_falls_back_to_default_strategy() {
        let request = SimulationRequest::new("monza", 50, Some(4))
            .with_events(vec![SimulationEvent::failure(1, "VER")]);
        let response = engine(false).run(&request).unwrap();
        assert!(response.optimization.fallback);
        assert_eq!(response.strategy.name(), Strategy::default_for_race(53).unwrap().name());
        assert_eq!(response.dnf_risk["VER"], 1.0);
        assert_eq!(response.win_probability["VER"], 0.0);
        assert!(!response.pace_distribution.contains_key("VER"));
        assert_eq!(response.robustness_score, 0.0);
    }

    #[test]
    fn comparison_uses_identical_conditions() {
        let e = engine(true);
        let request = SimulationRequest::new("bahrain", 200, Some(11));
        let a = Strategy::default_for_race(57).unwrap();
        let report = e.run_comparison(&request, &[a.clone(), a.clone()]).unwrap();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].win_probability, report.entries[1].win_probability);
        assert_eq!(report.entries[0].pace, report.entries[1].pace);

        let wrong = Strategy::default_for_race(50).unwrap();
        assert!(matches!(
            e.run_comparison(&request, &[wrong]),
            Err(EngineError::StrategyLapMismatch { .. })
        ));
    }
}
