//! Lap-by-lap race physics.
//!
//! One call simulates one race from a single seed. All per-race state lives in
//! locals of [`RaceSimulator::run_unchecked`] and is dropped when it returns.

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::hazard::{HazardFeatures, HazardModel, VSC_SHARE};
use crate::rng::{clamp_probability, TrialRng};
use crate::types::{Compound, CompetitorProfile, RestartSkill, SimulationEvent, Strategy, Track};

pub const SC_DURATION_LAPS: u32 = 4;
pub const VSC_DURATION_LAPS: u32 = 2;
pub const DEG_EXPONENT: f64 = 1.35;
pub const FUEL_EFFECT_PER_LAP: f64 = 0.035;
const FUEL_LOAD_KG: f64 = 105.0;
const BASE_NOISE_STD: f64 = 0.2;
const SC_VARIANCE_MULTIPLIER: f64 = 10.0;
const VSC_VARIANCE_MULTIPLIER: f64 = 4.0;
const SC_LAP_TIME_LOSS: f64 = 25.0;
const VSC_LAP_TIME_LOSS: f64 = 15.0;
const TRAFFIC_GAP_THRESHOLD: f64 = 1.0;
const TRAFFIC_PENALTY: f64 = 0.6;
const WEATHER_TIME_LOSS: f64 = 3.0;
const SC_MAX_GAP: f64 = 0.8;
const VSC_MAX_GAP: f64 = 2.0;
const COMPRESSION_JITTER: f64 = 0.2;
const MIN_FOLLOW_GAP: f64 = 0.1;
const RESTART_WARMUP_SECONDS: f64 = 0.8;
const RESTART_AGGRESSION_GAIN: f64 = 0.4;
const MANAGEMENT_RELIEF: f64 = 0.4;
const MIN_LAP_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Neutralization {
    SafetyCar,
    VirtualSafetyCar,
}

impl Neutralization {
    fn duration(self) -> u32 {
        match self {
            Self::SafetyCar => SC_DURATION_LAPS,
            Self::VirtualSafetyCar => VSC_DURATION_LAPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LapTag {
    Green,
    Pit,
    Sc,
    Vsc,
    Restart,
    Weather,
    Dnf,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishResult {
    Finished { time: f64 },
    Dnf { lap: u32 },
}

impl FinishResult {
    pub fn time(&self) -> Option<f64> {
        match self {
            Self::Finished { time } => Some(*time),
            Self::Dnf { .. } => None,
        }
    }

    pub fn is_dnf(&self) -> bool {
        matches!(self, Self::Dnf { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LapRecord {
    pub lap: u32,
    pub competitor_id: String,
    /// `None` on the lap a car retires.
    pub lap_time: Option<f64>,
    pub compound: Compound,
    pub position: Option<u32>,
    pub tyre_age: u32,
    /// Seconds lost to degradation this lap.
    pub tyre_wear: f64,
    pub fuel_remaining_kg: f64,
    pub pitted: bool,
    pub tag: LapTag,
}

/// One race. `results` is index-aligned with the competitor slice passed in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceOutcome {
    pub results: Vec<FinishResult>,
    /// Flat SC/VSC loss charged to every car that ran the neutralized laps.
    /// Subtracting it from a finish time leaves the green-flag equivalent.
    pub neutral_time_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<LapRecord>>,
}

impl RaceOutcome {
    /// Indices of finishers, fastest first. Ties resolve to the lower index.
    pub fn finishing_order(&self) -> Vec<usize> {
        let mut order: Vec<(usize, f64)> = self
            .results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.time().map(|t| (i, t)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        order.into_iter().map(|(i, _)| i).collect()
    }

    pub fn winner(&self) -> Option<usize> {
        self.finishing_order().first().copied()
    }
}

#[derive(Debug, Clone)]
pub struct RaceOptions<'e> {
    pub seed: u64,
    pub tyre_deg_multiplier: f64,
    /// Race-distance SC probability replacing the track's own.
    pub sc_probability_override: Option<f64>,
    pub events: &'e [SimulationEvent],
    pub use_ml: bool,
    pub record_trace: bool,
}

impl<'e> RaceOptions<'e> {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tyre_deg_multiplier: 1.0,
            sc_probability_override: None,
            events: &[],
            use_ml: false,
            record_trace: false,
        }
    }

    pub fn with_events(mut self, events: &'e [SimulationEvent]) -> Self {
        self.events = events;
        self
    }

    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            seed,
            ..self.clone()
        }
    }
}

/// Seconds added by tyre wear on a lap driven at `tyre_age` laps.
pub fn tyre_degradation(
    wear_rate: f64,
    tyre_management: f64,
    deg_multiplier: f64,
    weather_multiplier: f64,
    tyre_age: u32,
) -> f64 {
    let management = 1.0 - MANAGEMENT_RELIEF * tyre_management.clamp(0.0, 1.0);
    let age = f64::from(tyre_age).powf(DEG_EXPONENT);
    wear_rate * management * deg_multiplier * weather_multiplier * age
}

/// Fuel mass penalty, falling linearly to zero at the flag.
pub fn fuel_effect(lap: u32, total_laps: u32) -> f64 {
    FUEL_EFFECT_PER_LAP * f64::from(total_laps.saturating_sub(lap))
}

#[derive(Debug, Clone, Default)]
struct CarState {
    elapsed: f64,
    tyre_age: u32,
    stint: usize,
    retired_on: Option<u32>,
}

impl CarState {
    fn running(&self) -> bool {
        self.retired_on.is_none()
    }
}

pub struct RaceSimulator<'a> {
    track: &'a Track,
    hazard: &'a HazardModel,
}

impl<'a> RaceSimulator<'a> {
    pub fn new(track: &'a Track, hazard: &'a HazardModel) -> Self {
        Self { track, hazard }
    }

    pub fn track(&self) -> &Track {
        self.track
    }

    pub fn check_inputs(
        &self,
        profiles: &[CompetitorProfile],
        strategies: &[Strategy],
    ) -> EngineResult<()> {
        if profiles.is_empty() {
            return Err(EngineError::EmptyRoster);
        }
        if profiles.len() != strategies.len() {
            return Err(EngineError::StrategyCountMismatch {
                strategies: strategies.len(),
                competitors: profiles.len(),
            });
        }
        for strategy in strategies {
            strategy.check_laps(self.track.laps)?;
        }
        Ok(())
    }

    pub fn check_options(&self, opts: &RaceOptions<'_>) -> EngineResult<()> {
        if !opts.tyre_deg_multiplier.is_finite() || opts.tyre_deg_multiplier < 0.0 {
            return Err(EngineError::InvalidParameter {
                name: "tyre_deg_multiplier",
                value: opts.tyre_deg_multiplier,
            });
        }
        if let Some(p) = opts.sc_probability_override {
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::InvalidParameter {
                    name: "sc_probability",
                    value: p,
                });
            }
        }
        Ok(())
    }

    /// Simulates one full race for every competitor.
    pub fn simulate(
        &self,
        profiles: &[CompetitorProfile],
        strategies: &[Strategy],
        opts: &RaceOptions<'_>,
    ) -> EngineResult<RaceOutcome> {
        self.check_inputs(profiles, strategies)?;
        self.check_options(opts)?;
        Ok(self.run_unchecked(profiles, strategies, opts))
    }

    /// One competitor alone on track.
    pub fn simulate_single(
        &self,
        profile: &CompetitorProfile,
        strategy: &Strategy,
        opts: &RaceOptions<'_>,
    ) -> EngineResult<FinishResult> {
        strategy.check_laps(self.track.laps)?;
        self.check_options(opts)?;
        let outcome = self.run_unchecked(
            std::slice::from_ref(profile),
            std::slice::from_ref(strategy),
            opts,
        );
        Ok(outcome.results[0])
    }

    /// Multiplier on the hazard model so the race-level SC probability tracks
    /// the override rather than the track's own figure.
    fn sc_scale(&self, override_probability: Option<f64>) -> f64 {
        match override_probability {
            None => 1.0,
            Some(p) => {
                let p = clamp_probability(p);
                if self.track.sc_probability > 0.0 {
                    p / self.track.sc_probability
                } else if p > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Callers must have passed [`Self::check_inputs`] and [`Self::check_options`].
    pub(crate) fn run_unchecked(
        &self,
        profiles: &[CompetitorProfile],
        strategies: &[Strategy],
        opts: &RaceOptions<'_>,
    ) -> RaceOutcome {
        let total = self.track.laps;
        let n = profiles.len();
        let mut rng = TrialRng::from_seed(opts.seed);
        let mut cars = vec![CarState::default(); n];
        let mut lap_times = vec![0.0_f64; n];
        let mut pitted = vec![false; n];
        let mut lap_tyres: Vec<(Compound, u32, f64)> = vec![(Compound::Medium, 0, 0.0); n];
        let mut order: Vec<usize> = Vec::with_capacity(n);
        let mut trace = opts.record_trace.then(Vec::new);

        let sc_scale = self.sc_scale(opts.sc_probability_override);
        let mut weather = 1.0_f64;
        let mut neutral: Option<(Neutralization, u32)> = None;
        let mut restart_pending = false;
        let mut neutral_time_loss = 0.0_f64;

        for lap in 1..=total {
            // 1. injected events
            let mut injected_sc = false;
            let mut injected_vsc = false;
            let mut weather_changed = false;
            for event in opts.events.iter().filter(|e| e.lap() == lap) {
                match event {
                    SimulationEvent::Failure(detail) => {
                        let target = detail
                            .target
                            .as_deref()
                            .and_then(|id| profiles.iter().position(|p| p.id == id));
                        if let Some(idx) = target {
                            if cars[idx].running() {
                                cars[idx].retired_on = Some(lap);
                                if let Some(trace) = trace.as_mut() {
                                    let record = self.dnf_record(
                                        lap,
                                        &profiles[idx],
                                        &strategies[idx],
                                        &cars[idx],
                                    );
                                    trace.push(record);
                                }
                            }
                        }
                    }
                    SimulationEvent::Weather(detail) => {
                        weather = 1.0 + detail.intensity.max(0.0);
                        weather_changed = true;
                    }
                    SimulationEvent::SafetyCar(_) => injected_sc = true,
                    SimulationEvent::VirtualSafetyCar(_) => injected_vsc = true,
                }
            }

            // 3. race order from cumulative time, computed up front because
            // the natural SC draw reads field state from it
            order.clear();
            order.extend((0..n).filter(|&i| cars[i].running()));
            if order.is_empty() {
                break;
            }
            order.sort_by(|&a, &b| cars[a].elapsed.total_cmp(&cars[b].elapsed).then(a.cmp(&b)));

            // 2. neutralization; an SC always wins over a VSC
            let safety_car = Some((
                Neutralization::SafetyCar,
                Neutralization::SafetyCar.duration(),
            ));
            let virtual_safety_car = Some((
                Neutralization::VirtualSafetyCar,
                Neutralization::VirtualSafetyCar.duration(),
            ));
            if injected_sc {
                neutral = safety_car;
            } else if injected_vsc {
                if !matches!(neutral, Some((Neutralization::SafetyCar, _))) {
                    neutral = virtual_safety_car;
                }
            } else if neutral.is_none() {
                let features = self.field_features(profiles, &cars, &order, weather, lap);
                let h = clamp_probability(
                    self.hazard.hazard(&self.track.id, &features, lap, total) * sc_scale,
                );
                let u = rng.uniform();
                if u < h {
                    neutral = safety_car;
                } else if u < h * (1.0 + VSC_SHARE) {
                    neutral = virtual_safety_car;
                }
            }
            let neutral_kind = neutral.map(|(kind, _)| kind);
            let restart = restart_pending && neutral_kind.is_none();
            restart_pending = false;

            // 4. lap times in race order
            let variance_multiplier = match neutral_kind {
                Some(Neutralization::SafetyCar) => SC_VARIANCE_MULTIPLIER,
                Some(Neutralization::VirtualSafetyCar) => VSC_VARIANCE_MULTIPLIER,
                None => 1.0,
            };
            let neutral_loss = match neutral_kind {
                Some(Neutralization::SafetyCar) => SC_LAP_TIME_LOSS,
                Some(Neutralization::VirtualSafetyCar) => VSC_LAP_TIME_LOSS,
                None => 0.0,
            };
            neutral_time_loss += neutral_loss;
            let noise_std = BASE_NOISE_STD
                * variance_multiplier.sqrt()
                * (1.0 + self.track.weather_variance * (weather - 1.0));
            let weather_loss = WEATHER_TIME_LOSS * (weather - 1.0);
            let fuel = fuel_effect(lap, total);

            let mut ahead_start: Option<f64> = None;
            for &idx in &order {
                let profile = &profiles[idx];
                pitted[idx] = false;
                if rng.chance(profile.dnf_rate / f64::from(total)) {
                    cars[idx].retired_on = Some(lap);
                    if let Some(trace) = trace.as_mut() {
                        trace.push(self.dnf_record(lap, profile, &strategies[idx], &cars[idx]));
                    }
                    continue;
                }

                let car = &mut cars[idx];
                let compound = strategies[idx].stints()[car.stint].compound;
                car.tyre_age += 1;
                let deg = tyre_degradation(
                    self.track.tyre_wear.rate(compound),
                    profile.tyre_management,
                    opts.tyre_deg_multiplier,
                    weather,
                    car.tyre_age,
                );
                let noise = rng.normal(0.0, noise_std);
                let in_traffic = neutral_kind.is_none()
                    && ahead_start.is_some_and(|ahead| car.elapsed - ahead < TRAFFIC_GAP_THRESHOLD);
                let blocked =
                    self.track.overtaking_difficulty * (1.0 - 0.5 * profile.racecraft);
                let traffic = if in_traffic && rng.chance(blocked) {
                    TRAFFIC_PENALTY
                } else {
                    0.0
                };
                let restart_delta = if restart {
                    restart_delta(&profile.restart, &mut rng)
                } else {
                    0.0
                };

                let pace = profile.lap_pace(opts.use_ml);
                let lap_time = (pace + deg + fuel + noise + traffic)
                    + (neutral_loss + weather_loss + restart_delta);
                let lap_time = lap_time.max(pace * MIN_LAP_FRACTION);
                ahead_start = Some(car.elapsed);
                car.elapsed += lap_time;
                lap_times[idx] = lap_time;
                lap_tyres[idx] = (compound, car.tyre_age, deg);
            }

            // 5. field compression behind the safety car
            if let Some(kind) = neutral_kind {
                let max_gap = match kind {
                    Neutralization::SafetyCar => SC_MAX_GAP,
                    Neutralization::VirtualSafetyCar => VSC_MAX_GAP,
                };
                let mut car_ahead: Option<f64> = None;
                for &idx in &order {
                    if !cars[idx].running() {
                        continue;
                    }
                    if let Some(ahead) = car_ahead {
                        let floor = ahead + MIN_FOLLOW_GAP;
                        let jitter = rng.uniform_range(0.0, COMPRESSION_JITTER);
                        let cap = (ahead + max_gap + jitter).max(floor);
                        let compressed = cars[idx].elapsed.clamp(floor, cap);
                        lap_times[idx] += compressed - cars[idx].elapsed;
                        cars[idx].elapsed = compressed;
                    }
                    car_ahead = Some(cars[idx].elapsed);
                }
            }

            // 6. pit stops
            for &idx in &order {
                let car = &mut cars[idx];
                if !car.running() || lap >= total {
                    continue;
                }
                if strategies[idx].stints()[car.stint].end_lap == lap {
                    car.elapsed += self.track.pit_loss_seconds;
                    car.stint += 1;
                    car.tyre_age = 0;
                    lap_times[idx] += self.track.pit_loss_seconds;
                    pitted[idx] = true;
                }
            }

            // 7. trace
            if let Some(trace) = trace.as_mut() {
                let mut standings: Vec<usize> =
                    order.iter().copied().filter(|&i| cars[i].running()).collect();
                standings.sort_by(|&a, &b| {
                    cars[a].elapsed.total_cmp(&cars[b].elapsed).then(a.cmp(&b))
                });
                for (pos, &idx) in standings.iter().enumerate() {
                    let profile = &profiles[idx];
                    let (compound, tyre_age, tyre_wear) = lap_tyres[idx];
                    let tag = if pitted[idx] {
                        LapTag::Pit
                    } else {
                        match neutral_kind {
                            Some(Neutralization::SafetyCar) => LapTag::Sc,
                            Some(Neutralization::VirtualSafetyCar) => LapTag::Vsc,
                            None if restart => LapTag::Restart,
                            None if weather_changed => LapTag::Weather,
                            None => LapTag::Green,
                        }
                    };
                    trace.push(LapRecord {
                        lap,
                        competitor_id: profile.id.clone(),
                        lap_time: Some(lap_times[idx]),
                        compound,
                        position: Some(pos as u32 + 1),
                        tyre_age,
                        tyre_wear,
                        fuel_remaining_kg: FUEL_LOAD_KG * f64::from(total - lap) / f64::from(total),
                        pitted: pitted[idx],
                        tag,
                    });
                }
            }

            // SC/VSC countdown; the lap after the last neutralized lap is a restart
            if let Some((kind, remaining)) = neutral {
                if remaining <= 1 {
                    neutral = None;
                    restart_pending = true;
                } else {
                    neutral = Some((kind, remaining - 1));
                }
            }
        }

        let results = cars
            .iter()
            .map(|car| match car.retired_on {
                Some(lap) => FinishResult::Dnf { lap },
                None => FinishResult::Finished { time: car.elapsed },
            })
            .collect();
        RaceOutcome {
            results,
            neutral_time_loss,
            trace,
        }
    }

    fn field_features(
        &self,
        profiles: &[CompetitorProfile],
        cars: &[CarState],
        order: &[usize],
        weather: f64,
        lap: u32,
    ) -> HazardFeatures {
        let running = order.len() as f64;
        let close_gaps = order
            .windows(2)
            .filter(|w| cars[w[1]].elapsed - cars[w[0]].elapsed < 1.0)
            .count();
        let gap_compression = if order.len() > 1 {
            close_gaps as f64 / (running - 1.0)
        } else {
            0.0
        };

        let mean_age = order.iter().map(|&i| f64::from(cars[i].tyre_age)).sum::<f64>() / running;
        let tyre_age_variance = order
            .iter()
            .map(|&i| (f64::from(cars[i].tyre_age) - mean_age).powi(2))
            .sum::<f64>()
            / running
            / 100.0;

        let retired = cars.len() as f64 - running;
        let mean_aggression =
            order.iter().map(|&i| profiles[i].restart.aggression).sum::<f64>() / running;

        let lapped_traffic_density = match order.first() {
            Some(&leader) if lap > 1 => {
                let leader_lap = cars[leader].elapsed / f64::from(lap - 1);
                let lapped = order
                    .iter()
                    .filter(|&&i| cars[i].elapsed - cars[leader].elapsed > leader_lap)
                    .count();
                lapped as f64 / running
            }
            _ => 0.0,
        };

        HazardFeatures {
            gap_compression,
            tyre_age_variance,
            weather_intensity: weather - 1.0,
            incident_density: retired / cars.len() as f64,
            mean_aggression,
            lapped_traffic_density,
        }
    }

    fn dnf_record(
        &self,
        lap: u32,
        profile: &CompetitorProfile,
        strategy: &Strategy,
        car: &CarState,
    ) -> LapRecord {
        LapRecord {
            lap,
            competitor_id: profile.id.clone(),
            lap_time: None,
            compound: strategy.stints()[car.stint].compound,
            position: None,
            tyre_age: car.tyre_age,
            tyre_wear: 0.0,
            fuel_remaining_kg: FUEL_LOAD_KG * f64::from(self.track.laps - lap)
                / f64::from(self.track.laps),
            pitted: false,
            tag: LapTag::Dnf,
        }
    }
}

/// Time delta on the first green lap after a neutralization. Negative when an
/// aggressive restart pays off.
fn restart_delta(skill: &RestartSkill, rng: &mut TrialRng) -> f64 {
    let reaction = rng.normal(skill.reaction_mean, skill.reaction_std).max(0.0);
    let warmup = skill.tyre_warmup.clamp(0.0, 1.0) * RESTART_WARMUP_SECONDS;
    let attack = skill.aggression.clamp(0.0, 1.0);
    let gain = if rng.chance(attack * (1.0 - 0.5 * skill.risk_penalty.clamp(0.0, 1.0))) {
        -RESTART_AGGRESSION_GAIN * attack
    } else {
        0.0
    };
    reaction + warmup + gain
}
