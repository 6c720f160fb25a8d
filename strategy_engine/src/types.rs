use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compound {
    Soft,
    Medium,
    Hard,
    Intermediate,
    Wet,
}

impl Compound {
    pub const DRY: [Compound; 3] = [Compound::Soft, Compound::Medium, Compound::Hard];

    pub fn code(self) -> char {
        match self {
            Compound::Soft => 'S',
            Compound::Medium => 'M',
            Compound::Hard => 'H',
            Compound::Intermediate => 'I',
            Compound::Wet => 'W',
        }
    }
}

/// Per-lap wear rate for each compound, in seconds at one lap of tyre age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TyreWear {
    pub soft: f64,
    pub medium: f64,
    pub hard: f64,
    pub intermediate: f64,
    pub wet: f64,
}

impl TyreWear {
    pub fn rate(&self, compound: Compound) -> f64 {
        match compound {
            Compound::Soft => self.soft,
            Compound::Medium => self.medium,
            Compound::Hard => self.hard,
            Compound::Intermediate => self.intermediate,
            Compound::Wet => self.wet,
        }
    }

    /// Uniformly scaled copy, used by the catalog for high-abrasion circuits.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            soft: self.soft * factor,
            medium: self.medium * factor,
            hard: self.hard * factor,
            intermediate: self.intermediate * factor,
            wet: self.wet * factor,
        }
    }
}

impl Default for TyreWear {
    fn default() -> Self {
        Self {
            soft: 0.045,
            medium: 0.028,
            hard: 0.018,
            intermediate: 0.035,
            wet: 0.030,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub laps: u32,
    pub lap_length_km: f64,
    pub pit_loss_seconds: f64,
    /// Race-distance probability of at least one safety car.
    pub sc_probability: f64,
    #[serde(default)]
    pub tyre_wear: TyreWear,
    /// 0 = trivial to pass, 1 = processional.
    pub overtaking_difficulty: f64,
    pub weather_variance: f64,
}

impl Track {
    pub fn validate(&self) -> EngineResult<()> {
        if self.laps == 0 {
            return Err(EngineError::InvalidParameter {
                name: "laps",
                value: 0.0,
            });
        }
        if !self.pit_loss_seconds.is_finite() || self.pit_loss_seconds < 0.0 {
            return Err(EngineError::InvalidParameter {
                name: "pit_loss_seconds",
                value: self.pit_loss_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.sc_probability) {
            return Err(EngineError::InvalidParameter {
                name: "sc_probability",
                value: self.sc_probability,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSkill {
    /// Seconds lost reacting to the green flag.
    pub reaction_mean: f64,
    pub reaction_std: f64,
    pub aggression: f64,
    pub risk_penalty: f64,
    pub tyre_warmup: f64,
}

impl Default for RestartSkill {
    fn default() -> Self {
        Self {
            reaction_mean: 0.25,
            reaction_std: 0.08,
            aggression: 0.5,
            risk_penalty: 0.3,
            tyre_warmup: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorProfile {
    pub id: String,
    #[serde(default)]
    pub team: String,
    /// Clean-air lap time in seconds on fresh tyres and empty tank.
    pub base_pace: f64,
    /// 0..1, higher stretches tyres further.
    pub tyre_management: f64,
    /// 0..1, higher loses less time in traffic.
    pub racecraft: f64,
    /// Probability of retiring over a full race distance.
    pub dnf_rate: f64,
    #[serde(default)]
    pub restart: RestartSkill,
    /// Pace correction supplied by an external model, seconds per lap.
    #[serde(default)]
    pub ml_pace_offset: f64,
}

impl CompetitorProfile {
    pub fn lap_pace(&self, use_ml: bool) -> f64 {
        if use_ml {
            self.base_pace + self.ml_pace_offset
        } else {
            self.base_pace
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.base_pace.is_finite() || self.base_pace <= 0.0 {
            return Err(EngineError::InvalidParameter {
                name: "base_pace",
                value: self.base_pace,
            });
        }
        if !(0.0..=1.0).contains(&self.dnf_rate) {
            return Err(EngineError::InvalidParameter {
                name: "dnf_rate",
                value: self.dnf_rate,
            });
        }
        if !self.ml_pace_offset.is_finite() {
            return Err(EngineError::InvalidParameter {
                name: "ml_pace_offset",
                value: self.ml_pace_offset,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStint {
    pub compound: Compound,
    pub end_lap: u32,
}

impl StrategyStint {
    pub fn new(compound: Compound, end_lap: u32) -> Self {
        Self { compound, end_lap }
    }
}

/// Filled in by the optimizer; absent on strategies that were never evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub trials: u32,
    pub finished_trials: u32,
    pub mean_time: f64,
    pub time_variance: f64,
    pub dnf_rate: f64,
    pub expected_points: f64,
    pub position_variance: f64,
    pub utility: f64,
    /// Mean green-flag time (SC/VSC loss removed) above the fastest
    /// candidate's green-flag median.
    pub expected_time_loss: f64,
    pub risk_score: f64,
    /// In (0, 1]; falls as green-flag time spread grows relative to one position.
    pub robustness: f64,
}

/// Ordered stints partitioning laps 1..=total_laps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StrategyDef")]
pub struct Strategy {
    name: String,
    stints: Vec<StrategyStint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    evaluation: Option<StrategyEvaluation>,
}

#[derive(Deserialize)]
struct StrategyDef {
    name: String,
    stints: Vec<StrategyStint>,
}

impl TryFrom<StrategyDef> for Strategy {
    type Error = EngineError;

    fn try_from(def: StrategyDef) -> Result<Self, Self::Error> {
        Strategy::new(def.name, def.stints)
    }
}

impl Strategy {
    /// Stint end laps must be strictly increasing from lap 1, which makes the
    /// stints contiguous; race length is checked separately by [`Strategy::check_laps`].
    pub fn new(name: impl Into<String>, stints: Vec<StrategyStint>) -> EngineResult<Self> {
        let name = name.into();
        if stints.is_empty() {
            return Err(EngineError::malformed(name, "no stints"));
        }
        let mut prev_end = 0;
        for stint in &stints {
            if stint.end_lap <= prev_end {
                return Err(EngineError::malformed(
                    name,
                    format!(
                        "stint on {:?} ends at lap {} but previous stint ended at {}",
                        stint.compound, stint.end_lap, prev_end
                    ),
                ));
            }
            prev_end = stint.end_lap;
        }
        Ok(Self {
            name,
            stints,
            evaluation: None,
        })
    }

    /// Builds a strategy named after its compounds and pit laps, e.g. `M-H@26`.
    pub fn for_race(stints: Vec<StrategyStint>, total_laps: u32) -> EngineResult<Self> {
        let strategy = Self::new(Self::label(&stints), stints)?;
        strategy.check_laps(total_laps)?;
        Ok(strategy)
    }

    /// Medium to hard, stopping just before half distance.
    pub fn default_for_race(total_laps: u32) -> EngineResult<Self> {
        if total_laps < 2 {
            let stint = StrategyStint::new(Compound::Medium, total_laps);
            return Self::for_race(vec![stint], total_laps);
        }
        let pit_lap = ((f64::from(total_laps) * 0.45).round() as u32).clamp(1, total_laps - 1);
        Self::for_race(
            vec![
                StrategyStint::new(Compound::Medium, pit_lap),
                StrategyStint::new(Compound::Hard, total_laps),
            ],
            total_laps,
        )
    }

    pub fn label(stints: &[StrategyStint]) -> String {
        let compounds: Vec<String> = stints.iter().map(|s| s.compound.code().to_string()).collect();
        let pits: Vec<String> = stints
            .iter()
            .take(stints.len().saturating_sub(1))
            .map(|s| s.end_lap.to_string())
            .collect();
        if pits.is_empty() {
            compounds.join("-")
        } else {
            format!("{}@{}", compounds.join("-"), pits.join("/"))
        }
    }

    pub fn check_laps(&self, total_laps: u32) -> EngineResult<()> {
        let strategy_laps = self.total_laps();
        if strategy_laps != total_laps {
            return Err(EngineError::StrategyLapMismatch {
                name: self.name.clone(),
                strategy_laps,
                race_laps: total_laps,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stints(&self) -> &[StrategyStint] {
        &self.stints
    }

    pub fn total_laps(&self) -> u32 {
        self.stints.last().map_or(0, |s| s.end_lap)
    }

    pub fn stop_count(&self) -> usize {
        self.stints.len() - 1
    }

    pub fn evaluation(&self) -> Option<&StrategyEvaluation> {
        self.evaluation.as_ref()
    }

    pub fn with_evaluation(mut self, evaluation: StrategyEvaluation) -> Self {
        self.evaluation = Some(evaluation);
        self
    }
}

fn default_intensity() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    pub lap: u32,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_intensity")]
    pub intensity: f64,
}

/// Exogenous race event injected by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SimulationEvent {
    #[serde(rename = "FAILURE")]
    Failure(EventDetail),
    #[serde(rename = "WEATHER")]
    Weather(EventDetail),
    #[serde(rename = "SC")]
    SafetyCar(EventDetail),
    #[serde(rename = "VSC")]
    VirtualSafetyCar(EventDetail),
}

impl SimulationEvent {
    pub fn failure(lap: u32, target: impl Into<String>) -> Self {
        Self::Failure(EventDetail {
            lap,
            target: Some(target.into()),
            intensity: 1.0,
        })
    }

    pub fn weather(lap: u32, intensity: f64) -> Self {
        Self::Weather(EventDetail {
            lap,
            target: None,
            intensity,
        })
    }

    pub fn safety_car(lap: u32) -> Self {
        Self::SafetyCar(EventDetail {
            lap,
            target: None,
            intensity: 1.0,
        })
    }

    pub fn virtual_safety_car(lap: u32) -> Self {
        Self::VirtualSafetyCar(EventDetail {
            lap,
            target: None,
            intensity: 1.0,
        })
    }

    pub fn detail(&self) -> &EventDetail {
        match self {
            Self::Failure(d)
            | Self::Weather(d)
            | Self::SafetyCar(d)
            | Self::VirtualSafetyCar(d) => d,
        }
    }

    pub fn lap(&self) -> u32 {
        self.detail().lap
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failure(_) => "FAILURE",
            Self::Weather(_) => "WEATHER",
            Self::SafetyCar(_) => "SC",
            Self::VirtualSafetyCar(_) => "VSC",
        }
    }

    /// Stable tag such as `FAILURE@L12[VER]` or `SC@L30`.
    pub fn signature(&self) -> String {
        let detail = self.detail();
        match &detail.target {
            Some(target) if matches!(self, Self::Failure(_)) => {
                format!("{}@L{}[{}]", self.kind(), detail.lap, target)
            }
            _ => format!("{}@L{}", self.kind(), detail.lap),
        }
    }

    pub fn validate(&self, total_laps: u32, roster: &[CompetitorProfile]) -> EngineResult<()> {
        let detail = self.detail();
        if detail.lap == 0 || detail.lap > total_laps {
            return Err(EngineError::InvalidEvent(format!(
                "{} on lap {} outside race of {} laps",
                self.kind(),
                detail.lap,
                total_laps
            )));
        }
        if !detail.intensity.is_finite() || detail.intensity < 0.0 {
            return Err(EngineError::InvalidEvent(format!(
                "{} has intensity {}",
                self.signature(),
                detail.intensity
            )));
        }
        if let Self::Failure(detail) = self {
            let target = detail.target.as_deref().ok_or_else(|| {
                EngineError::InvalidEvent(format!("FAILURE on lap {} has no target", detail.lap))
            })?;
            if !roster.iter().any(|p| p.id == target) {
                return Err(EngineError::UnknownCompetitor(target.to_string()));
            }
        }
        Ok(())
    }
}
