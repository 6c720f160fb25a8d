use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Request rejections. Raised before any trial executes; DNFs and safety cars
/// are simulated outcomes and never show up here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown track id '{0}'")]
    UnknownTrack(String),

    #[error("competitor roster is empty")]
    EmptyRoster,

    #[error("iteration count must be positive, got {0}")]
    InvalidIterations(u32),

    #[error("malformed strategy '{name}': {reason}")]
    MalformedStrategy { name: String, reason: String },

    #[error("strategy '{name}' covers {strategy_laps} laps but the race has {race_laps}")]
    StrategyLapMismatch {
        name: String,
        strategy_laps: u32,
        race_laps: u32,
    },

    #[error("strategy count {strategies} does not match competitor count {competitors}")]
    StrategyCountMismatch { strategies: usize, competitors: usize },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("unknown competitor '{0}'")]
    UnknownCompetitor(String),

    #[error("competitor '{0}' appears twice in the roster")]
    DuplicateCompetitor(String),

    #[error("invalid parameter {name}={value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("no strategy candidate produced a finished race")]
    NoViableStrategy,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedStrategy {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
