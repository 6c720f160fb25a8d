use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::types::{CompetitorProfile, RestartSkill, Track, TyreWear};

/// Track lookup keyed by id. Unknown ids are rejected unless the caller asks
/// for the fallback explicitly.
#[derive(Debug, Clone)]
pub struct TrackCatalog {
    tracks: BTreeMap<String, Track>,
}

impl Default for TrackCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TrackCatalog {
    pub fn builtin() -> Self {
        let wear = TyreWear::default();
        // id, name, laps, km, pit loss, P(SC), wear scale, overtaking, weather variance
        let rows: [(&str, &str, u32, f64, f64, f64, f64, f64, f64); 10] = [
            ("bahrain", "Bahrain International Circuit", 57, 5.412, 23.1, 0.35, 1.25, 0.35, 0.05),
            ("jeddah", "Jeddah Corniche Circuit", 50, 6.174, 20.5, 0.65, 0.85, 0.40, 0.05),
            ("melbourne", "Albert Park", 58, 5.278, 19.8, 0.55, 0.90, 0.55, 0.25),
            ("monaco", "Circuit de Monaco", 78, 3.337, 19.5, 0.60, 0.70, 0.95, 0.20),
            ("silverstone", "Silverstone Circuit", 52, 5.891, 20.2, 0.40, 1.15, 0.40, 0.45),
            ("spa", "Circuit de Spa-Francorchamps", 44, 7.004, 21.0, 0.45, 1.00, 0.30, 0.60),
            ("monza", "Autodromo Nazionale Monza", 53, 5.793, 24.0, 0.35, 0.85, 0.25, 0.15),
            ("singapore", "Marina Bay Street Circuit", 62, 4.940, 28.5, 0.85, 1.05, 0.80, 0.35),
            ("suzuka", "Suzuka Circuit", 53, 5.807, 22.5, 0.35, 1.20, 0.60, 0.35),
            ("interlagos", "Autodromo Jose Carlos Pace", 71, 4.309, 21.5, 0.55, 1.00, 0.35, 0.55),
        ];

        let tracks = rows
            .into_iter()
            .map(|(id, name, laps, km, pit, sc, wear_scale, overtaking, weather)| {
                let track = Track {
                    id: id.to_string(),
                    name: name.to_string(),
                    laps,
                    lap_length_km: km,
                    pit_loss_seconds: pit,
                    sc_probability: sc,
                    tyre_wear: wear.scaled(wear_scale),
                    overtaking_difficulty: overtaking,
                    weather_variance: weather,
                };
                (id.to_string(), track)
            })
            .collect();
        Self { tracks }
    }

    /// Built-in catalog extended with a JSON array of tracks; entries with an
    /// existing id replace the built-in record.
    pub fn load_extra(path: &str) -> EngineResult<Self> {
        let data = fs::read_to_string(Path::new(path)).map_err(|source| EngineError::Io {
            path: path.to_string(),
            source,
        })?;
        let extra: Vec<Track> = serde_json::from_str(&data)?;
        let mut catalog = Self::builtin();
        for track in extra {
            catalog.insert(track)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, track: Track) -> EngineResult<()> {
        track.validate()?;
        self.tracks.insert(track.id.clone(), track);
        Ok(())
    }

    pub fn get(&self, id: &str) -> EngineResult<&Track> {
        self.tracks
            .get(id)
            .ok_or_else(|| EngineError::UnknownTrack(id.to_string()))
    }

    /// Generic 55-lap circuit carrying the requested id.
    pub fn get_or_default(&self, id: &str) -> Track {
        self.tracks.get(id).cloned().unwrap_or_else(|| Track {
            id: id.to_string(),
            name: format!("Generic circuit ({id})"),
            laps: 55,
            lap_length_km: 5.3,
            pit_loss_seconds: 22.0,
            sc_probability: 0.45,
            tyre_wear: TyreWear::default(),
            overtaking_difficulty: 0.5,
            weather_variance: 0.3,
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }
}

fn profile(
    id: &str,
    team: &str,
    base_pace: f64,
    tyre_management: f64,
    racecraft: f64,
    dnf_rate: f64,
    aggression: f64,
    ml_pace_offset: f64,
) -> CompetitorProfile {
    CompetitorProfile {
        id: id.to_string(),
        team: team.to_string(),
        base_pace,
        tyre_management,
        racecraft,
        dnf_rate,
        restart: RestartSkill {
            aggression,
            ..RestartSkill::default()
        },
        ml_pace_offset,
    }
}

/// Four front-running cars; base paces are relative to a 91 s reference lap.
pub fn default_roster() -> Vec<CompetitorProfile> {
    vec![
        profile("VER", "Red Bull", 91.00, 0.85, 0.90, 0.05, 0.70, 0.03),
        profile("NOR", "McLaren", 91.06, 0.80, 0.85, 0.04, 0.60, -0.03),
        profile("LEC", "Ferrari", 91.12, 0.70, 0.85, 0.06, 0.65, -0.01),
        profile("HAM", "Ferrari", 91.20, 0.90, 0.95, 0.04, 0.45, 0.02),
    ]
}

pub fn full_roster() -> Vec<CompetitorProfile> {
    let mut roster = default_roster();
    roster.extend([
        profile("PIA", "McLaren", 91.10, 0.75, 0.80, 0.05, 0.55, -0.02),
        profile("RUS", "Mercedes", 91.22, 0.75, 0.80, 0.05, 0.55, 0.00),
        profile("SAI", "Williams", 91.55, 0.80, 0.85, 0.06, 0.50, 0.01),
        profile("ALO", "Aston Martin", 91.60, 0.90, 0.95, 0.06, 0.60, 0.02),
        profile("GAS", "Alpine", 91.80, 0.65, 0.75, 0.07, 0.65, 0.00),
        profile("HUL", "Sauber", 91.90, 0.70, 0.70, 0.07, 0.40, -0.01),
    ]);
    roster
}

pub fn load_roster(path: &str) -> EngineResult<Vec<CompetitorProfile>> {
    let data = fs::read_to_string(Path::new(path)).map_err(|source| EngineError::Io {
        path: path.to_string(),
        source,
    })?;
    let roster: Vec<CompetitorProfile> = serde_json::from_str(&data)?;
    for p in &roster {
        p.validate()?;
    }
    Ok(roster)
}
