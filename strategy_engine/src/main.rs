use anyhow::Context;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use strategy_engine::{
    default_roster, load_roster, stress_test, EngineConfig, RequestOptions, SimulationEngine,
    TrackCatalog,
};

// Reads one request from REQUEST_PATH (or an empty option map), runs it on
// TRACK_ID and prints the response as JSON. TRACKS_PATH adds tracks to the
// built-in catalog. STRESS=1 appends a stress report.
fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let track_id = std::env::var("TRACK_ID").unwrap_or_else(|_| "bahrain".to_string());

    let config = match std::env::var("CONFIG_PATH") {
        Ok(path) => {
            EngineConfig::load(&path).with_context(|| format!("loading engine config {}", path))?
        }
        Err(_) => EngineConfig::default(),
    };
    let tracks = match std::env::var("TRACKS_PATH") {
        Ok(path) => {
            TrackCatalog::load_extra(&path).with_context(|| format!("loading tracks {}", path))?
        }
        Err(_) => TrackCatalog::builtin(),
    };
    let roster = match std::env::var("ROSTER_PATH") {
        Ok(path) => load_roster(&path).with_context(|| format!("loading roster {}", path))?,
        Err(_) => default_roster(),
    };
    let options = match std::env::var("REQUEST_PATH") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading request {}", path))?;
            RequestOptions::from_json(&raw)?
        }
        Err(_) => RequestOptions::default(),
    };
    let stress = std::env::var("STRESS").ok().as_deref() == Some("1");

    tracing::debug!("tracks: {}", tracks.ids().collect::<Vec<_>>().join(", "));
    let engine = SimulationEngine::new(tracks, roster, config)?;
    tracing::info!(
        "race_sim track={} roster={} model={}",
        track_id,
        engine.roster().len(),
        engine.config().model_version
    );

    let request = options.into_request(track_id);
    let response = engine.run(&request)?;

    let out = if stress {
        let report = stress_test(&engine, &request, &response)?;
        json!({ "simulation": response, "stress_test": report })
    } else {
        serde_json::to_value(&response)?
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
