/// End-to-end runs through the public engine API.
///
/// Run with: cargo test --test integration_tests -- --nocapture

use strategy_engine::{
    default_roster, stress_test, Compound, EngineConfig, HazardFeatures, RaceOptions, RaceSimulator,
    SimulationEngine, SimulationEvent, SimulationParams, SimulationRequest, Strategy, StrategyStint,
    TrackCatalog, Verdict,
};

fn light_config() -> EngineConfig {
    EngineConfig {
        optimizer_iterations: 30,
        max_candidates: 16,
        stress_iterations: 100,
        ..EngineConfig::default()
    }
}

fn engine(config: EngineConfig) -> SimulationEngine {
    SimulationEngine::new(TrackCatalog::builtin(), default_roster(), config).unwrap()
}

#[test]
fn test_bahrain_probability_conservation() {
    println!("\n=== Test: Bahrain 57 laps, seed 42, 5000 iterations ===");
    let e = engine(EngineConfig::default());
    let track = e.tracks().get("bahrain").unwrap();
    assert_eq!(track.laps, 57);
    assert_eq!(track.pit_loss_seconds, 23.1);

    let request = SimulationRequest::new("bahrain", 5000, Some(42));
    let first = e.run(&request).unwrap();

    let total: f64 = first.win_probability.values().sum();
    println!("✓ win probability mass {:.4}", total);
    assert!((total - 1.0).abs() <= 0.01, "win mass {} not within 0.01 of 1", total);

    for (id, risk) in &first.dnf_risk {
        assert!((0.0..=1.0).contains(risk), "{} dnf_risk {}", id, risk);
    }
    for (id, podium) in &first.podium_probability {
        assert!(*podium >= first.win_probability[id]);
    }
    assert_eq!(first.win_probability.len(), 4);
    assert_eq!(first.metadata.effective_seed, 42);
    assert_eq!(first.metadata.seed, Some(42));
    assert_eq!(first.strategy.total_laps(), 57);

    let again = e.run(&request).unwrap();
    assert_eq!(first.win_probability, again.win_probability);
    assert_eq!(first.strategy.name(), again.strategy.name());
    println!("✓ seed 42 reproduces {:?}", first.win_probability);
}

#[test]
fn test_seed_changes_results() {
    println!("\n=== Test: Different seeds diverge ===");
    let e = engine(light_config());
    let a = e.run(&SimulationRequest::new("spa", 500, Some(1))).unwrap();
    let b = e.run(&SimulationRequest::new("spa", 500, Some(2))).unwrap();
    assert_ne!(a.win_probability, b.win_probability);
    println!("✓ seed 1 {:?} vs seed 2 {:?}", a.win_probability, b.win_probability);
}

#[test]
fn test_use_ml_impact_is_bounded() {
    println!("\n=== Test: use_ml shifts probabilities within bounds ===");
    let e = engine(light_config());
    let physics = SimulationRequest::new("bahrain", 2000, Some(42));
    let mut ml = physics.clone();
    ml.use_ml = true;

    let a = e.run(&physics).unwrap();
    let b = e.run(&ml).unwrap();
    let mut total_shift = 0.0;
    for (id, p) in &a.win_probability {
        let shift = (b.win_probability[id] - p).abs();
        assert!(shift <= 0.20, "{} moved {}", id, shift);
        total_shift += shift;
    }
    println!("✓ total absolute shift {:.4}", total_shift);
    assert!(total_shift > 0.01);
}

#[test]
fn test_causal_attribution_needs_events_and_samples() {
    println!("\n=== Test: Causal attribution gating ===");
    let e = engine(light_config());
    let events = vec![SimulationEvent::safety_car(20), SimulationEvent::failure(31, "NOR")];

    let big = e
        .run(&SimulationRequest::new("bahrain", 500, Some(5)).with_events(events.clone()))
        .unwrap();
    assert_eq!(big.causal_attribution.len(), 1);
    let attribution = &big.causal_attribution[0];
    assert_eq!(attribution.event_signature, "SC@L20+FAILURE@L31[NOR]");
    assert_eq!(attribution.competitor_id, "VER");
    assert_eq!(attribution.with_events_win_probability, big.win_probability["VER"]);
    let expected = attribution.with_events_win_probability - attribution.baseline_win_probability;
    assert!((attribution.impact - expected).abs() < 1e-12);
    assert_eq!(big.dnf_risk["NOR"], 1.0);
    assert!(attribution.podium_impact.is_finite());
    println!("✓ impact {:+.4}", attribution.impact);

    let small = e
        .run(&SimulationRequest::new("bahrain", 499, Some(5)).with_events(events))
        .unwrap();
    assert!(small.causal_attribution.is_empty());

    let quiet = e.run(&SimulationRequest::new("bahrain", 500, Some(5))).unwrap();
    assert!(quiet.causal_attribution.is_empty());
    println!("✓ attribution skipped below 500 iterations and without events");
}

#[test]
fn test_stress_test_verdict_matches_flips() {
    println!("\n=== Test: Stress test on an event-free baseline ===");
    let e = engine(light_config());
    let request = SimulationRequest::new("monza", 200, Some(42));
    let baseline = e.run(&request).unwrap();
    let report = stress_test(&e, &request, &baseline).unwrap();

    assert_eq!(report.tests_run, 13);
    assert_eq!(report.outcomes.len(), 13);
    assert_eq!(report.iterations, 100);
    assert_eq!(report.seed, 42);
    assert_eq!(report.baseline_strategy, baseline.strategy.name());
    assert_eq!(report.verdict == Verdict::Robust, report.flip_count == 0);
    assert_eq!(report.flip_causes.len(), report.flip_count.min(3));
    assert_eq!(
        report.flip_count,
        report.outcomes.iter().filter(|o| o.flipped).count()
    );
    println!(
        "✓ verdict {:?} flips {}/{} causes {:?}",
        report.verdict, report.flip_count, report.tests_run, report.flip_causes
    );
}

#[test]
fn test_unseeded_stress_reuses_effective_seed() {
    println!("\n=== Test: Unseeded baseline is replayable ===");
    let e = engine(light_config());
    let request = SimulationRequest::new("suzuka", 150, None);
    let baseline = e.run(&request).unwrap();
    let report = stress_test(&e, &request, &baseline).unwrap();
    assert_eq!(report.seed, baseline.metadata.effective_seed);
    println!("✓ stress seed {}", report.seed);
}

#[test]
fn test_strategy_comparison() {
    println!("\n=== Test: A/B strategy comparison ===");
    let e = engine(light_config());
    let one_stop = Strategy::default_for_race(57).unwrap();
    let two_stop = Strategy::for_race(
        vec![
            StrategyStint::new(Compound::Soft, 18),
            StrategyStint::new(Compound::Medium, 38),
            StrategyStint::new(Compound::Hard, 57),
        ],
        57,
    )
    .unwrap();
    assert_eq!(two_stop.name(), "S-M-H@18/38");

    let request = SimulationRequest::new("bahrain", 400, Some(8)).with_params(SimulationParams {
        focal_competitor: Some("HAM".into()),
        ..SimulationParams::default()
    });
    let report = e.run_comparison(&request, &[one_stop, two_stop]).unwrap();
    assert_eq!(report.focal_competitor, "HAM");
    assert_eq!(report.entries.len(), 2);
    for entry in &report.entries {
        assert!((0.0..=1.0).contains(&entry.win_probability));
        assert!(entry.podium_probability >= entry.win_probability);
        let pace = entry.pace.unwrap();
        assert!(pace.p05 <= pace.p50 && pace.p50 <= pace.p95);
        println!(
            "✓ {} win {:.3} podium {:.3} p50 {:.1}",
            entry.strategy.name(),
            entry.win_probability,
            entry.podium_probability,
            pace.p50
        );
    }
}

#[test]
fn test_trace_is_reproducible() {
    println!("\n=== Test: Lap trace determinism ===");
    let e = engine(light_config());
    let track = e.tracks().get("monaco").unwrap();
    let sim = RaceSimulator::new(track, e.hazard());
    let strategies = vec![Strategy::default_for_race(track.laps).unwrap(); 4];
    let events = [SimulationEvent::weather(10, 0.5)];
    let mut opts = RaceOptions::new(99).with_events(&events);
    opts.record_trace = true;

    let a = sim.simulate(e.roster(), &strategies, &opts).unwrap();
    let b = sim.simulate(e.roster(), &strategies, &opts).unwrap();
    assert_eq!(a, b);
    let trace = a.trace.unwrap();
    assert!(!trace.is_empty());
    assert!(trace.iter().any(|r| r.pitted));
    println!("✓ {} identical trace records", trace.len());
}

#[test]
fn test_hazard_forecast_window() {
    println!("\n=== Test: SC forecast ===");
    let e = engine(light_config());
    let features = HazardFeatures {
        gap_compression: 0.6,
        weather_intensity: 0.8,
        ..HazardFeatures::default()
    };
    let forecast = e.hazard().predict_next_n_laps("singapore", &features, 10, 5, 62);
    assert_eq!(forecast.window_laps, 5);
    assert!((0.0..=1.0).contains(&forecast.sc_probability));
    assert!((forecast.vsc_probability - 0.4 * forecast.sc_probability).abs() < 1e-12);
    assert_eq!(forecast.top_factors.len(), 2);
    println!(
        "✓ sc {:.3} vsc {:.3} confidence {:.2}",
        forecast.sc_probability, forecast.vsc_probability, forecast.confidence
    );
}
