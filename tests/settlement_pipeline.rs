//! End-to-end: score, persist a model, decide on the model path, backtest,
//! and gate a calibration on held-out coverage.

use chrono::{Duration, TimeZone, Utc};
use flip_backend::calibration::{cross_validate_held_out, cross_validate_in_sample, CoverageKind};
use flip_backend::features::FeatureBuilder;
use flip_backend::model_store::{ModelMetadata, ModelStore};
use flip_backend::models::TOKEN;
use flip_backend::predictor::{PredictorKind, PredictorRegistry};
use flip_backend::{
    Decision, EngineConfig, EngineError, OutcomeRecord, PolicyThresholds, RedemptionContext,
    ScorerParams, SettlementEngine,
};

const TREE_BLOB: &[u8] = br#"{
    "feature_names": ["price_volatility", "agent_success_rate"],
    "base_score": 6.0,
    "trees": [
        {"nodes": [
            {"type": "split", "feature": "price_volatility", "threshold": 0.02, "left": 1, "right": 2},
            {"type": "leaf", "value": 2.0},
            {"type": "leaf", "value": -4.0}
        ]}
    ]
}"#;

fn contexts() -> Vec<RedemptionContext> {
    (0..40)
        .map(|i| {
            let volatility = (i % 8) * 5_000;
            let amount = (50 + (i as u128 % 5) * 4_000) * TOKEN;
            let stake = (80_000 + (i as u128 % 4) * 40_000) * TOKEN;
            RedemptionContext::new(volatility, amount, 950_000 + (i % 5) * 10_000, stake, (i % 24) as u8)
                .unwrap()
        })
        .collect()
}

#[test]
fn deterministic_decisions_feed_the_backtest() {
    let config = EngineConfig::default();
    let engine =
        SettlementEngine::deterministic(config.scorer, config.thresholds).unwrap();
    let base = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

    let mut predictions = Vec::new();
    let mut outcomes = Vec::new();
    for (i, ctx) in contexts().iter().enumerate() {
        let features = FeatureBuilder::from_context(ctx).build();
        let decision = engine.evaluate(ctx, &features).unwrap();
        let id = format!("redemption-{}", i);
        predictions.push(decision.to_prediction_record(&id, Some(base + Duration::hours(i as i64))));
        outcomes.push(OutcomeRecord::new(&id, ctx.price_volatility < 30_000));
    }

    let harness = config.harness().unwrap();
    let metrics = harness.backtest(&predictions, &outcomes).unwrap();
    assert_eq!(metrics.counts.total, 40);
    assert!(metrics.provisional_count > 0);
    assert!((0.0..=1.0).contains(&metrics.accuracy));

    let again = harness.backtest(&predictions, &outcomes).unwrap();
    assert_eq!(metrics, again);

    let cv = harness.cross_validate(&predictions, &outcomes, 5).unwrap();
    assert_eq!(cv.folds.iter().map(|f| f.counts.total).sum::<usize>(), 40);

    let oos = harness
        .out_of_sample_test(&predictions, &outcomes, Some(base + Duration::hours(29)))
        .unwrap();
    assert_eq!(oos.metrics.counts.total, 10);
}

#[test]
fn stored_model_drives_model_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = ModelStore::new(dir.path().join("models.db")).unwrap();

    let mut metadata = ModelMetadata::new("coston2", 5_000);
    metadata.features = vec!["price_volatility".into(), "agent_success_rate".into()];
    let version = store
        .save("flip_xgboost", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata)
        .unwrap();
    assert_eq!(store.latest("flip_xgboost").unwrap().unwrap().version, version);

    let predictor = store.load_predictor(&version).unwrap();
    let registry = PredictorRegistry::builder().register(predictor).build();

    let calibration = flip_backend::CalibrationModel {
        quantile_threshold: 0.0005,
        alpha: 0.003,
        n_calibration: 1_000,
        method: Default::default(),
    };
    let engine = SettlementEngine::with_model(
        &registry,
        PredictorKind::GradientBoostedTree,
        calibration,
        PolicyThresholds::default(),
    )
    .unwrap();

    let calm = RedemptionContext::new(10_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10).unwrap();
    let d = engine
        .evaluate(&calm, &FeatureBuilder::from_context(&calm).build())
        .unwrap();
    // margin 8.0
    assert_eq!(d.decision, Decision::ProvisionalSettle);

    let rough = RedemptionContext::new(40_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10).unwrap();
    let d = engine
        .evaluate(&rough, &FeatureBuilder::from_context(&rough).build())
        .unwrap();
    // margin 2.0, p ~ 0.88
    assert_eq!(d.decision, Decision::QueueFdc);

    assert!(matches!(
        SettlementEngine::with_model(
            &registry,
            PredictorKind::Ensemble,
            calibration,
            PolicyThresholds::default()
        ),
        Err(EngineError::UnavailablePredictor(PredictorKind::Ensemble))
    ));
    assert!(matches!(
        store.load_predictor("flip_xgboost_19990101_000000"),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn gate_accepts_held_out_and_rejects_in_sample() {
    let config = EngineConfig {
        alpha: 0.05,
        target_coverage: 0.9,
        coverage_tolerance: 0.1,
        ..EngineConfig::default()
    };
    // Well-separated predictions: successes near 0.95, failures near 0.05.
    let n = 200;
    let actuals: Vec<bool> = (0..n).map(|i| i % 10 != 0).collect();
    let predictions: Vec<f64> = actuals
        .iter()
        .enumerate()
        .map(|(i, &y)| {
            let jitter = (i % 7) as f64 * 0.005;
            if y {
                0.95 - jitter
            } else {
                0.05 + jitter
            }
        })
        .collect();

    let calibrator = config.calibrator();
    let kfold = config.kfold().unwrap();
    let held_out = cross_validate_held_out(
        &calibrator,
        &predictions,
        &actuals,
        config.alpha,
        config.target_coverage,
        &kfold,
    )
    .unwrap();
    assert_eq!(held_out.kind, CoverageKind::HeldOut);

    let gate = config.calibration_gate();
    let verdict = gate.evaluate(&held_out);
    assert!(verdict.passed, "{:?}", verdict.reasons);

    let in_sample = cross_validate_in_sample(
        &calibrator,
        &predictions,
        &actuals,
        config.alpha,
        config.target_coverage,
        &kfold,
    )
    .unwrap();
    assert!(!gate.evaluate(&in_sample).passed);
}

#[test]
fn config_builds_consistent_components() {
    let config = EngineConfig {
        scorer: ScorerParams::default(),
        ..EngineConfig::default()
    };
    config.validate().unwrap();
    let scorer = config.scorer().unwrap();
    let calm = RedemptionContext::new(10_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10).unwrap();
    assert_eq!(scorer.score(&calm).unwrap().decision, Decision::ProvisionalSettle);
    assert_eq!(config.harness().unwrap().seed(), 42);
}
