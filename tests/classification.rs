use shape_vision::core_modules::grid::{Grid, IntensityGrid};
use shape_vision::{
    ClassifierConfig, DecisionRule, JsonFileStore, Label, MemoryStore, ReferenceStore,
    ShapePipeline, ShapeVisionError, StoreSession, VerdictEngine, VerdictPolicy,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const SIZE: usize = 64;

fn grid_from_fn(f: impl Fn(f64, f64) -> bool) -> IntensityGrid {
    let mut data = Vec::with_capacity(SIZE * SIZE);
    for y in 0..SIZE {
        for x in 0..SIZE {
            data.push(if f(x as f64, y as f64) { 1.0 } else { 0.0 });
        }
    }
    Grid::new(SIZE, SIZE, data).unwrap()
}

fn square() -> IntensityGrid {
    grid_from_fn(|x, y| (16.0..48.0).contains(&x) && (16.0..48.0).contains(&y))
}

fn circle() -> IntensityGrid {
    grid_from_fn(|x, y| (x - 31.5).powi(2) + (y - 31.5).powi(2) <= 16.0 * 16.0)
}

fn cross() -> IntensityGrid {
    grid_from_fn(|x, y| {
        let arm = |across: f64, along: f64| (across - 31.5).abs() < 6.0 && (8.0..56.0).contains(&along);
        arm(x, y) || arm(y, x)
    })
}

fn samples() -> Vec<(&'static str, IntensityGrid)> {
    vec![("circle", circle()), ("square", square()), ("cross", cross())]
}

fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn saturated_shape_wins_outright() {
    let engine = VerdictEngine::new(VerdictPolicy::default()).unwrap();
    let verdict = engine
        .decide(
            scores(&[("A", 5.0), ("B", 3.0)]),
            scores(&[("A", 1.0), ("B", 0.2)]),
        )
        .unwrap();
    assert_eq!(verdict.label, Label::Shape("A".to_string()));
    assert_eq!(verdict.rule, DecisionRule::Saturation);
    assert_eq!(verdict.confidence, 100.0);
}

#[test]
fn unresolved_conflict_is_unknown() {
    let engine = VerdictEngine::new(VerdictPolicy::default()).unwrap();
    let verdict = engine
        .decide(
            scores(&[("A", 4.0), ("B", 4.5)]),
            scores(&[("A", 0.7), ("B", 0.3)]),
        )
        .unwrap();
    assert_eq!(verdict.label, Label::Unknown);
    assert_eq!(verdict.label.to_string(), "unknown pattern");
    assert_eq!(verdict.rule, DecisionRule::ConflictUnresolved);
}

#[test]
fn moderate_agreement_picks_the_shared_favourite() {
    let engine = VerdictEngine::new(VerdictPolicy::default()).unwrap();
    let verdict = engine
        .decide(
            scores(&[("A", 2.0), ("B", 1.0)]),
            scores(&[("A", 0.5), ("B", 0.5)]),
        )
        .unwrap();
    assert_eq!(verdict.label, Label::Shape("A".to_string()));
    assert_eq!(verdict.rule, DecisionRule::Moderate);
}

#[test]
fn decide_is_pure() {
    let engine = VerdictEngine::new(VerdictPolicy::default()).unwrap();
    let cosine = scores(&[("A", 4.0), ("B", 4.5), ("C", 1.0)]);
    let euclidian = scores(&[("A", 0.7), ("B", 0.6), ("C", 0.1)]);
    let first = engine.decide(cosine.clone(), euclidian.clone()).unwrap();
    let second = engine.decide(cosine, euclidian).unwrap();
    assert_eq!(first, second);
}

#[test]
fn every_kernel_recognizes_its_own_training_image() {
    for (name, image) in samples() {
        let pipeline =
            ShapePipeline::new(ClassifierConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        pipeline.train(&image, name).unwrap();

        let result = pipeline.evaluate_shape(&image, name).unwrap();
        assert_eq!(result.euclidian, 1.0, "{}", name);
        assert!((result.cosine - 7.0).abs() < 1e-9, "{}: {}", name, result.cosine);

        let verdict = pipeline.classify(&image).unwrap();
        assert_eq!(verdict.label, Label::Shape(name.to_string()));
        assert_eq!(verdict.rule, DecisionRule::Saturation);
    }
}

#[test]
fn built_in_catalogue_scores_every_trained_shape() {
    let pipeline =
        ShapePipeline::new(ClassifierConfig::default(), Arc::new(MemoryStore::new())).unwrap();
    for (name, image) in samples() {
        pipeline.train(&image, name).unwrap();
    }

    for (name, image) in samples() {
        let verdict = pipeline.classify(&image).unwrap();
        assert_eq!(verdict.euclidian.len(), 3);
        assert_eq!(verdict.euclidian[name], 1.0);
        assert_eq!(verdict, pipeline.classify(&image).unwrap());
    }

    let blank = Grid::new(SIZE, SIZE, vec![0.0; SIZE * SIZE]).unwrap();
    let verdict = pipeline.classify(&blank).unwrap();
    assert_eq!(verdict.label, Label::Unknown);
}

#[test]
fn untrained_catalogue_has_no_candidates() {
    let pipeline =
        ShapePipeline::new(ClassifierConfig::default(), Arc::new(MemoryStore::new())).unwrap();
    assert!(matches!(
        pipeline.classify(&square()),
        Err(ShapeVisionError::EmptyCandidates)
    ));
}

const BARS_CONFIG: &str = r#"
[[shapes]]
name = "horizontal"
pooling = { size = 3, stride = 2 }
floor = { max_width = 6 }
kernels = [
    { id = "h_vertical_line", weights = [[-1.0, 2.0, -1.0], [-1.0, 2.0, -1.0], [-1.0, 2.0, -1.0]] },
    { id = "h_horizontal_line", weights = [[-1.0, -1.0, -1.0], [2.0, 2.0, 2.0], [-1.0, -1.0, -1.0]] },
    { id = "h_left_edge", weights = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]] },
    { id = "h_top_edge", weights = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]] },
    { id = "h_box", weights = [[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]] },
]

[[shapes]]
name = "vertical"
pooling = { size = 3, stride = 2 }
floor = { max_width = 6 }
kernels = [
    { id = "v_vertical_line", weights = [[-1.0, 2.0, -1.0], [-1.0, 2.0, -1.0], [-1.0, 2.0, -1.0]] },
    { id = "v_horizontal_line", weights = [[-1.0, -1.0, -1.0], [2.0, 2.0, 2.0], [-1.0, -1.0, -1.0]] },
    { id = "v_left_edge", weights = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]] },
    { id = "v_top_edge", weights = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]] },
    { id = "v_box", weights = [[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]] },
]
"#;

fn bar(vertical: bool) -> IntensityGrid {
    grid_from_fn(|x, y| (24.0..40.0).contains(if vertical { &x } else { &y }))
}

#[test]
fn configured_bars_are_told_apart_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("refs").join("bars.json");
    let mut config = ClassifierConfig::from_toml(BARS_CONFIG).unwrap();
    config.store_path = store_path.clone();
    assert_eq!(config.verdict_policy().slots, 5);

    {
        let session = StoreSession::open(&config.store_path).unwrap();
        let pipeline = ShapePipeline::new(config.clone(), session.handle()).unwrap();
        pipeline.train(&bar(true), "vertical").unwrap();
        pipeline.train(&bar(false), "horizontal").unwrap();
        session.finish().unwrap();
    }
    assert!(store_path.exists());

    let store = Arc::new(JsonFileStore::open(&store_path).unwrap());
    assert_eq!(store.get("v_box").map(|rows| rows.len()), Some(6));
    let pipeline = ShapePipeline::new(config, store).unwrap();

    // Three of five kernels respond to a bar: 60 %, inside the moderate band.
    let verdict = pipeline.classify(&bar(true)).unwrap();
    assert_eq!(verdict.label, Label::Shape("vertical".to_string()));
    assert_eq!(verdict.confidence, 60.0);
    assert_eq!(verdict.euclidian["horizontal"], 0.0);

    let verdict = pipeline.classify(&bar(false)).unwrap();
    assert_eq!(verdict.label, Label::Shape("horizontal".to_string()));
}
