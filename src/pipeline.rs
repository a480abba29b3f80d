// THEORY:
// The `pipeline` module is the top-level, single-image API of the engine. It wires
// the three algorithmic stages together behind one struct:
//
//   IntensityGrid -> feature_extractor (per kernel) -> SimilarityAnalyzer (per shape)
//                 -> VerdictEngine (across shapes) -> Verdict
//
// Training runs only the first stage and appends every pooled row to the reference
// store under its kernel id. Classification runs all three. Within one image the
// stages are strictly sequential; parallelism across images is the job of
// `parallel_pipeline`.

use crate::config::ClassifierConfig;
use crate::core_modules::feature_extractor::feature_extractor::{self, ExtractionReport};
use crate::core_modules::grid::{IntensityGrid, PooledMap};
use crate::core_modules::reference_store::ReferenceStore;
use crate::core_modules::shape::Shape;
use crate::core_modules::similarity_analyzer::SimilarityAnalyzer;
use crate::core_modules::utils::image_helper;
use crate::error::{Result, ShapeVisionError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::similarity_analyzer::{EvaluationResult, KernelEvaluation};
pub use crate::core_modules::verdict::{DecisionRule, Label, Verdict, VerdictEngine};

/// What one kernel produced for one image, for `inspect`.
#[derive(Debug, Clone)]
pub struct KernelInspection {
    pub kernel_id: String,
    pub report: ExtractionReport,
    pub pooled: PooledMap,
}

/// The main, top-level struct for the classifier.
pub struct ShapePipeline {
    config: ClassifierConfig,
    shapes: Vec<Shape>,
    store: Arc<dyn ReferenceStore>,
    analyzer: SimilarityAnalyzer,
    engine: VerdictEngine,
}

impl ShapePipeline {
    pub fn new(config: ClassifierConfig, store: Arc<dyn ReferenceStore>) -> Result<Self> {
        config.validate()?;
        let shapes = config.build_shapes()?;
        let analyzer = SimilarityAnalyzer::new(config.matcher.build());
        let engine = VerdictEngine::new(config.verdict_policy())?;
        Ok(Self {
            config,
            shapes,
            store,
            analyzer,
            engine,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn store(&self) -> &Arc<dyn ReferenceStore> {
        &self.store
    }

    pub fn shape(&self, name: &str) -> Result<&Shape> {
        self.shapes
            .iter()
            .find(|shape| shape.name == name)
            .ok_or_else(|| ShapeVisionError::UnknownShape(name.to_string()))
    }

    pub fn load_image<P: AsRef<Path>>(&self, path: P) -> Result<IntensityGrid> {
        image_helper::load_intensity_grid(path, &self.config.image)
    }

    /// Pooled maps of every kernel of `shape`, keyed by kernel id.
    pub fn extract_shape(
        &self,
        grid: &IntensityGrid,
        shape: &Shape,
    ) -> Result<BTreeMap<String, PooledMap>> {
        shape
            .kernels
            .iter()
            .map(|kernel| {
                let pooled = feature_extractor::extract(grid, kernel, shape.pooling, shape.floor)?;
                Ok((kernel.id.clone(), pooled))
            })
            .collect()
    }

    /// Appends every pooled row of the image to the store. All kernels are extracted
    /// and written as one batch, so a failing extraction or a rejected row length
    /// leaves the store untouched. Returns the number of rows appended.
    pub fn train(&self, grid: &IntensityGrid, shape_name: &str) -> Result<usize> {
        let shape = self.shape(shape_name)?;
        let pooled = self.extract_shape(grid, shape)?;
        let appended: usize = pooled.values().map(|map| map.height()).sum();
        let batch = pooled
            .into_iter()
            .map(|(kernel_id, map)| (kernel_id, map.to_rows()))
            .collect();
        self.store.append_batch(batch)?;
        debug!(shape = shape_name, rows = appended, "trained");
        Ok(appended)
    }

    /// True when every kernel of the shape has at least one reference row.
    pub fn is_trained(&self, shape: &Shape) -> bool {
        shape.kernel_ids().all(|kernel_id| {
            self.store
                .get(kernel_id)
                .map(|rows| !rows.is_empty())
                .unwrap_or(false)
        })
    }

    pub fn evaluate_shape(&self, grid: &IntensityGrid, shape_name: &str) -> Result<EvaluationResult> {
        let shape = self.shape(shape_name)?;
        let pooled = self.extract_shape(grid, shape)?;
        self.analyzer.evaluate(&pooled, shape, self.store.as_ref())
    }

    /// Scores the image against every trained shape and fuses the scores into one
    /// verdict. Shapes without references are left out of both score maps.
    pub fn classify(&self, grid: &IntensityGrid) -> Result<Verdict> {
        let mut cosine = BTreeMap::new();
        let mut euclidian = BTreeMap::new();
        for shape in &self.shapes {
            if !self.is_trained(shape) {
                warn!("Skipping shape '{}': no reference rows stored", shape.name);
                continue;
            }
            let pooled = self.extract_shape(grid, shape)?;
            let result = self.analyzer.evaluate(&pooled, shape, self.store.as_ref())?;
            cosine.insert(result.shape.clone(), result.cosine);
            euclidian.insert(result.shape, result.euclidian);
        }

        let verdict = self.engine.decide(cosine, euclidian)?;
        info!(
            label = %verdict.label,
            confidence = verdict.confidence,
            rule = ?verdict.rule,
            "classified"
        );
        Ok(verdict)
    }

    /// Per-kernel dimensions and pooled maps, without touching the store.
    pub fn inspect(&self, grid: &IntensityGrid, shape_name: &str) -> Result<Vec<KernelInspection>> {
        let shape = self.shape(shape_name)?;
        shape
            .kernels
            .iter()
            .map(|kernel| {
                let (pooled, report) =
                    feature_extractor::extract_with_report(grid, kernel, shape.pooling, shape.floor)?;
                Ok(KernelInspection {
                    kernel_id: kernel.id.clone(),
                    report,
                    pooled,
                })
            })
            .collect()
    }

    /// Drops the references of one shape, or of every shape when `shape_name` is
    /// `None`. Returns how many kernels were reset.
    pub fn reset(&self, shape_name: Option<&str>) -> Result<usize> {
        let shapes: Vec<&Shape> = match shape_name {
            Some(name) => vec![self.shape(name)?],
            None => self.shapes.iter().collect(),
        };
        let mut count = 0;
        for shape in shapes {
            for kernel_id in shape.kernel_ids() {
                self.store.reset(kernel_id)?;
                count += 1;
            }
            info!("Reset references of shape '{}'", shape.name);
        }
        Ok(count)
    }
}
