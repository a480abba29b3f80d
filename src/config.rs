// THEORY:
// Everything tunable about the classifier lives in one `ClassifierConfig`, loaded
// from TOML. The defaults describe a complete, working catalogue so the engine can
// run without a config file at all:
//
// - `image`: the fixed size every image is resized to before extraction.
// - `store_path`: where the reference rows are persisted.
// - `matcher`: the euclidean match predicate (mean-ratio by default).
// - `verdict`: threshold numerators; the slot count defaults to the kernel count of
//   the largest shape so thresholds scale with the catalogue.
// - `shapes`: the catalogue itself, kernels included.

use crate::core_modules::kernel::Kernel;
use crate::core_modules::shape::{PoolingParams, PoolingPolicy, ReductionFloor, Shape};
use crate::core_modules::similarity_analyzer::{
    DEFAULT_MATCH_RATIO, MatchPredicate, MeanRatioMatcher, SpreadMatcher,
};
use crate::core_modules::verdict::VerdictPolicy;
use crate::error::{Result, ShapeVisionError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size every decoded image is brought to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub width: u32,
    /// When unset, the height follows the source aspect ratio.
    #[serde(default)]
    pub height: Option<u32>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: Some(64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherConfig {
    MeanRatio { ratio: f64 },
    Spread { k: f64 },
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig::MeanRatio {
            ratio: DEFAULT_MATCH_RATIO,
        }
    }
}

impl MatcherConfig {
    pub fn build(&self) -> Box<dyn MatchPredicate> {
        match *self {
            MatcherConfig::MeanRatio { ratio } => Box::new(MeanRatioMatcher { ratio }),
            MatcherConfig::Spread { k } => Box::new(SpreadMatcher { k }),
        }
    }
}

fn default_low() -> usize {
    2
}
fn default_mid() -> usize {
    3
}
fn default_relevant() -> usize {
    4
}
fn default_good() -> usize {
    4
}
fn default_high() -> usize {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictConfig {
    /// Overrides the slot count; defaults to the largest shape's kernel count.
    /// One slot count serves the whole catalogue, so a shape with fewer kernels
    /// needs a larger fraction of its own kernels to clear the same threshold.
    #[serde(default)]
    pub kernel_slots: Option<usize>,
    #[serde(default = "default_low")]
    pub low: usize,
    #[serde(default = "default_mid")]
    pub mid: usize,
    #[serde(default = "default_relevant")]
    pub relevant: usize,
    #[serde(default = "default_good")]
    pub good: usize,
    #[serde(default = "default_high")]
    pub high: usize,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            kernel_slots: None,
            low: default_low(),
            mid: default_mid(),
            relevant: default_relevant(),
            good: default_good(),
            high: default_high(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub id: String,
    pub weights: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeConfig {
    pub name: String,
    /// Training sub-directory; defaults to the shape name.
    #[serde(default)]
    pub training_dir: Option<String>,
    #[serde(default)]
    pub pooling: PoolingParams,
    #[serde(default)]
    pub floor: ReductionFloor,
    pub kernels: Vec<KernelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub verdict: VerdictConfig,
    #[serde(default = "default_shapes")]
    pub shapes: Vec<ShapeConfig>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("references.json")
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            store_path: default_store_path(),
            matcher: MatcherConfig::default(),
            verdict: VerdictConfig::default(),
            shapes: default_shapes(),
        }
    }
}

impl ClassifierConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ShapeVisionError::InvalidConfig(msg));

        if self.image.width == 0 || self.image.height == Some(0) {
            return invalid("image dimensions must be non-zero".to_string());
        }
        if let MatcherConfig::MeanRatio { ratio } = self.matcher {
            if ratio <= 0.0 {
                return invalid(format!("match ratio must be positive, got {}", ratio));
            }
        }
        if self.shapes.is_empty() {
            return invalid("at least one shape is required".to_string());
        }

        let mut shape_names = HashSet::new();
        let mut kernel_ids = HashSet::new();
        for shape in &self.shapes {
            if !shape_names.insert(shape.name.as_str()) {
                return invalid(format!("shape '{}' is defined twice", shape.name));
            }
            if shape.kernels.is_empty() {
                return invalid(format!("shape '{}' has no kernels", shape.name));
            }
            if shape.pooling.size == 0 || shape.pooling.stride == 0 {
                return invalid(format!(
                    "shape '{}' needs a non-zero pool size and stride",
                    shape.name
                ));
            }
            for kernel in &shape.kernels {
                if !kernel_ids.insert(kernel.id.as_str()) {
                    return invalid(format!("kernel id '{}' is used twice", kernel.id));
                }
                Kernel::from_rows(kernel.id.clone(), &kernel.weights)?;
            }
        }

        self.verdict_policy().validate()
    }

    /// Materializes the catalogue with shared, immutable kernels.
    pub fn build_shapes(&self) -> Result<Vec<Shape>> {
        self.shapes
            .iter()
            .map(|shape| {
                let kernels = shape
                    .kernels
                    .iter()
                    .map(|k| Kernel::from_rows(k.id.clone(), &k.weights).map(Arc::new))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Shape {
                    name: shape.name.clone(),
                    kernels,
                    pooling: shape.pooling,
                    floor: shape.floor,
                    training_dir: shape
                        .training_dir
                        .clone()
                        .unwrap_or_else(|| shape.name.clone()),
                })
            })
            .collect()
    }

    pub fn verdict_policy(&self) -> VerdictPolicy {
        let slots = self.verdict.kernel_slots.unwrap_or_else(|| {
            self.shapes
                .iter()
                .map(|s| s.kernels.len())
                .max()
                .unwrap_or(0)
        });
        VerdictPolicy {
            slots,
            low: self.verdict.low,
            mid: self.verdict.mid,
            relevant: self.verdict.relevant,
            good: self.verdict.good,
            high: self.verdict.high,
        }
    }
}

/// The hand-authored 3x3 filters every built-in shape is described with.
pub fn default_kernel_bank() -> Vec<(&'static str, Vec<Vec<f64>>)> {
    let ninth = 1.0 / 9.0;
    vec![
        (
            "vertical_line",
            vec![
                vec![-1.0, 2.0, -1.0],
                vec![-1.0, 2.0, -1.0],
                vec![-1.0, 2.0, -1.0],
            ],
        ),
        (
            "horizontal_line",
            vec![
                vec![-1.0, -1.0, -1.0],
                vec![2.0, 2.0, 2.0],
                vec![-1.0, -1.0, -1.0],
            ],
        ),
        (
            "diagonal",
            vec![
                vec![2.0, -1.0, -1.0],
                vec![-1.0, 2.0, -1.0],
                vec![-1.0, -1.0, 2.0],
            ],
        ),
        (
            "anti_diagonal",
            vec![
                vec![-1.0, -1.0, 2.0],
                vec![-1.0, 2.0, -1.0],
                vec![2.0, -1.0, -1.0],
            ],
        ),
        (
            "left_edge",
            vec![
                vec![-1.0, 0.0, 1.0],
                vec![-2.0, 0.0, 2.0],
                vec![-1.0, 0.0, 1.0],
            ],
        ),
        (
            "top_edge",
            vec![
                vec![-1.0, -2.0, -1.0],
                vec![0.0, 0.0, 0.0],
                vec![1.0, 2.0, 1.0],
            ],
        ),
        ("box", vec![vec![ninth; 3]; 3]),
    ]
}

/// Kernel configs for a shape, one per bank filter, with ids scoped to the shape.
pub fn bank_kernels_for(shape: &str) -> Vec<KernelConfig> {
    default_kernel_bank()
        .into_iter()
        .enumerate()
        .map(|(i, (_, weights))| KernelConfig {
            id: format!("{}_filter_{}", shape, i + 1),
            weights,
        })
        .collect()
}

fn default_shapes() -> Vec<ShapeConfig> {
    vec![
        ShapeConfig {
            name: "circle".to_string(),
            training_dir: None,
            pooling: PoolingParams {
                size: 3,
                stride: 3,
                policy: PoolingPolicy::Valid,
            },
            floor: ReductionFloor::MaxElements(9),
            kernels: bank_kernels_for("circle"),
        },
        ShapeConfig {
            name: "square".to_string(),
            training_dir: None,
            pooling: PoolingParams {
                size: 3,
                stride: 2,
                policy: PoolingPolicy::Valid,
            },
            floor: ReductionFloor::MaxWidth(6),
            kernels: bank_kernels_for("square"),
        },
        ShapeConfig {
            name: "cross".to_string(),
            training_dir: None,
            pooling: PoolingParams {
                size: 2,
                stride: 2,
                policy: PoolingPolicy::Valid,
            },
            floor: ReductionFloor::MaxWidth(5),
            kernels: bank_kernels_for("cross"),
        },
    ]
}
