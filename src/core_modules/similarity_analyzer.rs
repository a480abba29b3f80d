// THEORY:
// The `SimilarityAnalyzer` scores one shape for one image. It receives the pooled map
// of every kernel in the shape and compares each pooled row against every reference
// row captured for that kernel during training. Two independent metrics come out of
// the same exhaustive scan:
//
// 1.  **Euclidian Confidence**: a pooled row and a reference row "match" when their
//     distance passes the match predicate. The default predicate is adaptive: the
//     allowed distance is a fixed fraction of the pooled row's own mean, so bright,
//     strongly-responding rows tolerate more absolute deviation than faint ones. A
//     kernel "votes" for the shape when it produced at least one match, and the
//     shape's confidence is the fraction of voting kernels.
// 2.  **Cosine Score**: for every kernel, the best cosine similarity between any
//     pooled row and any reference row. The per-kernel maxima are summed, so the
//     score is unbounded above but typically within [0, kernel_count].
//
// The two metrics reward different things. Cosine looks at the *trend* of a row
// and ignores its magnitude; euclidean distance looks at both. The `verdict`
// module is responsible for fusing them.
//
// A shape is never scored with partial kernel coverage. A kernel without any stored
// reference rows fails the whole evaluation rather than silently skewing the result.

use crate::core_modules::grid::PooledMap;
use crate::core_modules::metrics::{cosine_similarity, euclidean_distance, mean, mean_and_std_dev};
use crate::core_modules::reference_store::{ReferenceRow, ReferenceStore};
use crate::core_modules::shape::Shape;
use crate::error::{Result, ShapeVisionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fraction of a pooled row's mean a distance must stay below to count as a match.
pub const DEFAULT_MATCH_RATIO: f64 = 0.09;

/// Distance statistics of one kernel's reference rows among themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Calibration {
    pub mean_distance: f64,
    pub std_dev_distance: f64,
}

/// Decides whether a pooled row matches a reference row at a given distance.
pub trait MatchPredicate: Send + Sync + std::fmt::Debug {
    /// Per-kernel state derived from the reference rows, computed once per kernel.
    fn calibrate(&self, _references: &[ReferenceRow]) -> Result<Calibration> {
        Ok(Calibration::default())
    }

    fn is_match(&self, row: &[f64], distance: f64, calibration: &Calibration) -> bool;
}

/// `distance < mean(row) * ratio`, recomputed for every compared row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanRatioMatcher {
    pub ratio: f64,
}

impl Default for MeanRatioMatcher {
    fn default() -> Self {
        Self {
            ratio: DEFAULT_MATCH_RATIO,
        }
    }
}

impl MatchPredicate for MeanRatioMatcher {
    fn is_match(&self, row: &[f64], distance: f64, _calibration: &Calibration) -> bool {
        distance < mean(row) * self.ratio
    }
}

/// `distance < mean_d + k * std_d`, where `mean_d` and `std_d` describe the
/// pairwise distances among the kernel's own reference rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadMatcher {
    pub k: f64,
}

impl MatchPredicate for SpreadMatcher {
    fn calibrate(&self, references: &[ReferenceRow]) -> Result<Calibration> {
        let mut distances = Vec::new();
        for (i, a) in references.iter().enumerate() {
            for b in &references[i + 1..] {
                distances.push(euclidean_distance(a, b)?);
            }
        }
        let (mean_distance, std_dev_distance) = mean_and_std_dev(&distances);
        Ok(Calibration {
            mean_distance,
            std_dev_distance,
        })
    }

    fn is_match(&self, _row: &[f64], distance: f64, calibration: &Calibration) -> bool {
        distance < calibration.mean_distance + self.k * calibration.std_dev_distance
    }
}

/// Evidence gathered for a single kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvaluation {
    pub kernel_id: String,
    pub matches: usize,
    pub non_matches: usize,
    pub best_cosine: f64,
}

/// Scores of one shape for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub shape: String,
    /// Fraction of the shape's kernels that found at least one matching reference row.
    pub euclidian: f64,
    /// Sum over kernels of each kernel's best cosine similarity.
    pub cosine: f64,
    pub kernels: Vec<KernelEvaluation>,
}

#[derive(Debug)]
pub struct SimilarityAnalyzer {
    matcher: Box<dyn MatchPredicate>,
}

impl Default for SimilarityAnalyzer {
    fn default() -> Self {
        Self::new(Box::new(MeanRatioMatcher::default()))
    }
}

impl SimilarityAnalyzer {
    pub fn new(matcher: Box<dyn MatchPredicate>) -> Self {
        Self { matcher }
    }

    /// Scores `shape` from the pooled maps of its kernels.
    pub fn evaluate(
        &self,
        pooled_by_kernel: &BTreeMap<String, PooledMap>,
        shape: &Shape,
        store: &(impl ReferenceStore + ?Sized),
    ) -> Result<EvaluationResult> {
        let mut kernels = Vec::with_capacity(shape.kernel_count());
        for kernel_id in shape.kernel_ids() {
            let pooled = pooled_by_kernel
                .get(kernel_id)
                .ok_or_else(|| ShapeVisionError::MissingPooledMap(kernel_id.to_string()))?;
            let references = store
                .get(kernel_id)
                .filter(|rows| !rows.is_empty())
                .ok_or_else(|| ShapeVisionError::MissingReferences(kernel_id.to_string()))?;
            kernels.push(self.evaluate_kernel(kernel_id, pooled, &references)?);
        }

        if kernels.is_empty() {
            return Err(ShapeVisionError::InvalidConfig(format!(
                "shape '{}' has no kernels",
                shape.name
            )));
        }

        let voting = kernels.iter().filter(|k| k.matches > 0).count();
        let euclidian = voting as f64 / kernels.len() as f64;
        let cosine = kernels.iter().map(|k| k.best_cosine).sum();
        debug!(
            shape = %shape.name,
            euclidian,
            cosine,
            "{} of {} kernels matched",
            voting,
            kernels.len()
        );

        Ok(EvaluationResult {
            shape: shape.name.clone(),
            euclidian,
            cosine,
            kernels,
        })
    }

    fn evaluate_kernel(
        &self,
        kernel_id: &str,
        pooled: &PooledMap,
        references: &[ReferenceRow],
    ) -> Result<KernelEvaluation> {
        let calibration = self.matcher.calibrate(references)?;
        let mut matches = 0;
        let mut non_matches = 0;
        let mut best_cosine = f64::NEG_INFINITY;

        for row in pooled.rows() {
            for reference in references {
                let distance = euclidean_distance(row, reference)?;
                if self.matcher.is_match(row, distance, &calibration) {
                    matches += 1;
                } else {
                    non_matches += 1;
                }
                let similarity = cosine_similarity(row, reference)?;
                if similarity > best_cosine {
                    best_cosine = similarity;
                }
            }
        }

        debug!(
            kernel = kernel_id,
            matches, non_matches, best_cosine, "pooled rows {:?}",
            pooled.to_rows()
        );
        Ok(KernelEvaluation {
            kernel_id: kernel_id.to_string(),
            matches,
            non_matches,
            best_cosine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::grid::Grid;
    use crate::core_modules::kernel::Kernel;
    use crate::core_modules::reference_store::MemoryStore;
    use crate::core_modules::shape::{PoolingParams, ReductionFloor};
    use std::sync::Arc;

    fn shape(kernel_ids: &[&str]) -> Shape {
        Shape {
            name: "test".to_string(),
            kernels: kernel_ids
                .iter()
                .map(|id| Arc::new(Kernel::new(*id, Grid::new(1, 1, vec![1.0]).unwrap())))
                .collect(),
            pooling: PoolingParams::default(),
            floor: ReductionFloor::default(),
            training_dir: "test".to_string(),
        }
    }

    fn pooled(rows: &[Vec<f64>]) -> PooledMap {
        Grid::from_rows(rows).unwrap()
    }

    #[test]
    fn identical_rows_match_and_score_full_cosine() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0, 2.0, 3.0]).unwrap();
        store.append("b", vec![2.0, 2.0, 2.0]).unwrap();
        let maps = BTreeMap::from([
            ("a".to_string(), pooled(&[vec![1.0, 2.0, 3.0]])),
            ("b".to_string(), pooled(&[vec![2.0, 2.0, 2.0]])),
        ]);
        let result = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a", "b"]), &store)
            .unwrap();
        assert_eq!(result.euclidian, 1.0);
        assert!((result.cosine - 2.0).abs() < 1e-12);
    }

    #[test]
    fn euclidian_is_fraction_of_matching_kernels() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0, 1.0]).unwrap();
        store.append("b", vec![1.0, 1.0]).unwrap();
        store.append("c", vec![1.0, 1.0]).unwrap();
        store.append("d", vec![1.0, 1.0]).unwrap();
        let near = pooled(&[vec![1.0, 1.05]]);
        let far = pooled(&[vec![5.0, 0.0]]);
        let maps = BTreeMap::from([
            ("a".to_string(), near.clone()),
            ("b".to_string(), far.clone()),
            ("c".to_string(), far),
            ("d".to_string(), near),
        ]);
        let result = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a", "b", "c", "d"]), &store)
            .unwrap();
        assert_eq!(result.euclidian, 0.5);
        let a = &result.kernels[0];
        assert_eq!((a.matches, a.non_matches), (1, 0));
        let b = &result.kernels[1];
        assert_eq!((b.matches, b.non_matches), (0, 1));
    }

    #[test]
    fn match_threshold_adapts_to_row_mean() {
        let matcher = MeanRatioMatcher::default();
        let calibration = Calibration::default();
        // mean 10 -> threshold 0.9
        assert!(matcher.is_match(&[10.0, 10.0], 0.89, &calibration));
        assert!(!matcher.is_match(&[10.0, 10.0], 0.9, &calibration));
        // mean 1 -> threshold 0.09
        assert!(!matcher.is_match(&[1.0, 1.0], 0.5, &calibration));
        // an all-zero row can never match
        assert!(!matcher.is_match(&[0.0, 0.0], 0.0, &calibration));
    }

    #[test]
    fn counts_cover_full_cartesian_product() {
        let store = MemoryStore::new();
        store
            .append_rows("a", vec![vec![1.0, 1.0], vec![9.0, 9.0], vec![1.0, 1.02]])
            .unwrap();
        let maps = BTreeMap::from([(
            "a".to_string(),
            pooled(&[vec![1.0, 1.0], vec![3.0, 3.0]]),
        )]);
        let result = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a"]), &store)
            .unwrap();
        let kernel = &result.kernels[0];
        assert_eq!(kernel.matches + kernel.non_matches, 6);
        assert_eq!(kernel.matches, 2);
    }

    #[test]
    fn cosine_takes_best_row_per_kernel_and_sums_kernels() {
        let store = MemoryStore::new();
        store.append_rows("a", vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        store.append("b", vec![1.0, 1.0]).unwrap();
        let maps = BTreeMap::from([
            ("a".to_string(), pooled(&[vec![0.0, 3.0], vec![0.0, 0.0]])),
            ("b".to_string(), pooled(&[vec![1.0, 0.0]])),
        ]);
        let result = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a", "b"]), &store)
            .unwrap();
        let expected = 1.0 + std::f64::consts::FRAC_1_SQRT_2;
        assert!((result.cosine - expected).abs() < 1e-12);
    }

    #[test]
    fn kernel_without_references_fails_the_shape() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0]).unwrap();
        let maps = BTreeMap::from([
            ("a".to_string(), pooled(&[vec![1.0]])),
            ("b".to_string(), pooled(&[vec![1.0]])),
        ]);
        let err = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a", "b"]), &store)
            .unwrap_err();
        assert!(matches!(err, ShapeVisionError::MissingReferences(id) if id == "b"));
    }

    #[test]
    fn emptied_kernel_also_fails() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0]).unwrap();
        store.reset("a").unwrap();
        let maps = BTreeMap::from([("a".to_string(), pooled(&[vec![1.0]]))]);
        assert!(SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a"]), &store)
            .is_err());
    }

    #[test]
    fn missing_pooled_map_is_reported() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0]).unwrap();
        let err = SimilarityAnalyzer::default()
            .evaluate(&BTreeMap::new(), &shape(&["a"]), &store)
            .unwrap_err();
        assert!(matches!(err, ShapeVisionError::MissingPooledMap(_)));
    }

    #[test]
    fn row_length_mismatch_is_fatal() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0, 2.0, 3.0]).unwrap();
        let maps = BTreeMap::from([("a".to_string(), pooled(&[vec![1.0, 2.0]]))]);
        let err = SimilarityAnalyzer::default()
            .evaluate(&maps, &shape(&["a"]), &store)
            .unwrap_err();
        assert!(matches!(err, ShapeVisionError::Comparison { .. }));
    }

    #[test]
    fn spread_matcher_uses_reference_scatter() {
        let matcher = SpreadMatcher { k: 1.0 };
        let references = vec![vec![0.0, 0.0], vec![3.0, 4.0], vec![6.0, 8.0]];
        let calibration = matcher.calibrate(&references).unwrap();
        // pairwise distances 5, 10, 5
        assert!((calibration.mean_distance - 20.0 / 3.0).abs() < 1e-12);
        assert!(matcher.is_match(&[0.0, 0.0], 8.0, &calibration));
        assert!(!matcher.is_match(&[0.0, 0.0], 9.5, &calibration));
    }

    #[test]
    fn analyzer_accepts_a_custom_predicate() {
        let store = MemoryStore::new();
        store.append("a", vec![1.0, 1.0]).unwrap();
        let maps = BTreeMap::from([(
            "a".to_string(),
            pooled(&[vec![1.0, 1.0], vec![5.0, 5.0]]),
        )]);
        let analyzer = SimilarityAnalyzer::new(Box::new(SpreadMatcher { k: 0.0 }));
        let result = analyzer.evaluate(&maps, &shape(&["a"]), &store).unwrap();
        // a single reference row has no scatter, so even an exact hit sits on the bound
        assert_eq!(result.euclidian, 0.0);
        assert_eq!(result.kernels[0].non_matches, 2);
    }

    #[test]
    fn spread_bound_is_exclusive() {
        let matcher = SpreadMatcher { k: 2.0 };
        let calibration = Calibration {
            mean_distance: 5.0,
            std_dev_distance: 1.0,
        };
        assert!(matcher.is_match(&[], 6.99, &calibration));
        assert!(!matcher.is_match(&[], 7.0, &calibration));
    }
}
