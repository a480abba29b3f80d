//! Vector metrics shared by the similarity analyzer: cosine similarity,
//! euclidean distance and the arithmetic mean.

use crate::error::{Result, ShapeVisionError};

fn check_lengths(row: &[f64], reference: &[f64]) -> Result<()> {
    if row.len() != reference.len() {
        return Err(ShapeVisionError::Comparison {
            expected: reference.len(),
            actual: row.len(),
        });
    }
    Ok(())
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// `dot(a, b) / (|a| * |b|)`. A zero-magnitude vector on either side gives 0.
pub fn cosine_similarity(row: &[f64], reference: &[f64]) -> Result<f64> {
    check_lengths(row, reference)?;
    let norm_a = l2_norm(row);
    let norm_b = l2_norm(reference);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    let dot: f64 = row.iter().zip(reference).map(|(a, b)| a * b).sum();
    Ok(dot / (norm_a * norm_b))
}

pub fn euclidean_distance(row: &[f64], reference: &[f64]) -> Result<f64> {
    check_lengths(row, reference)?;
    Ok(row
        .iter()
        .zip(reference)
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt())
}

/// Arithmetic mean, 0 for an empty slice.
pub fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

/// Population mean and standard deviation.
pub fn mean_and_std_dev(v: &[f64]) -> (f64, f64) {
    if v.is_empty() {
        return (0.0, 0.0);
    }
    let m = mean(v);
    let variance = v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64;
    (m, variance.sqrt())
}
