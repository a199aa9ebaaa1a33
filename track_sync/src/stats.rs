//! Small statistics helpers used when reducing sweep results.

use ndarray::ArrayView1;
use ordered_float::OrderedFloat;

pub fn mean(values: &[f64]) -> Option<f64> {
    ArrayView1::from(values).mean()
}

/// Mean absolute deviation around the arithmetic mean.
pub fn mean_abs_dev(values: &[f64]) -> Option<f64> {
    let view = ArrayView1::from(values);
    let m = view.mean()?;
    view.mapv(|v| (v - m).abs()).mean()
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Inlier mask of the median absolute deviation test: a value is kept when
/// `|v - median| / median(|v - median|) < m`. Everything is kept when the
/// deviation median is zero.
pub fn mad_inlier_mask(values: &[f64], m: f64) -> Vec<bool> {
    let Some(med) = median(values) else {
        return Vec::new();
    };
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mdev = median(&deviations).unwrap_or(0.0);
    deviations
        .iter()
        .map(|&d| {
            let score = if mdev != 0.0 { d / mdev } else { 0.0 };
            score < m
        })
        .collect()
}
