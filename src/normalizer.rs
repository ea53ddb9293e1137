//! Per-feature standardization fitted on the training split only.
//!
//! Statistics can only come out of [`NormalizerTrainer::fit`], which takes an
//! `EntityCollection<Train>`. Validation and test collections have no path
//! into it; they only ever receive a [`FittedNormalizer`].

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::collection::{EntityCollection, Train};
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::records::{Feature, FeatureRecord, NUM_FEATURES};

/// Floor for a column's scale, so a constant column maps to zero instead of
/// dividing by zero.
pub const MIN_SCALE: f64 = 1e-8;

/// Mean and scale per feature column, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    feature_names: Vec<String>,
    mean: [f64; NUM_FEATURES],
    scale: [f64; NUM_FEATURES],
    fitted_rows: usize,
}

impl NormalizationStats {
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn mean(&self) -> &[f64; NUM_FEATURES] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64; NUM_FEATURES] {
        &self.scale
    }

    pub fn mean_of(&self, feature: Feature) -> f64 {
        self.mean[feature.index()]
    }

    pub fn scale_of(&self, feature: Feature) -> f64 {
        self.scale[feature.index()]
    }

    /// Number of training rows the statistics were computed from.
    pub fn fitted_rows(&self) -> usize {
        self.fitted_rows
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Load persisted statistics, e.g. for inference-time normalization.
    ///
    /// The stored feature names must match the current schema, otherwise
    /// columns would be scaled with another column's statistics.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let stats: NormalizationStats = serde_json::from_reader(reader)?;
        let expected = Feature::names();
        if stats.feature_names.len() != expected.len()
            || stats.feature_names.iter().zip(&expected).any(|(a, b)| a != b)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "normalization stats have columns {:?}, expected {:?}",
                stats.feature_names, expected
            )));
        }
        if stats.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PipelineError::InvalidConfig(
                "normalization stats contain a non-positive scale".to_string(),
            ));
        }
        Ok(stats)
    }
}

/// Welford accumulators, one per column; NaN inputs are skipped.
fn compute_stats<'a, I>(rows: I) -> Option<NormalizationStats>
where
    I: IntoIterator<Item = &'a FeatureRecord>,
{
    let mut count = [0usize; NUM_FEATURES];
    let mut mean = [0f64; NUM_FEATURES];
    let mut m2 = [0f64; NUM_FEATURES];
    let mut fitted_rows = 0;

    for row in rows {
        fitted_rows += 1;
        for (col, &v) in row.values.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            count[col] += 1;
            let delta = v - mean[col];
            mean[col] += delta / count[col] as f64;
            m2[col] += delta * (v - mean[col]);
        }
    }
    if fitted_rows == 0 {
        return None;
    }

    let mut scale = [0f64; NUM_FEATURES];
    for col in 0..NUM_FEATURES {
        if count[col] == 0 {
            mean[col] = 0.0;
            scale[col] = 1.0;
        } else {
            // population std
            let std = (m2[col] / count[col] as f64).sqrt();
            scale[col] = std.max(MIN_SCALE);
        }
    }

    Some(NormalizationStats {
        feature_names: Feature::names().into_iter().map(String::from).collect(),
        mean,
        scale,
        fitted_rows,
    })
}

/// The only way to produce normalization statistics.
pub struct NormalizerTrainer;

impl NormalizerTrainer {
    pub fn fit(train: &EntityCollection<Train>) -> Result<FittedNormalizer> {
        let stats = compute_stats(train.feature_rows()).ok_or_else(|| {
            PipelineError::InvalidConfig("cannot fit normalizer: training split is empty".into())
        })?;
        info!(
            "Fitted normalizer on {} training rows from {} instruments",
            stats.fitted_rows,
            train.num_instruments()
        );
        Ok(FittedNormalizer {
            stats: Arc::new(stats),
        })
    }
}

/// Read-only statistics that can be applied anywhere but never refit.
#[derive(Debug, Clone)]
pub struct FittedNormalizer {
    stats: Arc<NormalizationStats>,
}

impl FittedNormalizer {
    /// Wrap statistics persisted by an earlier training run.
    pub fn from_saved<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            stats: Arc::new(NormalizationStats::load_json(path)?),
        })
    }

    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    pub(crate) fn shared_stats(&self) -> Arc<NormalizationStats> {
        Arc::clone(&self.stats)
    }

    pub fn apply_values(&self, values: &[f64; NUM_FEATURES]) -> [f64; NUM_FEATURES] {
        let mut out = [0f64; NUM_FEATURES];
        for (col, dst) in out.iter_mut().enumerate() {
            *dst = (values[col] - self.stats.mean[col]) / self.stats.scale[col];
        }
        out
    }

    /// Inverse of `apply_values` for one column.
    pub fn denormalize(&self, feature: Feature, value: f64) -> f64 {
        value * self.stats.scale_of(feature) + self.stats.mean_of(feature)
    }

    /// Standardize every feature value; dates and targets are left as-is.
    pub fn apply(&self, table: &FeatureTable) -> FeatureTable {
        FeatureTable {
            instrument: table.instrument.clone(),
            rows: table
                .rows
                .iter()
                .map(|r| FeatureRecord {
                    date: r.date,
                    values: self.apply_values(&r.values),
                    target: r.target,
                })
                .collect(),
            warnings: table.warnings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Validation;
    use chrono::{Duration, NaiveDate};
    use tempfile::tempdir;

    fn table(name: &str, values: &[f64], offset_days: i64) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(offset_days);
        FeatureTable {
            instrument: Arc::from(name),
            rows: values
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    let mut values = [v; NUM_FEATURES];
                    values[Feature::Beta20.index()] = 1.0;
                    FeatureRecord {
                        date: start + Duration::days(i as i64),
                        values,
                        target: 0.0,
                    }
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn fit_computes_population_mean_and_std() {
        let train = EntityCollection::<Train>::from_tables(
            vec![table("A", &[1.0, 2.0, 3.0], 0), table("B", &[4.0, 5.0], 0)],
            2,
            1,
        );
        let fitted = NormalizerTrainer::fit(&train).unwrap();
        let stats = fitted.stats();
        assert_eq!(stats.fitted_rows(), 5);
        assert!((stats.mean_of(Feature::LogReturn) - 3.0).abs() < 1e-12);
        assert!((stats.scale_of(Feature::LogReturn) - 2f64.sqrt()).abs() < 1e-12);
        // constant column: scale floored, values map to zero
        assert_eq!(stats.scale_of(Feature::Beta20), MIN_SCALE);
        let out = fitted.apply_values(&train.feature_rows().next().unwrap().values);
        assert_eq!(out[Feature::Beta20.index()], 0.0);
    }

    #[test]
    fn empty_training_split_cannot_be_fitted() {
        let train = EntityCollection::<Train>::from_tables(vec![], 2, 1);
        assert!(NormalizerTrainer::fit(&train).is_err());
    }

    #[test]
    fn validation_receives_training_statistics() {
        let train =
            EntityCollection::<Train>::from_tables(vec![table("A", &[1.0, 2.0, 3.0], 0)], 2, 1);
        let val = EntityCollection::<Validation>::from_tables(
            vec![table("A", &[10.0, 20.0, 30.0], 3)],
            2,
            1,
        );
        let fitted = NormalizerTrainer::fit(&train).unwrap();
        let val_norm = val.normalized(&fitted);
        assert_eq!(val_norm.stats(), Some(fitted.stats()));

        // (10 - 2) / sqrt(2/3)
        let first = val_norm.feature_rows().next().unwrap().values[0];
        assert!((first - 8.0 / (2.0f64 / 3.0).sqrt()).abs() < 1e-9);

        // statistics fitted on validation rows would differ
        let refit = compute_stats(val.feature_rows()).unwrap();
        assert!((refit.mean_of(Feature::LogReturn) - fitted.stats().mean_of(Feature::LogReturn)).abs() > 1.0);
    }

    #[test]
    fn denormalize_inverts_apply() {
        let train =
            EntityCollection::<Train>::from_tables(vec![table("A", &[0.5, -0.25, 1.5], 0)], 2, 1);
        let fitted = NormalizerTrainer::fit(&train).unwrap();
        let raw = [0.75; NUM_FEATURES];
        let z = fitted.apply_values(&raw);
        let back = fitted.denormalize(Feature::LogReturn, z[0]);
        assert!((back - 0.75).abs() < 1e-12);
    }

    #[test]
    fn stats_survive_json_round_trip() {
        let train =
            EntityCollection::<Train>::from_tables(vec![table("A", &[1.0, 4.0, 9.0], 0)], 2, 1);
        let fitted = NormalizerTrainer::fit(&train).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        fitted.stats().save_json(&path).unwrap();

        let loaded = FittedNormalizer::from_saved(&path).unwrap();
        assert_eq!(loaded.stats(), fitted.stats());
    }

    #[test]
    fn stats_with_foreign_schema_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut stats = compute_stats(table("A", &[1.0, 2.0], 0).rows.iter()).unwrap();
        stats.feature_names[0] = "close".to_string();
        stats.save_json(&path).unwrap();
        assert!(matches!(
            NormalizationStats::load_json(&path),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
