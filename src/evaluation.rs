//! Reference predictors and regression metrics for sanity-checking a
//! prepared dataset before any model is trained on it.

use std::fmt;

use burn::data::dataset::Dataset;
use log::{debug, info};
use statrs::statistics::{Data, OrderStatistics, RankTieBreaker, Statistics};

use crate::batch::{BatchPlan, HostBatch};
use crate::collection::{EntityCollection, SplitKind, Train};
use crate::error::{PipelineError, Result};
use crate::normalizer::FittedNormalizer;
use crate::records::{Feature, NUM_FEATURES};

pub trait Baseline {
    fn name(&self) -> &'static str;

    /// One prediction per batch item, in batch order.
    fn predict(&self, batch: &HostBatch) -> Vec<f64>;
}

/// Predicts that tomorrow's log return equals today's.
///
/// Windows fed to it are usually normalized, so the last row's return is
/// mapped back to raw units through the training statistics.
#[derive(Debug, Clone, Default)]
pub struct NaiveBaseline {
    normalizer: Option<FittedNormalizer>,
}

impl NaiveBaseline {
    pub fn new(normalizer: Option<FittedNormalizer>) -> Self {
        Self { normalizer }
    }
}

impl Baseline for NaiveBaseline {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn predict(&self, batch: &HostBatch) -> Vec<f64> {
        let col = Feature::LogReturn.index();
        (0..batch.len())
            .map(|i| {
                let Some(v) = batch.last_step(i, col) else {
                    return f64::NAN;
                };
                let v = v as f64;
                match &self.normalizer {
                    Some(n) => n.denormalize(Feature::LogReturn, v),
                    None => v,
                }
            })
            .collect()
    }
}

/// Predicts the mean training target for every window.
#[derive(Debug, Clone, Copy)]
pub struct MeanBaseline {
    mean: f64,
}

impl MeanBaseline {
    pub fn fit(train: &EntityCollection<Train>) -> Self {
        let mean = (0..train.len())
            .filter_map(|i| train.get(i))
            .map(|item| item.target as f64)
            .mean();
        Self {
            mean: if mean.is_nan() { 0.0 } else { mean },
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

impl Baseline for MeanBaseline {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn predict(&self, batch: &HostBatch) -> Vec<f64> {
        vec![self.mean; batch.len()]
    }
}

/// Number of least-squares unknowns: an intercept plus one weight per feature.
const LINEAR_TERMS: usize = NUM_FEATURES + 1;

/// Ordinary least squares on the last row of each training window, with an
/// intercept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearBaseline {
    intercept: f64,
    weights: [f64; NUM_FEATURES],
}

impl LinearBaseline {
    pub fn fit(train: &EntityCollection<Train>) -> Result<Self> {
        let mut xtx = [[0.0; LINEAR_TERMS]; LINEAR_TERMS];
        let mut xty = [0.0; LINEAR_TERMS];
        let mut samples = 0usize;
        for dataset in train.datasets() {
            for local in 0..dataset.len() {
                let Some(last) = dataset.window_rows(local).and_then(|rows| rows.last()) else {
                    continue;
                };
                let mut x = [1.0; LINEAR_TERMS];
                x[1..].copy_from_slice(&last.values);
                for a in 0..LINEAR_TERMS {
                    xty[a] += x[a] * last.target;
                    for b in 0..LINEAR_TERMS {
                        xtx[a][b] += x[a] * x[b];
                    }
                }
                samples += 1;
            }
        }
        if samples == 0 {
            return Err(PipelineError::Evaluation(
                "cannot fit the linear baseline on an empty training split".to_string(),
            ));
        }

        // a constant (all-zero after normalization) column leaves X'X singular
        let scale = (0..LINEAR_TERMS).map(|i| xtx[i][i]).fold(1.0, f64::max);
        for (i, row) in xtx.iter_mut().enumerate() {
            row[i] += 1e-10 * scale;
        }
        let beta = cholesky_solve(xtx, xty).ok_or_else(|| {
            PipelineError::Evaluation("linear baseline normal equations are singular".to_string())
        })?;

        let mut weights = [0.0; NUM_FEATURES];
        weights.copy_from_slice(&beta[1..]);
        let model = Self {
            intercept: beta[0],
            weights,
        };
        info!("Fitted linear baseline on {} training windows", samples);
        let mut ranked: Vec<Feature> = Feature::ALL.to_vec();
        ranked.sort_by(|a, b| model.weight(*b).abs().total_cmp(&model.weight(*a).abs()));
        for feature in ranked.iter().take(3) {
            debug!("  {}: {:.4}", feature, model.weight(*feature));
        }
        Ok(model)
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn weight(&self, feature: Feature) -> f64 {
        self.weights[feature.index()]
    }
}

impl Baseline for LinearBaseline {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn predict(&self, batch: &HostBatch) -> Vec<f64> {
        (0..batch.len())
            .map(|i| {
                let mut y = self.intercept;
                for (f, w) in self.weights.iter().enumerate() {
                    match batch.last_step(i, f) {
                        Some(v) => y += w * v as f64,
                        None => return f64::NAN,
                    }
                }
                y
            })
            .collect()
    }
}

/// Solve `a x = b` for symmetric positive definite `a`.
fn cholesky_solve<const N: usize>(a: [[f64; N]; N], b: [f64; N]) -> Option<[f64; N]> {
    let mut l = [[0.0; N]; N];
    for i in 0..N {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let diag = a[i][i] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return None;
                }
                l[i][j] = diag.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }

    let mut z = [0.0; N];
    for i in 0..N {
        let sum: f64 = (0..i).map(|j| l[i][j] * z[j]).sum();
        z[i] = (b[i] - sum) / l[i][i];
    }
    let mut x = [0.0; N];
    for i in (0..N).rev() {
        let sum: f64 = (i + 1..N).map(|j| l[j][i] * x[j]).sum();
        x[i] = (z[i] - sum) / l[i][i];
    }
    Some(x)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionMetrics {
    pub count: usize,
    pub rmse: f64,
    pub mae: f64,
    /// Share of items where prediction and target have the same sign
    pub directional_accuracy: f64,
    /// Spearman rank correlation; NaN when either side is constant
    pub information_coefficient: f64,
    pub r_squared: f64,
}

impl RegressionMetrics {
    pub fn compute(predictions: &[f64], targets: &[f64]) -> Result<Self> {
        if predictions.len() != targets.len() {
            return Err(PipelineError::Evaluation(format!(
                "{} predictions for {} targets",
                predictions.len(),
                targets.len()
            )));
        }
        let (pred, truth): (Vec<f64>, Vec<f64>) = predictions
            .iter()
            .zip(targets)
            .filter(|(p, t)| p.is_finite() && t.is_finite())
            .map(|(&p, &t)| (p, t))
            .unzip();
        if pred.is_empty() {
            return Err(PipelineError::Evaluation(
                "no finite prediction/target pairs".to_string(),
            ));
        }
        let n = pred.len() as f64;

        let sq_err: f64 = pred.iter().zip(&truth).map(|(p, t)| (p - t).powi(2)).sum();
        let abs_err: f64 = pred.iter().zip(&truth).map(|(p, t)| (p - t).abs()).sum();
        let same_sign = pred
            .iter()
            .zip(&truth)
            .filter(|(p, t)| sign(**p) == sign(**t))
            .count();

        let mean_t = truth.iter().mean();
        let ss_tot: f64 = truth.iter().map(|t| (t - mean_t).powi(2)).sum();
        let r_squared = if ss_tot > 0.0 {
            1.0 - sq_err / ss_tot
        } else {
            f64::NAN
        };

        Ok(Self {
            count: pred.len(),
            rmse: (sq_err / n).sqrt(),
            mae: abs_err / n,
            directional_accuracy: same_sign as f64 / n,
            information_coefficient: spearman(&pred, &truth),
            r_squared,
        })
    }
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "n={} rmse={:.6} mae={:.6} dir_acc={:.2}% ic={:.4} r2={:.4}",
            self.count,
            self.rmse,
            self.mae,
            self.directional_accuracy * 100.0,
            self.information_coefficient,
            self.r_squared
        )
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let mx = x.iter().mean();
    let my = y.iter().mean();
    let cov: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let vx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    let vy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
    if vx == 0.0 || vy == 0.0 {
        return f64::NAN;
    }
    cov / (vx * vy).sqrt()
}

pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    let rx = Data::new(x.to_vec()).ranks(RankTieBreaker::Average);
    let ry = Data::new(y.to_vec()).ranks(RankTieBreaker::Average);
    pearson(&rx, &ry)
}

/// Run `baseline` over `collection` in plan order and score it.
pub fn evaluate<S: SplitKind, M: Baseline>(
    baseline: &M,
    collection: &EntityCollection<S>,
    plan: &BatchPlan,
) -> Result<RegressionMetrics> {
    let mut predictions = Vec::with_capacity(collection.len());
    let mut targets = Vec::with_capacity(collection.len());
    for batch in plan.iter(collection) {
        let batch = batch?;
        predictions.extend(baseline.predict(&batch));
        targets.extend(batch.targets.iter().map(|&t| t as f64));
    }
    let metrics = RegressionMetrics::compute(&predictions, &targets)?;
    info!("{} baseline on {}: {}", baseline.name(), S::NAME, metrics);
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Test;
    use crate::features::FeatureTable;
    use crate::records::{FeatureRecord, NUM_FEATURES};
    use chrono::{Duration, NaiveDate};
    use std::sync::Arc;

    #[test]
    fn perfect_predictions() {
        let t = [0.01, -0.02, 0.03, -0.005];
        let m = RegressionMetrics::compute(&t, &t).unwrap();
        assert!(m.rmse.abs() < 1e-12);
        assert!(m.mae.abs() < 1e-12);
        assert!((m.directional_accuracy - 1.0).abs() < 1e-12);
        assert!((m.information_coefficient - 1.0).abs() < 1e-12);
        assert!((m.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn known_errors() {
        let pred = [1.0, -1.0, 2.0, 0.0];
        let truth = [2.0, 1.0, 1.0, -1.0];
        let m = RegressionMetrics::compute(&pred, &truth).unwrap();
        // errors -1, -2, 1, 1
        assert!((m.rmse - (7.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert!((m.mae - 1.25).abs() < 1e-12);
        assert!((m.directional_accuracy - 0.5).abs() < 1e-12);
        // truth mean 0.75, ss_tot = 1.5625 + 0.0625 + 0.0625 + 3.0625
        assert!((m.r_squared - (1.0 - 7.0 / 4.75)).abs() < 1e-12);
    }

    #[test]
    fn spearman_averages_ties() {
        let ic = spearman(&[1.0, 2.0, 2.0, 3.0], &[10.0, 20.0, 20.0, 30.0]);
        assert!((ic - 1.0).abs() < 1e-12);
        let ic = spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]);
        assert!((ic + 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_predictions_have_undefined_ic() {
        let m = RegressionMetrics::compute(&[0.1; 3], &[0.0, 1.0, 2.0]).unwrap();
        assert!(m.information_coefficient.is_nan());
    }

    #[test]
    fn mismatched_lengths_are_an_error() {
        assert!(RegressionMetrics::compute(&[1.0], &[1.0, 2.0]).is_err());
    }

    fn table(n: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2022, 5, 2).unwrap();
        FeatureTable {
            instrument: Arc::from("N"),
            rows: (0..n)
                .map(|i| {
                    let mut values = [0.0; NUM_FEATURES];
                    values[0] = i as f64 * 0.001;
                    FeatureRecord {
                        date: start + Duration::days(i as i64),
                        values,
                        // next row's log return
                        target: (i + 1) as f64 * 0.001,
                    }
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn naive_baseline_reads_last_log_return() {
        let coll = EntityCollection::<Test>::from_tables(vec![table(20)], 5, 1);
        let plan = BatchPlan::for_collection(&coll, 4, 0);
        let batch = plan.iter(&coll).next().unwrap().unwrap();
        let preds = NaiveBaseline::default().predict(&batch);
        assert!((preds[0] - 0.004).abs() < 1e-6);
        assert!((preds[3] - 0.007).abs() < 1e-6);

        let m = evaluate(&NaiveBaseline::default(), &coll, &plan).unwrap();
        // always one step behind an increasing series
        assert!((m.mae - 0.001).abs() < 1e-6);
        assert_eq!(m.count, 16);
    }

    fn linear_table(n: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2022, 5, 2).unwrap();
        FeatureTable {
            instrument: Arc::from("L"),
            rows: (0..n)
                .map(|i| {
                    let t = i as f64;
                    let mut values = [0.0; NUM_FEATURES];
                    values[0] = (t * 0.3).sin();
                    values[1] = (t * 0.7).cos();
                    values[4] = t * 0.01;
                    FeatureRecord {
                        date: start + Duration::days(i as i64),
                        values,
                        target: 0.1 + 2.0 * values[0] - 0.5 * values[1] + 3.0 * values[4],
                    }
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn linear_baseline_recovers_an_exact_relation() {
        let train = EntityCollection::<Train>::from_tables(vec![linear_table(80)], 5, 1);
        let model = LinearBaseline::fit(&train).unwrap();
        assert!((model.intercept() - 0.1).abs() < 1e-6, "{}", model.intercept());
        assert!((model.weight(Feature::LogReturn) - 2.0).abs() < 1e-6);
        assert!((model.weight(Feature::MeanReturn5) + 0.5).abs() < 1e-6);
        assert!((model.weight(Feature::StdReturn20) - 3.0).abs() < 1e-6);
        // all-zero columns get no weight
        assert!(model.weight(Feature::Beta20).abs() < 1e-9);

        let test = EntityCollection::<Test>::from_tables(vec![linear_table(40)], 5, 1);
        let plan = BatchPlan::for_collection(&test, 8, 0);
        let m = evaluate(&model, &test, &plan).unwrap();
        // features are stacked as f32
        assert!(m.rmse < 1e-5, "{m}");
        assert_eq!(m.count, 36);
    }

    #[test]
    fn linear_baseline_needs_training_windows() {
        let train = EntityCollection::<Train>::from_tables(vec![], 5, 1);
        assert!(matches!(
            LinearBaseline::fit(&train),
            Err(PipelineError::Evaluation(_))
        ));
    }

    #[test]
    fn mean_baseline_uses_training_targets() {
        let train = EntityCollection::<Train>::from_tables(vec![table(10)], 5, 1);
        // window targets are rows 4..=9 -> 0.005..=0.010
        let baseline = MeanBaseline::fit(&train);
        assert!((baseline.mean() - 0.0075).abs() < 1e-6);
    }
}
