//! Causal feature derivation for one instrument.
//!
//! Feature values on row `i` are computed from rows `0..=i` only; the target
//! on row `i` is the log return of row `i + 1`. Nothing is forward-filled,
//! clamped or back-filled: undefined stays NaN, infinite is an error.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use log::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::records::{Feature, FeatureRecord, InstrumentId, MarketPoint, RawRecord, NUM_FEATURES};
use crate::rolling::{
    rolling_beta, rolling_mean, rolling_percentile_rank, rolling_std, simple_moving_average,
};
use crate::source::{validate_market, validate_raw, MARKET_LABEL};

/// Added to ratio denominators that can legitimately reach zero.
pub const EPSILON: f64 = 1e-8;

/// Share of undefined values (after warm-up) above which a feature column is
/// reported as a quality issue.
const MAX_POST_WARMUP_NAN_SHARE: f64 = 0.10;

/// Reference index closes keyed by date, shared read-only by all instruments.
#[derive(Debug, Clone, Default)]
pub struct MarketSeries {
    closes: HashMap<NaiveDate, f64>,
}

impl MarketSeries {
    /// `points` must be date-sorted. A repeated or out-of-order date, or a
    /// close that is not a positive finite number, is `MalformedInput` for
    /// the index rather than a failure of every stock joined to it.
    pub fn new(points: &[MarketPoint]) -> Result<Self> {
        validate_market(MARKET_LABEL, points)?;
        Ok(Self {
            closes: points.iter().map(|p| (p.date, p.close)).collect(),
        })
    }

    pub fn close_on(&self, date: NaiveDate) -> Option<f64> {
        self.closes.get(&date).copied()
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

/// Full feature history of one instrument, warm-up rows included.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub instrument: InstrumentId,
    pub rows: Vec<FeatureRecord>,
    /// Non-fatal raw-data warnings raised while validating the input
    pub warnings: Vec<String>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, feature: Feature) -> Vec<f64> {
        self.rows.iter().map(|r| r.get(feature)).collect()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.target).collect()
    }

    /// Rows usable for training and evaluation. The table itself keeps the
    /// excluded rows so they can still be audited.
    pub fn valid_rows(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.rows.iter().filter(|r| r.is_valid())
    }

    pub fn valid_count(&self) -> usize {
        self.valid_rows().count()
    }

    /// Maximal runs of consecutive valid rows, each as its own table.
    ///
    /// An undefined row inside the history (e.g. a date missing from the
    /// market index) ends one run and the next valid row starts another, so
    /// windows cut from a run never skip a row.
    pub fn valid_runs(&self) -> Vec<FeatureTable> {
        let mut runs = Vec::new();
        let mut current: Vec<FeatureRecord> = Vec::new();
        for row in &self.rows {
            if row.is_valid() {
                current.push(*row);
            } else if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs.into_iter()
            .map(|rows| FeatureTable {
                instrument: self.instrument.clone(),
                rows,
                warnings: self.warnings.clone(),
            })
            .collect()
    }

    /// Feature columns that stay undefined on more than 10% of the rows past
    /// the warm-up period.
    pub fn quality_issues(&self, warmup: usize) -> Vec<String> {
        let mut issues = Vec::new();
        if self.rows.len() <= warmup {
            return issues;
        }
        let checked = &self.rows[warmup..];
        for feature in Feature::ALL {
            let undefined = checked.iter().filter(|r| r.get(feature).is_nan()).count();
            let share = undefined as f64 / checked.len() as f64;
            if share > MAX_POST_WARMUP_NAN_SHARE {
                issues.push(format!(
                    "{}: {:.1}% undefined after warm-up",
                    feature,
                    share * 100.0
                ));
            }
        }
        issues
    }

    /// Write every row (undefined values as empty cells) with a `valid` flag.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_writer(File::create(path)?);
        let mut header = vec!["date"];
        header.extend(Feature::names());
        header.extend(["target", "valid"]);
        writer.write_record(&header)?;

        let fmt = |v: f64| if v.is_nan() { String::new() } else { v.to_string() };
        for row in &self.rows {
            let mut record = Vec::with_capacity(NUM_FEATURES + 3);
            record.push(row.date.format("%Y-%m-%d").to_string());
            record.extend(row.values.iter().map(|&v| fmt(v)));
            record.push(fmt(row.target));
            record.push(if row.is_valid() { "1" } else { "0" }.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Derives the 16-column feature schema plus the next-period target.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    config: PipelineConfig,
}

impl FeatureEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Rows needed before at least one row can carry every feature and a
    /// target.
    pub fn min_history(&self) -> usize {
        self.config.warmup_rows() + 2
    }

    pub fn derive(
        &self,
        instrument: &str,
        rows: &[RawRecord],
        market: Option<&MarketSeries>,
    ) -> Result<FeatureTable> {
        let warnings = validate_raw(instrument, rows)?;
        if rows.len() < self.min_history() {
            return Err(PipelineError::InsufficientHistory {
                instrument: instrument.to_string(),
                rows: rows.len(),
                required: self.min_history(),
            });
        }

        let cfg = &self.config;
        let n = rows.len();
        let close: Vec<f64> = rows.iter().map(|r| r.close).collect();
        let volume: Vec<f64> = rows.iter().map(|r| r.volume).collect();

        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); NUM_FEATURES];

        // Price dynamics
        let log_return = log_returns(&close);
        let mean_short = rolling_mean(&log_return, cfg.short_window);
        let mean_long = rolling_mean(&log_return, cfg.long_window);
        let std_short = rolling_std(&log_return, cfg.short_window);
        let std_long = rolling_std(&log_return, cfg.long_window);

        // Volatility regime
        let true_range: Vec<f64> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let hl = r.high - r.low;
                if i == 0 {
                    return hl;
                }
                let prev_close = rows[i - 1].close;
                hl.max((r.high - prev_close).abs())
                    .max((r.low - prev_close).abs())
            })
            .collect();
        let atr = simple_moving_average(&true_range, cfg.atr_period)?;
        let atr_norm: Vec<f64> = atr.iter().zip(&close).map(|(a, c)| a / c).collect();
        let vol_ratio: Vec<f64> = std_short
            .iter()
            .zip(&std_long)
            .map(|(s, l)| s / (l + EPSILON))
            .collect();
        let vol_percentile = rolling_percentile_rank(&std_long, cfg.percentile_window)?;

        // Volume regime
        let vol_mean = rolling_mean(&volume, cfg.volume_window);
        let vol_std = rolling_std(&volume, cfg.volume_window);
        let vol_mean_long = rolling_mean(&volume, cfg.volume_long_window);
        let volume_z: Vec<f64> = (0..n)
            .map(|i| (volume[i] - vol_mean[i]) / (vol_std[i] + EPSILON))
            .collect();
        let relative_volume: Vec<f64> = (0..n)
            .map(|i| volume[i] / (vol_mean_long[i] + EPSILON))
            .collect();
        let volume_volatility: Vec<f64> = (0..n)
            .map(|i| vol_std[i] / (vol_mean[i] + EPSILON))
            .collect();

        // Trend context
        let sma_long = simple_moving_average(&close, cfg.long_window)?;
        let sma_trend = simple_moving_average(&close, cfg.trend_long_window)?;
        let dist = |sma: &[f64]| -> Vec<f64> {
            close
                .iter()
                .zip(sma)
                .map(|(c, s)| (c - s) / (s + EPSILON))
                .collect()
        };
        let dist_long = dist(&sma_long);
        let dist_trend = dist(&sma_trend);
        let trend_strength: Vec<f64> = mean_long
            .iter()
            .zip(&std_long)
            .map(|(m, s)| m.abs() / (s + EPSILON))
            .collect();

        // Market relative
        let (rel_return, beta) = match market {
            Some(series) => {
                let aligned: Vec<f64> = rows
                    .iter()
                    .map(|r| series.close_on(r.date).unwrap_or(f64::NAN))
                    .collect();
                let market_return = log_returns(&aligned);
                let rel: Vec<f64> = log_return
                    .iter()
                    .zip(&market_return)
                    .map(|(s, m)| s - m)
                    .collect();
                let beta = rolling_beta(&log_return, &market_return, cfg.beta_window);
                (rel, beta)
            }
            None => (vec![0.0; n], vec![1.0; n]),
        };

        columns[Feature::LogReturn.index()] = log_return;
        columns[Feature::MeanReturn5.index()] = mean_short;
        columns[Feature::MeanReturn20.index()] = mean_long;
        columns[Feature::StdReturn5.index()] = std_short;
        columns[Feature::StdReturn20.index()] = std_long;
        columns[Feature::AtrNorm.index()] = atr_norm;
        columns[Feature::VolRatio.index()] = vol_ratio;
        columns[Feature::VolPercentile.index()] = vol_percentile;
        columns[Feature::VolumeZ.index()] = volume_z;
        columns[Feature::RelativeVolume.index()] = relative_volume;
        columns[Feature::VolumeVolatility.index()] = volume_volatility;
        columns[Feature::DistSma20.index()] = dist_long;
        columns[Feature::DistSma50.index()] = dist_trend;
        columns[Feature::TrendStrength.index()] = trend_strength;
        columns[Feature::RelReturn.index()] = rel_return;
        columns[Feature::Beta20.index()] = beta;

        for feature in Feature::ALL {
            let column = &columns[feature.index()];
            if let Some(i) = column.iter().position(|v| v.is_infinite()) {
                return Err(PipelineError::NumericalDegeneracy {
                    instrument: instrument.to_string(),
                    feature: feature.name(),
                    date: rows[i].date,
                });
            }
        }

        let log_return = &columns[Feature::LogReturn.index()];
        let records: Vec<FeatureRecord> = (0..n)
            .map(|i| {
                let mut values = [f64::NAN; NUM_FEATURES];
                for (j, column) in columns.iter().enumerate() {
                    values[j] = column[i];
                }
                FeatureRecord {
                    date: rows[i].date,
                    values,
                    target: log_return.get(i + 1).copied().unwrap_or(f64::NAN),
                }
            })
            .collect();

        let table = FeatureTable {
            instrument: Arc::from(instrument),
            rows: records,
            warnings,
        };
        debug!(
            "{}: derived {} rows, {} valid",
            instrument,
            table.len(),
            table.valid_count()
        );
        Ok(table)
    }
}

/// `ln(x[i] / x[i-1])`; undefined on the first row and wherever either side
/// is undefined.
pub fn log_returns(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if i == 0 {
            out.push(f64::NAN);
        } else {
            out.push((values[i] / values[i - 1]).ln());
        }
    }
    out
}
