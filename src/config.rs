use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Options recognised by the feature engine, splitter and batch assembly.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Window length `L` (rows per model input)
    pub window_len: usize,
    /// Step between consecutive window starts
    pub stride: usize,
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub test_ratio: f64,

    pub atr_period: usize,
    /// Short rolling window for return mean/std
    pub short_window: usize,
    /// Long rolling window for return mean/std, SMA distance and trend strength
    pub long_window: usize,
    /// Trailing rows used for the volatility percentile rank
    pub percentile_window: usize,
    pub volume_window: usize,
    pub volume_long_window: usize,
    pub trend_long_window: usize,
    pub beta_window: usize,

    /// Instruments with fewer raw rows are skipped before feature derivation
    pub min_raw_rows: usize,
    /// Instruments with fewer fully-defined feature rows are skipped after it
    pub min_valid_rows: usize,

    pub batch_size: usize,
    pub shuffle_seed: u64,
    /// Capacity of the bounded queue between batch assembly and the consumer
    pub prefetch_depth: usize,

    /// Escalate per-instrument malformed input / numerical degeneracy to a
    /// run-level failure
    pub strict: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_len: 20,
            stride: 1,
            train_ratio: 0.70,
            val_ratio: 0.15,
            test_ratio: 0.15,
            atr_period: 14,
            short_window: 5,
            long_window: 20,
            percentile_window: 252,
            volume_window: 20,
            volume_long_window: 50,
            trend_long_window: 50,
            beta_window: 20,
            min_raw_rows: 300,
            min_valid_rows: 252,
            batch_size: 128,
            shuffle_seed: 42,
            prefetch_depth: 4,
            strict: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("train_ratio", self.train_ratio),
            ("val_ratio", self.val_ratio),
            ("test_ratio", self.test_ratio),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        let sum = self.train_ratio + self.val_ratio + self.test_ratio;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::InvalidConfig(format!(
                "split ratios must sum to 1, got {sum}"
            )));
        }
        if self.train_ratio <= 0.0 {
            return Err(PipelineError::InvalidConfig(
                "train_ratio must be positive".to_string(),
            ));
        }
        if self.window_len == 0 || self.stride == 0 || self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "window_len, stride and batch_size must be at least 1".to_string(),
            ));
        }

        let lookbacks = [
            ("atr_period", self.atr_period),
            ("short_window", self.short_window),
            ("long_window", self.long_window),
            ("percentile_window", self.percentile_window),
            ("volume_window", self.volume_window),
            ("volume_long_window", self.volume_long_window),
            ("trend_long_window", self.trend_long_window),
            ("beta_window", self.beta_window),
        ];
        for (name, value) in lookbacks {
            if value < 2 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be at least 2, got {value}"
                )));
            }
        }
        if self.prefetch_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "prefetch_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Index of the first row on which every feature can be defined, given
    /// the configured lookbacks. The volatility percentile dominates with the
    /// defaults: 20 rows for the first 20-day std plus 251 more for a full
    /// 252-value rank window.
    pub fn warmup_rows(&self) -> usize {
        let vol_std_first = self.long_window;
        let percentile_first = vol_std_first + self.percentile_window - 1;
        [
            percentile_first,
            self.short_window,
            self.atr_period - 1,
            self.volume_window - 1,
            self.volume_long_window - 1,
            self.trend_long_window - 1,
            self.beta_window,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}
