use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Instrument identifier shared by every row and window of one instrument.
pub type InstrumentId = Arc<str>;

pub const NUM_FEATURES: usize = 16;

/// One daily OHLCV observation. Rows of one instrument are date-sorted and
/// date-unique; the instrument identity lives on the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One close of the reference market index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketPoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// The fixed feature schema. The discriminant is the column index used in
/// every feature array and tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    // Price dynamics
    LogReturn = 0,
    MeanReturn5 = 1,
    MeanReturn20 = 2,
    StdReturn5 = 3,
    StdReturn20 = 4,
    // Volatility regime
    AtrNorm = 5,
    VolRatio = 6,
    VolPercentile = 7,
    // Volume regime
    VolumeZ = 8,
    RelativeVolume = 9,
    VolumeVolatility = 10,
    // Trend context
    DistSma20 = 11,
    DistSma50 = 12,
    TrendStrength = 13,
    // Market relative
    RelReturn = 14,
    Beta20 = 15,
}

impl Feature {
    pub const ALL: [Feature; NUM_FEATURES] = [
        Feature::LogReturn,
        Feature::MeanReturn5,
        Feature::MeanReturn20,
        Feature::StdReturn5,
        Feature::StdReturn20,
        Feature::AtrNorm,
        Feature::VolRatio,
        Feature::VolPercentile,
        Feature::VolumeZ,
        Feature::RelativeVolume,
        Feature::VolumeVolatility,
        Feature::DistSma20,
        Feature::DistSma50,
        Feature::TrendStrength,
        Feature::RelReturn,
        Feature::Beta20,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::LogReturn => "log_return_t",
            Feature::MeanReturn5 => "mean_return_5",
            Feature::MeanReturn20 => "mean_return_20",
            Feature::StdReturn5 => "std_return_5",
            Feature::StdReturn20 => "std_return_20",
            Feature::AtrNorm => "atr_14_norm",
            Feature::VolRatio => "vol_ratio",
            Feature::VolPercentile => "vol_percentile_252",
            Feature::VolumeZ => "volume_z",
            Feature::RelativeVolume => "relative_volume",
            Feature::VolumeVolatility => "volume_volatility",
            Feature::DistSma20 => "dist_ma20",
            Feature::DistSma50 => "dist_ma50",
            Feature::TrendStrength => "trend_strength",
            Feature::RelReturn => "rel_return",
            Feature::Beta20 => "beta_approx_20",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Feature::ALL.iter().map(|f| f.name()).collect()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A row of derived features for one date. Undefined values (warm-up, last
/// row's target, missing market date) are NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRecord {
    pub date: NaiveDate,
    pub values: [f64; NUM_FEATURES],
    /// Next-period log return
    pub target: f64,
}

impl FeatureRecord {
    #[inline]
    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    /// Usable for training/evaluation: every feature and the target defined.
    pub fn is_valid(&self) -> bool {
        self.target.is_finite() && self.values.iter().all(|v| v.is_finite())
    }
}
