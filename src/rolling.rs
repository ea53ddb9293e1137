//! Trailing-window primitives.
//!
//! Every output at index `i` reads only inputs `..=i`. A window that is not
//! full yet, or that contains an undefined (NaN) input, yields NaN; partial
//! windows are never averaged.

use std::collections::VecDeque;
use std::fmt;

use ta::indicators::SimpleMovingAverage;
use ta::{Next, Period, Reset};

use crate::error::{PipelineError, Result};

fn window_at(values: &[f64], i: usize, window: usize) -> Option<&[f64]> {
    if window == 0 || i + 1 < window {
        return None;
    }
    let slice = &values[i + 1 - window..=i];
    if slice.iter().any(|v| v.is_nan()) {
        None
    } else {
        Some(slice)
    }
}

fn mean(slice: &[f64]) -> f64 {
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
fn sample_std(slice: &[f64]) -> f64 {
    if slice.len() < 2 {
        return f64::NAN;
    }
    let m = mean(slice);
    let ss: f64 = slice.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (slice.len() - 1) as f64).sqrt()
}

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| window_at(values, i, window).map_or(f64::NAN, mean))
        .collect()
}

pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| window_at(values, i, window).map_or(f64::NAN, sample_std))
        .collect()
}

/// Simple moving average of an always-defined series (closes, true ranges).
///
/// `ta`'s SMA emits a partial average while it warms up; those first
/// `period - 1` outputs are masked to NaN.
pub fn simple_moving_average(values: &[f64], period: usize) -> Result<Vec<f64>> {
    let mut sma = SimpleMovingAverage::new(period)
        .map_err(|e| PipelineError::InvalidConfig(format!("SMA({period}): {e:?}")))?;
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let out = sma.next(v);
            if i + 1 < period || v.is_nan() {
                f64::NAN
            } else {
                out
            }
        })
        .collect())
}

/// Trailing covariance(stock, market) / variance(market).
///
/// Market gaps inside the window drop the pair; the stock side must be fully
/// defined. Fewer than two usable pairs is undefined, a numerically flat
/// market falls back to a beta of 1.0.
pub fn rolling_beta(stock: &[f64], market: &[f64], window: usize) -> Vec<f64> {
    debug_assert_eq!(stock.len(), market.len());
    (0..stock.len())
        .map(|i| {
            let Some(s) = window_at(stock, i, window) else {
                return f64::NAN;
            };
            let m = &market[i + 1 - window..=i];
            let pairs: Vec<(f64, f64)> = s
                .iter()
                .zip(m)
                .filter(|(_, m)| m.is_finite())
                .map(|(&s, &m)| (s, m))
                .collect();
            if pairs.len() < 2 {
                return f64::NAN;
            }
            let n = pairs.len() as f64;
            let mean_s = pairs.iter().map(|p| p.0).sum::<f64>() / n;
            let mean_m = pairs.iter().map(|p| p.1).sum::<f64>() / n;
            let cov = pairs
                .iter()
                .map(|(s, m)| (s - mean_s) * (m - mean_m))
                .sum::<f64>()
                / (n - 1.0);
            let var = pairs.iter().map(|(_, m)| (m - mean_m).powi(2)).sum::<f64>() / (n - 1.0);
            if var < 1e-10 {
                1.0
            } else {
                cov / var
            }
        })
        .collect()
}

/// Percentile rank of the newest value among the trailing `period` values,
/// as a fraction in (0, 1]. Ties take the average rank.
#[derive(Debug, Clone)]
pub struct RollingPercentileRank {
    period: usize,
    values: VecDeque<f64>,
    undefined: usize,
}

impl RollingPercentileRank {
    pub fn new(period: usize) -> Result<Self> {
        if period == 0 {
            return Err(PipelineError::InvalidConfig(
                "percentile period must be positive".to_string(),
            ));
        }
        Ok(Self {
            period,
            values: VecDeque::with_capacity(period + 1),
            undefined: 0,
        })
    }
}

impl Period for RollingPercentileRank {
    fn period(&self) -> usize {
        self.period
    }
}

impl Next<f64> for RollingPercentileRank {
    type Output = f64;

    fn next(&mut self, input: f64) -> f64 {
        self.values.push_back(input);
        if input.is_nan() {
            self.undefined += 1;
        }
        if self.values.len() > self.period {
            if let Some(old) = self.values.pop_front() {
                if old.is_nan() {
                    self.undefined -= 1;
                }
            }
        }
        if self.values.len() < self.period || self.undefined > 0 {
            return f64::NAN;
        }

        let (less, equal) = self.values.iter().fold((0usize, 0usize), |(l, e), &v| {
            if v < input {
                (l + 1, e)
            } else if v == input {
                (l, e + 1)
            } else {
                (l, e)
            }
        });
        let rank = less as f64 + (equal as f64 + 1.0) / 2.0;
        rank / self.period as f64
    }
}

impl Reset for RollingPercentileRank {
    fn reset(&mut self) {
        self.values.clear();
        self.undefined = 0;
    }
}

impl fmt::Display for RollingPercentileRank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PCTRANK({})", self.period)
    }
}

pub fn rolling_percentile_rank(values: &[f64], period: usize) -> Result<Vec<f64>> {
    let mut rank = RollingPercentileRank::new(period)?;
    Ok(values.iter().map(|&v| rank.next(v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_requires_full_window() {
        let out = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-12);
        assert!((out[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn nan_inside_window_poisons_it() {
        let out = rolling_mean(&[f64::NAN, 1.0, 2.0, 3.0], 2);
        assert!(out[1].is_nan());
        assert!((out[2] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn std_is_sample_std() {
        let out = rolling_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        // population std is 2.0; sample std = sqrt(32 / 7)
        assert!((out[7] - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn sma_masks_warmup() {
        let out = simple_moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert!(out[0].is_nan() && out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-12);
        assert!((out[4] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn percentile_rank_of_increasing_series_is_one() {
        let values: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let out = rolling_percentile_rank(&values, 4).unwrap();
        assert!(out[2].is_nan());
        for v in &out[3..] {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn percentile_rank_averages_ties() {
        let out = rolling_percentile_rank(&[1.0, 1.0, 1.0, 1.0], 4).unwrap();
        // all equal: rank = (4 + 1) / 2 = 2.5 -> 0.625
        assert!((out[3] - 0.625).abs() < 1e-12);
    }

    #[test]
    fn percentile_rank_waits_for_nan_to_leave_window() {
        let out = rolling_percentile_rank(&[f64::NAN, 3.0, 1.0, 2.0, 4.0], 3).unwrap();
        assert!(out[2].is_nan());
        // window [3, 1, 2], newest 2 -> one below -> (1 + 1) / 3
        assert!((out[3] - 2.0 / 3.0).abs() < 1e-12);
        assert!((out[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn beta_of_scaled_market_is_the_scale() {
        let market: Vec<f64> = (0..30).map(|i| ((i as f64) * 0.7).sin() * 0.01).collect();
        let stock: Vec<f64> = market.iter().map(|m| 1.5 * m).collect();
        let out = rolling_beta(&stock, &market, 20);
        assert!(out[18].is_nan());
        for b in &out[19..] {
            assert!((b - 1.5).abs() < 1e-9, "beta {b}");
        }
    }

    #[test]
    fn beta_is_the_least_squares_slope() {
        let market = [0.01, -0.02, 0.03, 0.0];
        let stock = [0.02, -0.01, 0.05, 0.01];
        let out = rolling_beta(&stock, &market, 4);
        // sum(dm * ds) / sum(dm^2) = 0.00155 / 0.0013, not cov / population var
        assert!((out[3] - 31.0 / 26.0).abs() < 1e-9, "beta {}", out[3]);
    }

    #[test]
    fn beta_without_two_pairs_stays_undefined() {
        let market = [f64::NAN, f64::NAN, f64::NAN, 0.01];
        let stock = [0.02, -0.01, 0.05, 0.01];
        let out = rolling_beta(&stock, &market, 4);
        assert!(out[3].is_nan());
    }

    #[test]
    fn flat_market_beta_falls_back_to_one() {
        let market = vec![0.0; 25];
        let stock: Vec<f64> = (0..25).map(|i| i as f64 * 0.001).collect();
        let out = rolling_beta(&stock, &market, 20);
        assert!((out[24] - 1.0).abs() < 1e-12);
    }
}
