#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use stock_seq::records::{MarketPoint, RawRecord};

pub fn day(offset: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + Duration::days(offset as i64)
}

/// Deterministic oscillating walk with consistent OHLC and non-constant volume.
pub fn wavy_rows(n: usize, first_day: usize, seed: f64) -> Vec<RawRecord> {
    let mut close = 40.0 + seed;
    (0..n)
        .map(|i| {
            let t = i as f64 + seed * 13.0;
            close *= 1.0 + 0.012 * (t * 0.29).sin() + 0.004 * (t * 1.7).cos();
            RawRecord {
                date: day(first_day + i),
                open: close * (1.0 - 0.003 * (t * 0.5).sin()),
                high: close * 1.012,
                low: close * 0.988,
                close,
                volume: 5_000.0 + 2_000.0 * (t * 0.21).sin().abs() + 100.0 * (t * 3.1).cos(),
            }
        })
        .collect()
}

/// `close[i] = start * ratio^i`.
pub fn geometric_rows(n: usize, start: f64, ratio: f64) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            let close = start * ratio.powi(i as i32);
            RawRecord {
                date: day(i),
                open: close,
                high: close * 1.005,
                low: close * 0.995,
                close,
                volume: 10_000.0 + (i % 7) as f64 * 250.0,
            }
        })
        .collect()
}

pub fn market_for(rows: &[RawRecord], seed: f64) -> Vec<MarketPoint> {
    let mut close = 1_000.0;
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            close *= 1.0 + 0.006 * ((i as f64 + seed) * 0.41).sin();
            MarketPoint { date: r.date, close }
        })
        .collect()
}

pub fn close_enough(a: f64, b: f64, tol: f64) -> bool {
    (a.is_nan() && b.is_nan()) || (a - b).abs() <= tol * a.abs().max(1.0)
}
