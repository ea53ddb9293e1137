//! Raw row acquisition.
//!
//! The core never talks to a data vendor. It asks a [`RowSource`] for the
//! ordered OHLCV rows of one instrument; each call may fail on its own
//! without affecting other instruments.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Weekday};
use log::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::records::{MarketPoint, RawRecord};

/// Name errors about the reference index are reported under.
pub const MARKET_LABEL: &str = "market index";

// Data-quality thresholds, as shares of the instrument's rows
const MAX_MISSING_BUSINESS_DAYS: f64 = 0.05;
const MAX_ZERO_VOLUME_DAYS: f64 = 0.10;
const MAX_UNCHANGED_CLOSE_DAYS: f64 = 0.05;
/// Single-day close-to-close change treated as a likely data error
const EXTREME_MOVE: f64 = 0.5;

pub trait RowSource: Send + Sync {
    /// Instruments this source can produce, in a stable order.
    fn instruments(&self) -> Result<Vec<String>>;

    /// Date-sorted rows of one instrument.
    fn load(&self, instrument: &str) -> Result<Vec<RawRecord>>;
}

/// A directory with one `<instrument>.csv` per instrument and the columns
/// `date,open,high,low,close,volume` (extra columns are ignored).
#[derive(Debug, Clone)]
pub struct CsvRowSource {
    dir: PathBuf,
    excluded: HashSet<String>,
}

impl CsvRowSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            excluded: HashSet::new(),
        }
    }

    /// Skip files by stem, e.g. the market index stored next to the stocks.
    pub fn excluding<I, S>(mut self, stems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(stems.into_iter().map(Into::into));
        self
    }

    fn path_for(&self, instrument: &str) -> PathBuf {
        self.dir.join(format!("{instrument}.csv"))
    }
}

impl RowSource for CsvRowSource {
    fn instruments(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !self.excluded.contains(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, instrument: &str) -> Result<Vec<RawRecord>> {
        let path = self.path_for(instrument);
        debug!("Loading {} from {}", instrument, path.display());
        let file = File::open(&path)?;
        let mut reader = csv::Reader::from_reader(file);
        let mut rows = Vec::new();
        for (line, result) in reader.deserialize::<RawRecord>().enumerate() {
            let row = result.map_err(|e| {
                PipelineError::malformed(instrument, format!("row {}: {e}", line + 1))
            })?;
            rows.push(row);
        }
        // Files are not trusted to be ordered; duplicates survive the sort and
        // are caught by `validate_raw`.
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }
}

/// Fixed rows held in memory, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRowSource {
    tables: BTreeMap<String, Vec<RawRecord>>,
}

impl InMemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>, rows: Vec<RawRecord>) -> Self {
        self.tables.insert(instrument.into(), rows);
        self
    }

    pub fn insert(&mut self, instrument: impl Into<String>, rows: Vec<RawRecord>) {
        self.tables.insert(instrument.into(), rows);
    }
}

impl RowSource for InMemoryRowSource {
    fn instruments(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn load(&self, instrument: &str) -> Result<Vec<RawRecord>> {
        self.tables
            .get(instrument)
            .cloned()
            .ok_or_else(|| PipelineError::malformed(instrument, "instrument not found in source"))
    }
}

/// Load a `{date, close}` index series, sorted by date.
pub fn load_market_index<P: AsRef<Path>>(path: P) -> Result<Vec<MarketPoint>> {
    let path = path.as_ref();
    let label = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("market index")
        .to_string();
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let mut points = Vec::new();
    for result in reader.deserialize::<MarketPoint>() {
        let point = result.map_err(|e| PipelineError::malformed(&label, e.to_string()))?;
        points.push(point);
    }
    points.sort_by_key(|p| p.date);
    validate_market(&label, &points)?;
    Ok(points)
}

/// Date-sorted index points must have unique dates and positive finite closes.
pub fn validate_market(label: &str, points: &[MarketPoint]) -> Result<()> {
    for pair in points.windows(2) {
        if pair[1].date <= pair[0].date {
            return Err(PipelineError::malformed(
                label,
                format!("dates not increasing at {} -> {}", pair[0].date, pair[1].date),
            ));
        }
    }
    if let Some(bad) = points.iter().find(|p| !p.close.is_finite() || p.close <= 0.0) {
        return Err(PipelineError::malformed(
            label,
            format!("non-positive close {} on {}", bad.close, bad.date),
        ));
    }
    Ok(())
}

/// Check the structural contract of one instrument's raw table.
///
/// Returns non-fatal warnings (OHLC inconsistencies and the data-quality
/// checks of [`quality_warnings`]); ordering, duplicate dates and
/// non-positive prices are fatal for the instrument.
pub fn validate_raw(instrument: &str, rows: &[RawRecord]) -> Result<Vec<String>> {
    for pair in rows.windows(2) {
        if pair[1].date == pair[0].date {
            return Err(PipelineError::malformed(
                instrument,
                format!("duplicate date {}", pair[1].date),
            ));
        }
        if pair[1].date < pair[0].date {
            return Err(PipelineError::malformed(
                instrument,
                format!("dates not increasing at {} -> {}", pair[0].date, pair[1].date),
            ));
        }
    }

    for row in rows {
        let prices = [
            ("open", row.open),
            ("high", row.high),
            ("low", row.low),
            ("close", row.close),
        ];
        for (column, value) in prices {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipelineError::malformed(
                    instrument,
                    format!("non-positive {column} {value} on {}", row.date),
                ));
            }
        }
        if !row.volume.is_finite() || row.volume < 0.0 {
            return Err(PipelineError::malformed(
                instrument,
                format!("invalid volume {} on {}", row.volume, row.date),
            ));
        }
    }

    let mut warnings = Vec::new();
    let checks: [(&str, fn(&RawRecord) -> bool); 4] = [
        ("high < open", |r| r.high < r.open),
        ("high < close", |r| r.high < r.close),
        ("low > open", |r| r.low > r.open),
        ("low > close", |r| r.low > r.close),
    ];
    for (label, violates) in checks {
        let count = rows.iter().filter(|r| violates(r)).count();
        if count > 0 {
            warn!("{}: {} rows where {}", instrument, count, label);
            warnings.push(format!("{count} rows where {label}"));
        }
    }
    for warning in quality_warnings(rows) {
        warn!("{}: {}", instrument, warning);
        warnings.push(warning);
    }
    Ok(warnings)
}

/// Signs of stale or patchy data: missing business days, zero-volume days,
/// extreme single-day moves and unchanged closes.
pub fn quality_warnings(rows: &[RawRecord]) -> Vec<String> {
    let mut warnings = Vec::new();
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return warnings;
    };
    let n = rows.len() as f64;

    let business_days = first
        .date
        .iter_days()
        .take_while(|d| *d <= last.date)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .count();
    let missing = business_days.saturating_sub(rows.len());
    if business_days > 0 {
        let share = missing as f64 / business_days as f64;
        if share > MAX_MISSING_BUSINESS_DAYS {
            warnings.push(format!(
                "{missing} missing business days ({:.1}%)",
                share * 100.0
            ));
        }
    }

    let zero_volume = rows.iter().filter(|r| r.volume == 0.0).count();
    if zero_volume as f64 / n > MAX_ZERO_VOLUME_DAYS {
        warnings.push(format!(
            "{:.1}% zero-volume days",
            zero_volume as f64 / n * 100.0
        ));
    }

    let extreme = rows
        .windows(2)
        .filter(|p| (p[1].close / p[0].close - 1.0).abs() > EXTREME_MOVE)
        .count();
    if extreme > 0 {
        warnings.push(format!(
            "{extreme} extreme price moves (>{:.0}%)",
            EXTREME_MOVE * 100.0
        ));
    }

    let unchanged = rows.windows(2).filter(|p| p[1].close == p[0].close).count();
    if unchanged as f64 / n > MAX_UNCHANGED_CLOSE_DAYS {
        warnings.push(format!(
            "{:.1}% days with no price change",
            unchanged as f64 / n * 100.0
        ));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::tempdir;

    fn row(day: u32, close: f64) -> RawRecord {
        RawRecord {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn duplicate_dates_are_malformed() {
        let rows = vec![row(1, 10.0), row(1, 11.0)];
        let err = validate_raw("DUP", &rows).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { ref instrument, .. } if instrument == "DUP"));
    }

    #[test]
    fn decreasing_dates_are_malformed() {
        let rows = vec![row(2, 10.0), row(1, 11.0)];
        assert!(validate_raw("REV", &rows).is_err());
    }

    #[test]
    fn zero_price_is_malformed() {
        let rows = vec![row(1, 10.0), row(2, 0.0)];
        assert!(validate_raw("ZERO", &rows).is_err());
    }

    #[test]
    fn zero_volume_is_a_warning_not_an_error() {
        let mut rows = vec![row(4, 10.0), row(5, 11.0)];
        rows[1].volume = 0.0;
        let warnings = validate_raw("HALT", &rows).unwrap();
        assert_eq!(warnings, vec!["50.0% zero-volume days".to_string()]);
    }

    #[test]
    fn ohlc_inconsistency_is_a_warning() {
        let mut rows = vec![row(4, 10.0), row(5, 11.0)];
        // below the close but not below the open
        rows[1].open = 10.0;
        rows[1].high = 10.5;
        let warnings = validate_raw("ODD", &rows).unwrap();
        assert_eq!(warnings, vec!["1 rows where high < close".to_string()]);
    }

    /// Mon 2024-03-04 onwards, skipping weekends, closes drifting upwards.
    fn business_rows(n: usize) -> Vec<RawRecord> {
        let mut date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let mut rows = Vec::with_capacity(n);
        while rows.len() < n {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                let close = 20.0 + rows.len() as f64 * 0.1;
                rows.push(RawRecord {
                    date,
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 500.0,
                });
            }
            date = date.succ_opt().unwrap();
        }
        rows
    }

    #[test]
    fn clean_business_day_history_has_no_quality_warnings() {
        assert!(quality_warnings(&business_rows(100)).is_empty());
    }

    #[test]
    fn quality_checks_flag_patchy_data() {
        // every fourth business day missing: 25% gaps
        let gappy: Vec<RawRecord> = business_rows(120)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % 4 != 3)
            .map(|(_, r)| r)
            .collect();
        let warnings = quality_warnings(&gappy);
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].contains("missing business days"));

        let mut rows = business_rows(100);
        for r in rows.iter_mut().take(11) {
            r.volume = 0.0;
        }
        rows[50].close = rows[49].close * 2.5;
        let flat = rows[69].close;
        for r in &mut rows[70..77] {
            r.close = flat;
        }
        let warnings = quality_warnings(&rows);
        assert!(warnings.iter().any(|w| w == "11.0% zero-volume days"), "{warnings:?}");
        // the jump up and the drop back
        assert!(warnings.iter().any(|w| w.starts_with("2 extreme price moves")), "{warnings:?}");
        assert!(warnings.iter().any(|w| w == "7.0% days with no price change"), "{warnings:?}");
    }

    #[test]
    fn csv_source_lists_and_sorts() {
        let dir = tempdir().unwrap();
        let mut f = File::create(dir.path().join("AAA.csv")).unwrap();
        writeln!(f, "date,open,high,low,close,volume,adj_close").unwrap();
        writeln!(f, "2024-03-05,10,11,9,10.5,100,10.4").unwrap();
        writeln!(f, "2024-03-04,9,10,8,9.5,120,9.4").unwrap();
        File::create(dir.path().join("INDEX.csv")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let source = CsvRowSource::new(dir.path()).excluding(["INDEX"]);
        assert_eq!(source.instruments().unwrap(), vec!["AAA".to_string()]);

        let rows = source.load("AAA").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert!((rows[1].close - 10.5).abs() < 1e-12);
    }

    #[test]
    fn csv_missing_column_is_malformed() {
        let dir = tempdir().unwrap();
        let mut f = File::create(dir.path().join("BAD.csv")).unwrap();
        writeln!(f, "date,open,high,low,volume").unwrap();
        writeln!(f, "2024-03-05,10,11,9,100").unwrap();

        let err = CsvRowSource::new(dir.path()).load("BAD").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { .. }));
    }

    #[test]
    fn market_index_loads_date_and_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("NSEI.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "date,open,close").unwrap();
        writeln!(f, "2024-03-05,1,101.5").unwrap();
        writeln!(f, "2024-03-04,1,100.0").unwrap();

        let points = load_market_index(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[0].close - 100.0).abs() < 1e-12);
    }

    #[test]
    fn market_index_rejects_non_positive_closes() {
        let dir = tempdir().unwrap();
        for close in ["0", "-3.5"] {
            let path = dir.path().join("IDX.csv");
            let mut f = File::create(&path).unwrap();
            writeln!(f, "date,close").unwrap();
            writeln!(f, "2024-03-04,100.0").unwrap();
            writeln!(f, "2024-03-05,{close}").unwrap();
            drop(f);

            let err = load_market_index(&path).unwrap_err();
            assert!(
                matches!(err, PipelineError::MalformedInput { ref instrument, .. } if instrument == "IDX"),
                "close {close}: {err}"
            );
        }
    }
}
