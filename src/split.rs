//! Date-based train/validation/test partitioning shared by all instruments.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use chrono::NaiveDate;
use log::{debug, info};

use crate::collection::{EntityCollection, SplitKind, Test, Train, Validation};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::records::InstrumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SplitName {
    Train,
    Validation,
    Test,
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SplitName::Train => Train::NAME,
            SplitName::Validation => Validation::NAME,
            SplitName::Test => Test::NAME,
        };
        f.write_str(name)
    }
}

/// The two cutoff dates every instrument is split on.
///
/// Train is `date <= train_end`, validation `train_end < date <= val_end`,
/// test `date > val_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBoundary {
    pub train_end: NaiveDate,
    pub val_end: NaiveDate,
    /// Distinct dates across all instruments the cutoffs were picked from
    pub distinct_dates: usize,
}

impl SplitBoundary {
    pub fn assign(&self, date: NaiveDate) -> SplitName {
        if date <= self.train_end {
            SplitName::Train
        } else if date <= self.val_end {
            SplitName::Validation
        } else {
            SplitName::Test
        }
    }

    /// Check that a span of dates lies entirely inside `split`.
    pub fn contains(&self, split: SplitName, first: NaiveDate, last: NaiveDate) -> bool {
        self.assign(first) == split && self.assign(last) == split
    }
}

/// One instrument's table cut into the three date ranges.
#[derive(Debug, Clone)]
pub struct Partition {
    pub train: FeatureTable,
    pub validation: FeatureTable,
    pub test: FeatureTable,
}

/// An instrument left out of one split because none of its unbroken runs of
/// valid rows in that split is as long as a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitExclusion {
    pub instrument: InstrumentId,
    pub split: SplitName,
    /// Longest run of consecutive valid rows the instrument has in the split
    pub rows: usize,
    pub required: usize,
}

impl fmt::Display for SplitExclusion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} excluded from {} (longest run {} rows, window needs {})",
            self.instrument, self.split, self.rows, self.required
        )
    }
}

/// Un-normalized per-split collections plus the boundary they were cut on.
#[derive(Debug, Clone)]
pub struct SplitCollections {
    pub boundary: SplitBoundary,
    pub train: EntityCollection<Train>,
    pub validation: EntityCollection<Validation>,
    pub test: EntityCollection<Test>,
    pub exclusions: Vec<SplitExclusion>,
}

impl SplitCollections {
    /// Re-check every window of every split against the boundary.
    pub fn verify(&self) -> Result<()> {
        verify_collection(&self.train, SplitName::Train, &self.boundary)?;
        verify_collection(&self.validation, SplitName::Validation, &self.boundary)?;
        verify_collection(&self.test, SplitName::Test, &self.boundary)
    }
}

#[derive(Debug, Clone)]
pub struct TemporalSplitter {
    train_ratio: f64,
    val_ratio: f64,
    window_len: usize,
    stride: usize,
}

impl TemporalSplitter {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            train_ratio: config.train_ratio,
            val_ratio: config.val_ratio,
            window_len: config.window_len,
            stride: config.stride,
        })
    }

    /// Cutoffs at the `train_ratio` and `train_ratio + val_ratio` positions of
    /// the sorted union of all valid-row dates.
    pub fn boundary(&self, tables: &[FeatureTable]) -> Result<SplitBoundary> {
        let dates: Vec<NaiveDate> = tables
            .iter()
            .flat_map(|t| t.valid_rows().map(|r| r.date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if dates.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "cannot split: no valid feature rows in any instrument".to_string(),
            ));
        }
        let n = dates.len();
        let position = |ratio: f64| ((n as f64 * ratio) as usize).min(n - 1);
        let boundary = SplitBoundary {
            train_end: dates[position(self.train_ratio)],
            val_end: dates[position(self.train_ratio + self.val_ratio)],
            distinct_dates: n,
        };
        info!(
            "Split cutoffs over {} distinct dates: train <= {}, validation <= {}, test after",
            n, boundary.train_end, boundary.val_end
        );
        Ok(boundary)
    }

    pub fn partition(&self, table: &FeatureTable, boundary: &SplitBoundary) -> Partition {
        let empty = || FeatureTable {
            instrument: table.instrument.clone(),
            rows: Vec::new(),
            warnings: table.warnings.clone(),
        };
        let mut out = Partition {
            train: empty(),
            validation: empty(),
            test: empty(),
        };
        for row in &table.rows {
            let target = match boundary.assign(row.date) {
                SplitName::Train => &mut out.train,
                SplitName::Validation => &mut out.validation,
                SplitName::Test => &mut out.test,
            };
            target.rows.push(*row);
        }
        out
    }

    /// Compute the boundary over `tables`, partition each one and window
    /// every unbroken run of valid rows inside each part.
    ///
    /// Tables are full feature histories; warm-up and other undefined rows
    /// split a part into several runs and never end up inside a window.
    pub fn split(&self, tables: &[FeatureTable]) -> Result<SplitCollections> {
        let boundary = self.boundary(tables)?;
        let mut train = Vec::new();
        let mut validation = Vec::new();
        let mut test = Vec::new();
        let mut exclusions = Vec::new();

        for table in tables {
            let parts = self.partition(table, &boundary);
            for (name, part, bucket) in [
                (SplitName::Train, parts.train, &mut train),
                (SplitName::Validation, parts.validation, &mut validation),
                (SplitName::Test, parts.test, &mut test),
            ] {
                let runs = part.valid_runs();
                let longest = runs.iter().map(FeatureTable::len).max().unwrap_or(0);
                let (kept, short): (Vec<_>, Vec<_>) =
                    runs.into_iter().partition(|r| r.len() >= self.window_len);
                if !short.is_empty() {
                    debug!(
                        "{}: {} run(s) in {} shorter than window {} dropped ({} rows)",
                        table.instrument,
                        short.len(),
                        name,
                        self.window_len,
                        short.iter().map(FeatureTable::len).sum::<usize>()
                    );
                }
                if kept.is_empty() {
                    exclusions.push(SplitExclusion {
                        instrument: Arc::clone(&table.instrument),
                        split: name,
                        rows: longest,
                        required: self.window_len,
                    });
                } else {
                    bucket.extend(kept);
                }
            }
        }

        let collections = SplitCollections {
            boundary,
            train: EntityCollection::from_tables(train, self.window_len, self.stride),
            validation: EntityCollection::from_tables(validation, self.window_len, self.stride),
            test: EntityCollection::from_tables(test, self.window_len, self.stride),
            exclusions,
        };
        info!(
            "Windows per split: train {} ({} instruments), validation {} ({}), test {} ({})",
            collections.train.len(),
            collections.train.num_instruments(),
            collections.validation.len(),
            collections.validation.num_instruments(),
            collections.test.len(),
            collections.test.num_instruments()
        );
        Ok(collections)
    }
}

/// Fails with `LeakageViolation` if any window of `collection` reaches
/// outside `split`'s date range.
pub fn verify_collection<S: SplitKind>(
    collection: &EntityCollection<S>,
    split: SplitName,
    boundary: &SplitBoundary,
) -> Result<()> {
    for dataset in collection.datasets() {
        for local in 0..dataset.len() {
            let Some(rows) = dataset.window_rows(local) else {
                continue;
            };
            let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
                continue;
            };
            if !boundary.contains(split, first.date, last.date) {
                return Err(PipelineError::LeakageViolation(format!(
                    "{} window {} spans {}..={} outside the {} range",
                    dataset.instrument(),
                    local,
                    first.date,
                    last.date,
                    split
                )));
            }
        }
    }
    Ok(())
}
