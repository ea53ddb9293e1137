//! End-to-end preparation: raw rows → features → splits → normalized
//! collections.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use rayon::prelude::*;

use crate::batch::{prefetch, BatchPlan, Prefetcher};
use crate::collection::{EntityCollection, Test, Train, Validation};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::{FeatureEngine, FeatureTable, MarketSeries};
use crate::normalizer::{FittedNormalizer, NormalizationStats, NormalizerTrainer};
use crate::split::{verify_collection, SplitBoundary, SplitExclusion, SplitName, TemporalSplitter};
use crate::source::RowSource;

#[derive(Debug)]
pub enum InstrumentOutcome {
    Built {
        raw_rows: usize,
        valid_rows: usize,
        warnings: Vec<String>,
    },
    /// Not enough history; expected for young listings
    Skipped(PipelineError),
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct InstrumentReport {
    pub instrument: String,
    pub outcome: InstrumentOutcome,
}

/// Per-instrument outcomes of a feature build, in instrument order.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub instruments: Vec<InstrumentReport>,
}

impl PipelineReport {
    pub fn built(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Built { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&InstrumentOutcome) -> bool) -> usize {
        self.instruments.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn outcome(&self, instrument: &str) -> Option<&InstrumentOutcome> {
        self.instruments
            .iter()
            .find(|r| r.instrument == instrument)
            .map(|r| &r.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PipelineError)> {
        self.instruments.iter().filter_map(|r| match &r.outcome {
            InstrumentOutcome::Failed(e) => Some((r.instrument.as_str(), e)),
            _ => None,
        })
    }

    pub fn summary(&self) -> String {
        let warned = self
            .instruments
            .iter()
            .filter(|r| matches!(&r.outcome, InstrumentOutcome::Built { warnings, .. } if !warnings.is_empty()))
            .count();
        format!(
            "{} instruments: {} built ({} with warnings), {} skipped, {} failed",
            self.instruments.len(),
            self.built(),
            warned,
            self.skipped(),
            self.failed()
        )
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for r in &self.instruments {
            match &r.outcome {
                InstrumentOutcome::Built {
                    raw_rows,
                    valid_rows,
                    warnings,
                } => {
                    writeln!(f, "  {:<12} built   {} raw / {} valid", r.instrument, raw_rows, valid_rows)?;
                    for w in warnings {
                        writeln!(f, "  {:<12}   warning: {}", "", w)?;
                    }
                }
                InstrumentOutcome::Skipped(e) => writeln!(f, "  {:<12} skipped {}", r.instrument, e)?,
                InstrumentOutcome::Failed(e) => writeln!(f, "  {:<12} FAILED  {}", r.instrument, e)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FeatureBuild {
    /// Full audited tables (warm-up rows included) of every built instrument
    pub tables: Vec<FeatureTable>,
    pub report: PipelineReport,
}

/// Normalized, windowed splits ready for consumption.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub boundary: SplitBoundary,
    pub normalizer: FittedNormalizer,
    pub train: EntityCollection<Train>,
    pub validation: EntityCollection<Validation>,
    pub test: EntityCollection<Test>,
    pub exclusions: Vec<SplitExclusion>,
}

impl PreparedDataset {
    pub fn stats(&self) -> &NormalizationStats {
        self.normalizer.stats()
    }

    /// Re-check the temporal and normalization invariants of the output.
    pub fn verify(&self) -> Result<()> {
        verify_collection(&self.train, SplitName::Train, &self.boundary)?;
        verify_collection(&self.validation, SplitName::Validation, &self.boundary)?;
        verify_collection(&self.test, SplitName::Test, &self.boundary)?;

        let stats = self.stats();
        if stats.fitted_rows() != self.train.feature_row_count() {
            return Err(PipelineError::LeakageViolation(format!(
                "normalizer fitted on {} rows, training split has {}",
                stats.fitted_rows(),
                self.train.feature_row_count()
            )));
        }
        let carried = [
            (SplitName::Train, self.train.stats()),
            (SplitName::Validation, self.validation.stats()),
            (SplitName::Test, self.test.stats()),
        ];
        for (split, carried) in carried {
            if carried != Some(stats) {
                return Err(PipelineError::LeakageViolation(format!(
                    "{split} split is not normalized with the training statistics"
                )));
            }
        }
        Ok(())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    engine: FeatureEngine,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let engine = FeatureEngine::new(&config);
        Ok(Self { config, engine })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &FeatureEngine {
        &self.engine
    }

    /// Load and derive one instrument, applying the raw and valid-row minimums.
    pub fn process_instrument<R: RowSource + ?Sized>(
        &self,
        source: &R,
        instrument: &str,
        market: Option<&MarketSeries>,
    ) -> Result<FeatureTable> {
        let rows = source.load(instrument)?;
        if rows.len() < self.config.min_raw_rows {
            return Err(PipelineError::InsufficientHistory {
                instrument: instrument.to_string(),
                rows: rows.len(),
                required: self.config.min_raw_rows,
            });
        }

        let mut table = self.engine.derive(instrument, &rows, market)?;
        for issue in table.quality_issues(self.config.warmup_rows()) {
            warn!("{}: {}", instrument, issue);
            table.warnings.push(issue);
        }

        let valid = table.valid_count();
        if valid < self.config.min_valid_rows {
            return Err(PipelineError::InsufficientHistory {
                instrument: instrument.to_string(),
                rows: valid,
                required: self.config.min_valid_rows,
            });
        }
        info!(
            "{}: {} rows, {} valid after dropping {} warm-up/undefined rows",
            instrument,
            table.len(),
            valid,
            table.len() - valid
        );
        Ok(table)
    }

    /// Derive features for every instrument of `source` in parallel.
    ///
    /// A failing instrument is recorded in the report and does not stop the
    /// others. In strict mode a structural failure (malformed input,
    /// numerical degeneracy) is returned as the run's error instead.
    pub fn build_features<R: RowSource + ?Sized>(
        &self,
        source: &R,
        market: Option<&MarketSeries>,
    ) -> Result<FeatureBuild> {
        let instruments = source.instruments()?;
        let total = instruments.len();
        info!("Deriving features for {} instruments", total);
        let processed = AtomicUsize::new(0);

        let results: Vec<(String, Result<FeatureTable>)> = instruments
            .into_par_iter()
            .map(|instrument| {
                let result = self.process_instrument(source, &instrument, market);
                let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 100 == 0 || count == total {
                    info!("Processed {}/{} instruments", count, total);
                }
                (instrument, result)
            })
            .collect();

        let mut tables = Vec::new();
        let mut report = PipelineReport::default();
        for (instrument, result) in results {
            let outcome = match result {
                Ok(table) => {
                    let outcome = InstrumentOutcome::Built {
                        raw_rows: table.len(),
                        valid_rows: table.valid_count(),
                        warnings: table.warnings.clone(),
                    };
                    tables.push(table);
                    outcome
                }
                Err(e @ PipelineError::InsufficientHistory { .. }) => {
                    warn!("Skipping {}", e);
                    InstrumentOutcome::Skipped(e)
                }
                Err(e) => {
                    if self.config.strict && e.is_structural() {
                        error!("Strict mode: aborting on {}", e);
                        return Err(e);
                    }
                    error!("Failed {}: {}", instrument, e);
                    InstrumentOutcome::Failed(e)
                }
            };
            report.instruments.push(InstrumentReport {
                instrument,
                outcome,
            });
        }
        info!("{}", report.summary());
        Ok(FeatureBuild { tables, report })
    }

    /// Split, window and normalize already-derived tables.
    ///
    /// Tables keep their undefined rows; windows are only cut inside runs of
    /// consecutive valid rows. The normalizer is fitted on the training
    /// collection before either of the other two collections is touched.
    pub fn prepare(&self, tables: &[FeatureTable]) -> Result<PreparedDataset> {
        let splitter = TemporalSplitter::new(&self.config)?;
        let splits = splitter.split(tables)?;
        splits.verify()?;
        for exclusion in &splits.exclusions {
            info!("{}", exclusion);
        }

        let normalizer = NormalizerTrainer::fit(&splits.train)?;
        let prepared = PreparedDataset {
            boundary: splits.boundary,
            train: splits.train.normalized(&normalizer),
            validation: splits.validation.normalized(&normalizer),
            test: splits.test.normalized(&normalizer),
            exclusions: splits.exclusions,
            normalizer,
        };
        prepared.verify()?;
        Ok(prepared)
    }

    /// One epoch of training batches, assembled on a worker thread
    /// `prefetch_depth` batches ahead of the consumer.
    pub fn train_batches(&self, prepared: &PreparedDataset) -> Prefetcher {
        let train = Arc::new(prepared.train.clone());
        let plan =
            BatchPlan::for_collection(&*train, self.config.batch_size, self.config.shuffle_seed);
        prefetch(train, plan, self.config.prefetch_depth)
    }

    /// `build_features` followed by `prepare`.
    pub fn run<R: RowSource + ?Sized>(
        &self,
        source: &R,
        market: Option<&MarketSeries>,
    ) -> Result<(PreparedDataset, PipelineReport)> {
        let build = self.build_features(source, market)?;
        let prepared = self.prepare(&build.tables)?;
        Ok((prepared, build.report))
    }
}
