//! Multi-instrument window collections tagged with the split they came from.
//!
//! The split tag is a type parameter, so code that must only ever see
//! training data (fitting the normalizer, shuffled sampling) can demand an
//! `EntityCollection<Train>` and reject the other two at compile time.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use burn::data::dataset::Dataset;

use crate::features::FeatureTable;
use crate::normalizer::{FittedNormalizer, NormalizationStats};
use crate::records::{FeatureRecord, InstrumentId};
use crate::window::{SequenceDataset, WindowItem};

mod sealed {
    pub trait Sealed {}
}

pub trait SplitKind: sealed::Sealed + Debug + Send + Sync + 'static {
    const NAME: &'static str;
    /// Whether batches from this split may be drawn in shuffled order.
    const SHUFFLE: bool;
}

#[derive(Debug, Clone, Copy)]
pub struct Train;
#[derive(Debug, Clone, Copy)]
pub struct Validation;
#[derive(Debug, Clone, Copy)]
pub struct Test;

impl sealed::Sealed for Train {}
impl sealed::Sealed for Validation {}
impl sealed::Sealed for Test {}

impl SplitKind for Train {
    const NAME: &'static str = "train";
    const SHUFFLE: bool = true;
}

impl SplitKind for Validation {
    const NAME: &'static str = "validation";
    const SHUFFLE: bool = false;
}

impl SplitKind for Test {
    const NAME: &'static str = "test";
    const SHUFFLE: bool = false;
}

/// All windows of one split across instruments, behind a single flat index.
///
/// `index[g] = (dataset slot, local window)` is an arena of pairs, so a
/// random global index resolves in O(1).
#[derive(Debug)]
pub struct EntityCollection<S: SplitKind> {
    datasets: Vec<SequenceDataset>,
    index: Vec<(usize, usize)>,
    stats: Option<Arc<NormalizationStats>>,
    _split: PhantomData<S>,
}

impl<S: SplitKind> Clone for EntityCollection<S> {
    fn clone(&self) -> Self {
        Self {
            datasets: self.datasets.clone(),
            index: self.index.clone(),
            stats: self.stats.clone(),
            _split: PhantomData,
        }
    }
}

impl<S: SplitKind> EntityCollection<S> {
    /// Only the splitter creates tagged collections. An instrument may
    /// contribute several tables (one per unbroken run of rows); they keep
    /// their relative order.
    pub(crate) fn from_tables(
        mut tables: Vec<FeatureTable>,
        window_len: usize,
        stride: usize,
    ) -> Self {
        tables.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        let datasets = tables
            .into_iter()
            .map(|t| SequenceDataset::from_parts(Arc::new(t), window_len, stride))
            .collect();
        Self::from_datasets(datasets, None)
    }

    fn from_datasets(datasets: Vec<SequenceDataset>, stats: Option<Arc<NormalizationStats>>) -> Self {
        let index = datasets
            .iter()
            .enumerate()
            .flat_map(|(slot, ds)| (0..ds.len()).map(move |local| (slot, local)))
            .collect();
        Self {
            datasets,
            index,
            stats,
            _split: PhantomData,
        }
    }

    pub fn split_name(&self) -> &'static str {
        S::NAME
    }

    pub fn datasets(&self) -> &[SequenceDataset] {
        &self.datasets
    }

    /// Distinct instruments, in collection order.
    pub fn instruments(&self) -> Vec<InstrumentId> {
        let mut out: Vec<InstrumentId> =
            self.datasets.iter().map(|d| d.instrument().clone()).collect();
        out.dedup();
        out
    }

    pub fn num_instruments(&self) -> usize {
        self.instruments().len()
    }

    /// Map a global index to `(instrument, local window index)`.
    pub fn locate(&self, index: usize) -> Option<(&InstrumentId, usize)> {
        let &(slot, local) = self.index.get(index)?;
        Some((self.datasets[slot].instrument(), local))
    }

    /// Every feature row held by this split, windows or not.
    pub fn feature_rows(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.datasets.iter().flat_map(|d| d.table().rows.iter())
    }

    pub fn feature_row_count(&self) -> usize {
        self.datasets.iter().map(|d| d.table().len()).sum()
    }

    /// Statistics this collection was normalized with, if any.
    pub fn stats(&self) -> Option<&NormalizationStats> {
        self.stats.as_deref()
    }

    pub fn is_normalized(&self) -> bool {
        self.stats.is_some()
    }

    /// A copy with every table standardized by `normalizer`.
    pub fn normalized(&self, normalizer: &FittedNormalizer) -> Self {
        let datasets = self
            .datasets
            .iter()
            .map(|d| {
                SequenceDataset::from_parts(
                    Arc::new(normalizer.apply(d.table())),
                    d.window_len(),
                    d.stride(),
                )
            })
            .collect();
        Self::from_datasets(datasets, Some(normalizer.shared_stats()))
    }
}

impl<S: SplitKind> Dataset<WindowItem> for EntityCollection<S> {
    fn get(&self, index: usize) -> Option<WindowItem> {
        let &(slot, local) = self.index.get(index)?;
        self.datasets[slot].get(local)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
