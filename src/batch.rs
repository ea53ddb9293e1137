//! Backend-independent batch assembly and the producer/consumer queue.
//!
//! Numeric data is stacked into flat `f32` buffers; instrument ids and dates
//! travel in parallel lists and never enter the numeric buffers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use burn::data::dataset::Dataset;
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::collection::{EntityCollection, SplitKind};
use crate::error::{PipelineError, Result};
use crate::records::{InstrumentId, NUM_FEATURES};
use crate::window::WindowItem;

/// Stacked windows: features `[batch, window_len, NUM_FEATURES]` row-major,
/// targets `[batch]`, metadata indexed like the batch dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub features: Vec<f32>,
    pub shape: [usize; 3],
    pub targets: Vec<f32>,
    pub instruments: Vec<InstrumentId>,
    pub end_dates: Vec<NaiveDate>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    pub fn window_len(&self) -> usize {
        self.shape[1]
    }

    /// Flat features of item `i`, `window_len * NUM_FEATURES` values.
    pub fn window(&self, i: usize) -> Option<&[f32]> {
        let size = self.shape[1] * self.shape[2];
        self.features.get(i * size..(i + 1) * size)
    }

    /// Value of `feature` on the last row of item `i`'s window.
    pub fn last_step(&self, i: usize, feature: usize) -> Option<f32> {
        if feature >= self.shape[2] {
            return None;
        }
        let window = self.window(i)?;
        let last_row = window.len().checked_sub(self.shape[2])?;
        window.get(last_row + feature).copied()
    }
}

pub struct BatchAssembler;

impl BatchAssembler {
    pub fn assemble(items: Vec<WindowItem>) -> Result<HostBatch> {
        let window_len = items.first().map_or(0, |item| item.len());
        if let Some(other) = items.iter().find(|item| item.len() != window_len) {
            return Err(PipelineError::InvalidConfig(format!(
                "cannot stack windows of length {} and {}",
                window_len,
                other.len()
            )));
        }
        Ok(Self::stack(items, window_len))
    }

    /// Stack windows that all have `window_len` rows.
    pub(crate) fn stack(items: Vec<WindowItem>, window_len: usize) -> HostBatch {
        let mut features = Vec::with_capacity(items.len() * window_len * NUM_FEATURES);
        let mut targets = Vec::with_capacity(items.len());
        let mut instruments = Vec::with_capacity(items.len());
        let mut end_dates = Vec::with_capacity(items.len());

        for item in items {
            debug_assert_eq!(item.len(), window_len);
            for row in &item.features {
                features.extend_from_slice(row);
            }
            targets.push(item.target);
            instruments.push(item.instrument);
            end_dates.push(item.end_date);
        }

        HostBatch {
            shape: [targets.len(), window_len, NUM_FEATURES],
            features,
            targets,
            instruments,
            end_dates,
        }
    }

    /// Gather `indices` from `collection` and stack them.
    pub fn gather<S: SplitKind>(
        collection: &EntityCollection<S>,
        indices: &[usize],
    ) -> Result<HostBatch> {
        let items = indices
            .iter()
            .map(|&i| {
                collection.get(i).ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "index {} out of range for {} collection of {}",
                        i,
                        S::NAME,
                        collection.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(items)
    }
}

/// Fixed batch composition over one collection.
///
/// Training collections are permuted with a seeded RNG; validation and test
/// collections are always cut in global-index order. The choice follows the
/// split kind of the collection, there is no flag to override it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Vec<usize>>,
}

impl BatchPlan {
    pub fn for_collection<S: SplitKind>(
        collection: &EntityCollection<S>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let mut order: Vec<usize> = (0..collection.len()).collect();
        if S::SHUFFLE {
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        let batches = order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Self { batches }
    }

    pub fn batches(&self) -> &[Vec<usize>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Assemble batches lazily on the calling thread.
    pub fn iter<'a, S: SplitKind>(
        &'a self,
        collection: &'a EntityCollection<S>,
    ) -> impl Iterator<Item = Result<HostBatch>> + 'a {
        self.batches
            .iter()
            .map(move |indices| BatchAssembler::gather(collection, indices))
    }
}

/// Batches assembled on a worker thread, handed over through a bounded
/// channel so the producer never runs more than `depth` batches ahead.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<HostBatch>>>,
    worker: Option<JoinHandle<()>>,
}

pub fn prefetch<S: SplitKind>(
    collection: Arc<EntityCollection<S>>,
    plan: BatchPlan,
    depth: usize,
) -> Prefetcher {
    let (tx, rx) = bounded(depth.max(1));
    let worker = thread::spawn(move || {
        for (n, indices) in plan.batches.iter().enumerate() {
            let batch = BatchAssembler::gather(&*collection, indices);
            if tx.send(batch).is_err() {
                debug!("{} prefetch stopped after {} batches: consumer gone", S::NAME, n);
                return;
            }
        }
    });
    Prefetcher {
        receiver: Some(rx),
        worker: Some(worker),
    }
}

impl Iterator for Prefetcher {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // unblock a worker waiting on a full queue before joining it
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("batch prefetch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Test, Train};
    use crate::features::FeatureTable;
    use crate::records::FeatureRecord;
    use chrono::Duration;

    fn table(name: &str, n: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2023, 2, 1).unwrap();
        FeatureTable {
            instrument: Arc::from(name),
            rows: (0..n)
                .map(|i| {
                    let mut values = [0.0; NUM_FEATURES];
                    values[0] = i as f64;
                    values[15] = -(i as f64);
                    FeatureRecord {
                        date: start + Duration::days(i as i64),
                        values,
                        target: i as f64 * 0.01,
                    }
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn assemble_stacks_numbers_and_keeps_metadata_apart() {
        let coll = EntityCollection::<Test>::from_tables(vec![table("A", 6), table("B", 6)], 4, 1);
        // A has windows 0..3, B 3..6
        let batch = BatchAssembler::gather(&coll, &[0, 4]).unwrap();
        assert_eq!(batch.shape, [2, 4, NUM_FEATURES]);
        assert_eq!(batch.features.len(), 2 * 4 * NUM_FEATURES);
        assert_eq!(batch.instruments[0].as_ref(), "A");
        assert_eq!(batch.instruments[1].as_ref(), "B");
        assert_eq!(batch.end_dates[1], NaiveDate::from_ymd_opt(2023, 2, 5).unwrap());
        assert!((batch.targets[1] - 0.04).abs() < 1e-6);
        assert_eq!(batch.last_step(1, 0), Some(4.0));
        assert_eq!(batch.last_step(1, 15), Some(-4.0));
        assert_eq!(batch.window(0).map(|w| w[0]), Some(0.0));
        assert_eq!(batch.window(2), None);
        assert_eq!(batch.last_step(2, 0), None);
        assert_eq!(batch.last_step(0, NUM_FEATURES), None);
    }

    #[test]
    fn mixed_lengths_are_rejected() {
        let a = EntityCollection::<Test>::from_tables(vec![table("A", 6)], 4, 1)
            .get(0)
            .unwrap();
        let b = EntityCollection::<Test>::from_tables(vec![table("B", 6)], 3, 1)
            .get(0)
            .unwrap();
        assert!(BatchAssembler::assemble(vec![a, b]).is_err());
    }

    #[test]
    fn evaluation_plans_keep_origin_order() {
        let coll = EntityCollection::<Test>::from_tables(vec![table("A", 30)], 5, 1);
        let plan = BatchPlan::for_collection(&coll, 8, 7);
        let flat: Vec<usize> = plan.batches().iter().flatten().copied().collect();
        assert_eq!(flat, (0..coll.len()).collect::<Vec<_>>());
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn training_plans_are_seeded_permutations() {
        let coll = EntityCollection::<Train>::from_tables(vec![table("A", 60)], 5, 1);
        let a = BatchPlan::for_collection(&coll, 8, 42);
        let b = BatchPlan::for_collection(&coll, 8, 42);
        let c = BatchPlan::for_collection(&coll, 8, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut flat: Vec<usize> = a.batches().iter().flatten().copied().collect();
        assert_ne!(flat, (0..coll.len()).collect::<Vec<_>>());
        flat.sort_unstable();
        assert_eq!(flat, (0..coll.len()).collect::<Vec<_>>());
    }

    #[test]
    fn prefetch_yields_the_same_batches_in_order() {
        let coll = Arc::new(EntityCollection::<Test>::from_tables(
            vec![table("A", 40), table("B", 25)],
            5,
            2,
        ));
        let plan = BatchPlan::for_collection(&*coll, 4, 0);
        let direct: Vec<HostBatch> = plan.iter(&*coll).map(|b| b.unwrap()).collect();
        let fetched: Vec<HostBatch> = prefetch(Arc::clone(&coll), plan, 2)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(direct, fetched);
    }

    #[test]
    fn dropping_a_prefetcher_early_stops_the_worker() {
        let coll = Arc::new(EntityCollection::<Train>::from_tables(vec![table("A", 200)], 5, 1));
        let plan = BatchPlan::for_collection(&*coll, 2, 1);
        let mut fetcher = prefetch(coll, plan, 1);
        assert!(fetcher.next().is_some());
        drop(fetcher);
    }
}
