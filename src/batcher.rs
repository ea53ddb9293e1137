use std::marker::PhantomData;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use chrono::NaiveDate;
use log::error;

use crate::batch::{BatchAssembler, HostBatch};
use crate::collection::{EntityCollection, SplitKind, Test, Train, Validation};
use crate::records::InstrumentId;
use crate::window::WindowItem;

#[derive(Clone, Debug)]
pub struct WindowBatch<B: Backend> {
    /// `[batch, window_len, features]`
    pub inputs: Tensor<B, 3>,
    /// `[batch]`
    pub targets: Tensor<B, 1>,
    pub instruments: Vec<InstrumentId>,
    pub end_dates: Vec<NaiveDate>,
}

impl<B: Backend> WindowBatch<B> {
    pub fn from_host(host: HostBatch, device: &B::Device) -> Self {
        let n = host.targets.len();
        let inputs = Tensor::<B, 3>::from_floats(
            TensorData::new(host.features, host.shape.to_vec()),
            device,
        );
        let targets = Tensor::<B, 1>::from_floats(TensorData::new(host.targets, vec![n]), device);
        Self {
            inputs,
            targets,
            instruments: host.instruments,
            end_dates: host.end_dates,
        }
    }
}

pub struct WindowBatcher<B: Backend> {
    _b: PhantomData<B>,
}

impl<B: Backend> WindowBatcher<B> {
    pub fn new() -> Self {
        Self { _b: PhantomData }
    }
}

impl<B: Backend> Default for WindowBatcher<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Clone for WindowBatcher<B> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<B: Backend> Batcher<B, WindowItem, WindowBatch<B>> for WindowBatcher<B> {
    fn batch(&self, items: Vec<WindowItem>, device: &B::Device) -> WindowBatch<B> {
        // windows from one collection share a length; anything else is dropped
        let window_len = items.first().map_or(0, |i| i.len());
        let (items, mismatched): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|i| i.len() == window_len);
        if !mismatched.is_empty() {
            error!(
                "Dropped {} windows whose length differs from {}",
                mismatched.len(),
                window_len
            );
        }
        WindowBatch::from_host(BatchAssembler::stack(items, window_len), device)
    }
}

pub struct DataLoaders<B: Backend> {
    pub train: Arc<dyn DataLoader<B, WindowBatch<B>>>,
    pub validation: Arc<dyn DataLoader<B, WindowBatch<B>>>,
    pub test: Arc<dyn DataLoader<B, WindowBatch<B>>>,
}

fn loader<B: Backend, S: SplitKind>(
    collection: EntityCollection<S>,
    batch_size: usize,
    seed: u64,
    num_workers: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, WindowBatch<B>>> {
    let mut builder = DataLoaderBuilder::new(WindowBatcher::<B>::new())
        .batch_size(batch_size)
        .set_device(device.clone());
    // evaluation splits stay single-threaded so batches arrive in index order
    if S::SHUFFLE {
        builder = builder.shuffle(seed);
        if num_workers > 1 {
            builder = builder.num_workers(num_workers);
        }
    }
    builder.build(collection)
}

/// Wrap the three normalized collections into burn data loaders.
pub fn build_dataloaders<B: Backend>(
    train: EntityCollection<Train>,
    validation: EntityCollection<Validation>,
    test: EntityCollection<Test>,
    batch_size: usize,
    seed: u64,
    num_workers: usize,
    device: &B::Device,
) -> DataLoaders<B> {
    DataLoaders {
        train: loader(train, batch_size, seed, num_workers, device),
        validation: loader(validation, batch_size, seed, num_workers, device),
        test: loader(test, batch_size, seed, num_workers, device),
    }
}
