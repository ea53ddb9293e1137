use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use burn::data::dataset::Dataset;
use clap::Parser;
use log::info;

use stock_seq::batch::BatchPlan;
use stock_seq::batcher::build_dataloaders;
use stock_seq::config::PipelineConfig;
use stock_seq::evaluation::{evaluate, LinearBaseline, MeanBaseline, NaiveBaseline};
use stock_seq::features::MarketSeries;
use stock_seq::pipeline::Pipeline;
use stock_seq::source::{load_market_index, CsvRowSource};

#[derive(Parser, Debug)]
#[command(name = "prepare_dataset")]
struct Cli {
    /// Directory with one <instrument>.csv per instrument
    #[arg(long)]
    input: PathBuf,

    /// Reference index CSV with date and close columns
    #[arg(long)]
    market_index: Option<PathBuf>,

    /// Where the training normalization statistics are written
    #[arg(long)]
    stats_out: PathBuf,

    /// JSON file overriding the default configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    window_len: Option<usize>,

    #[arg(long)]
    stride: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Worker threads of the training data loader
    #[arg(long, default_value_t = 2)]
    loader_workers: usize,

    #[arg(long, default_value_t = false)]
    strict: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(v) = cli.window_len {
        config.window_len = v;
    }
    if let Some(v) = cli.stride {
        config.stride = v;
    }
    if let Some(v) = cli.batch_size {
        config.batch_size = v;
    }
    config.strict |= cli.strict;
    let pipeline = Pipeline::new(config)?;

    let market = match &cli.market_index {
        Some(path) => Some(MarketSeries::new(
            &load_market_index(path)
                .with_context(|| format!("loading market index {}", path.display()))?,
        )?),
        None => None,
    };
    let index_stem = cli
        .market_index
        .as_ref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .map(String::from);
    let source = CsvRowSource::new(&cli.input).excluding(index_stem);

    let (prepared, report) = pipeline.run(&source, market.as_ref())?;
    print!("{}", report);

    prepared
        .stats()
        .save_json(&cli.stats_out)
        .with_context(|| format!("writing {}", cli.stats_out.display()))?;
    info!("Wrote normalization statistics to {}", cli.stats_out.display());

    println!(
        "Cutoffs: train <= {}, validation <= {}",
        prepared.boundary.train_end, prepared.boundary.val_end
    );
    println!(
        "Windows: train {}, validation {}, test {}",
        prepared.train.len(),
        prepared.validation.len(),
        prepared.test.len()
    );
    for exclusion in &prepared.exclusions {
        println!("  {}", exclusion);
    }

    let mut epoch_batches = 0;
    let mut epoch_windows = 0;
    for batch in pipeline.train_batches(&prepared) {
        epoch_windows += batch?.len();
        epoch_batches += 1;
    }
    println!(
        "Training epoch: {} batches, {} windows",
        epoch_batches, epoch_windows
    );

    let cfg = pipeline.config();
    let device = Default::default();
    let loaders = build_dataloaders::<NdArray<f32>>(
        prepared.train.clone(),
        prepared.validation.clone(),
        prepared.test.clone(),
        cfg.batch_size,
        cfg.shuffle_seed,
        cli.loader_workers,
        &device,
    );
    if let Some(batch) = loaders.train.iter().next() {
        println!(
            "Tensor check: train inputs {:?}, targets {:?}",
            batch.inputs.dims(),
            batch.targets.dims()
        );
    }

    if prepared.test.is_empty() {
        println!("Test split is empty, skipping baselines");
        return Ok(());
    }
    let plan = BatchPlan::for_collection(&prepared.test, cfg.batch_size, cfg.shuffle_seed);
    let naive = evaluate(
        &NaiveBaseline::new(Some(prepared.normalizer.clone())),
        &prepared.test,
        &plan,
    )?;
    let mean = evaluate(&MeanBaseline::fit(&prepared.train), &prepared.test, &plan)?;
    let linear = evaluate(&LinearBaseline::fit(&prepared.train)?, &prepared.test, &plan)?;
    println!("Naive baseline  (test): {}", naive);
    println!("Mean baseline   (test): {}", mean);
    println!("Linear baseline (test): {}", linear);
    Ok(())
}
