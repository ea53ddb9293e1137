use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use stock_seq::config::PipelineConfig;
use stock_seq::features::MarketSeries;
use stock_seq::pipeline::Pipeline;
use stock_seq::source::{load_market_index, CsvRowSource};

#[derive(Parser, Debug)]
#[command(name = "build_features")]
struct Cli {
    /// Directory with one <instrument>.csv per instrument
    #[arg(long)]
    input: PathBuf,

    /// Directory the audited feature tables are written to
    #[arg(long)]
    output: PathBuf,

    /// Reference index CSV with date and close columns
    #[arg(long)]
    market_index: Option<PathBuf>,

    /// Only process this instrument
    #[arg(long)]
    ticker: Option<String>,

    /// JSON file overriding the default configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Abort on the first malformed instrument instead of skipping it
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
    config.strict |= cli.strict;
    let pipeline = Pipeline::new(config)?;

    let market = match &cli.market_index {
        Some(path) => {
            let points = load_market_index(path)
                .with_context(|| format!("loading market index {}", path.display()))?;
            info!("Loaded {} market index rows", points.len());
            Some(MarketSeries::new(&points)?)
        }
        None => None,
    };
    let index_stem = cli
        .market_index
        .as_ref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .map(String::from);
    let source = CsvRowSource::new(&cli.input).excluding(index_stem);

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating {}", cli.output.display()))?;

    if let Some(ticker) = &cli.ticker {
        let table = pipeline
            .process_instrument(&source, ticker, market.as_ref())
            .with_context(|| format!("building features for {ticker}"))?;
        let path = cli.output.join(format!("{ticker}_features.csv"));
        table.to_csv(&path)?;
        println!(
            "{}: {} rows, {} valid -> {}",
            ticker,
            table.len(),
            table.valid_count(),
            path.display()
        );
        return Ok(());
    }

    let build = pipeline.build_features(&source, market.as_ref())?;
    for table in &build.tables {
        let path = cli.output.join(format!("{}_features.csv", table.instrument));
        table
            .to_csv(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    print!("{}", build.report);
    Ok(())
}
