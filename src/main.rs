use anyhow::Context;
use answerer_recommender::{Config, Pipeline};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Recommends, for every test question, the users most likely to answer it.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// json file with the run parameters
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    info!("entering program...");

    let params = Config::new(&cli.config)
        .with_context(|| format!("could not build parameters from {}", cli.config.display()))?
        .get_params();

    let my_time = Instant::now();
    let summary = Pipeline::run(&params).context("recommendation run failed")?;

    if let Some(scores) = summary.val {
        info!(k = params.top_k, %scores, "validation");
    }
    if let Some(scores) = summary.test {
        info!(k = params.top_k, %scores, "test");
    }
    info!(path = %summary.results.display(), seconds = my_time.elapsed().as_secs(), "finished");
    Ok(())
}
