use anyhow::Context;
use answerer_recommender::data::{self, Id};
use answerer_recommender::evaluate;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// scores a results csv against the answers of the data folder,
// treated as binary executable so it can be ran independently from main

#[derive(Debug, Parser)]
#[command(about = "precision@20 and recall@20 of a saved results file")]
struct Cli {
    /// folder holding inputs/answers.json
    data_path: PathBuf,
    /// results csv, one question per row followed by its predicted users
    results: PathBuf,
}

fn main() -> anyhow::Result<()> {

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let dataset = data::load_data(&cli.data_path)
        .with_context(|| format!("could not load data from {}", cli.data_path.display()))?;
    let q2users = data::answerers(&dataset.answers);
    let rows = data::read_results_csv(&cli.results)
        .with_context(|| format!("could not read {}", cli.results.display()))?;

    let mut predictions: Vec<Vec<Id>> = Vec::with_capacity(rows.len());
    let mut truths: Vec<Vec<Id>> = Vec::with_capacity(rows.len());
    for row in rows {
        match q2users.get(&row.question_id) {
            Some(users) => {
                truths.push(users.clone());
                predictions.push(row.users);
            }
            None => warn!(question = %row.question_id, "question has no answers, skipped"),
        }
    }

    let scores = evaluate(&predictions, &truths)
        .context("could not score the results")?;
    info!(questions = predictions.len(), "scored");
    println!("@{} {}", data::TOP_K, scores);
    Ok(())
}
