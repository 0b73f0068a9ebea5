// imports
use crate::data::{SplitParams, TOP_K};
use crate::error::RecError;

use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

pub mod files_handling;

fn default_model_name() -> String {
    "bert-base-cased".to_string()
}

fn default_layers() -> Vec<isize> {
    vec![-4, -3, -2, -1]
}

fn default_max_length() -> usize {
    512
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbedderParams {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default = "default_layers")]
    pub layers: Vec<isize>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl Default for EmbedderParams {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            model_dir: None,
            layers: default_layers(),
            max_length: default_max_length(),
        }
    }
}

impl Display for EmbedderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "embedder parameters:
        model_name: {},
        model_dir: {:?},
        layers: {:?},
        max_length: {}",
        self.model_name, self.model_dir, self.layers, self.max_length
        )
    }
}

fn default_k_answer() -> usize { 1 }
fn default_test_size() -> usize { 1000 }
fn default_val_size() -> usize { 5000 }
fn default_n_neighbours() -> usize { 50 }
fn default_top_k() -> usize { TOP_K }
fn default_results_file() -> String { "test_predictions.csv".to_string() }

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub data_path: PathBuf,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_k_answer")]
    pub k_answer: usize,
    #[serde(default = "default_test_size")]
    pub test_size: usize,
    #[serde(default = "default_val_size")]
    pub val_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub saved_split: bool,
    #[serde(default)]
    pub saved_embeddings: bool,
    #[serde(default = "default_n_neighbours")]
    pub n_neighbours: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_results_file")]
    pub results_file: String,
    #[serde(default)]
    pub embedder: EmbedderParams,
}

impl Params {

    // artifacts go next to the inputs unless told otherwise
    pub fn output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(output_dir) => output_dir.clone(),
            None => self.data_path.join("embeddings"),
        }
    }

    pub fn split_params(&self) -> SplitParams {
        SplitParams { k_answer: self.k_answer, test_size: self.test_size, val_size: self.val_size }
    }

}

impl Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "using parameters:
        data_path: {}
        output_dir: {}
        k_answer: {}
        test_size: {}
        val_size: {}
        seed: {:?}
        saved_split: {}
        saved_embeddings: {}
        n_neighbours: {}
        top_k: {}
        results_file: {},
        Using {}",
        self.data_path.display(), self.output_dir().display(), self.k_answer, self.test_size, self.val_size,
        self.seed, self.saved_split, self.saved_embeddings, self.n_neighbours, self.top_k, self.results_file,
        self.embedder)
    }
}

pub struct Config {
    params: Params
}

impl Config {

    pub fn get_params(&self) -> Params {
        self.params.clone()
    }

    pub fn new(config_file: &Path) -> Result<Config, RecError> {
        let json = fs::read_to_string(config_file)
            .map_err(|source| RecError::File { path: config_file.to_owned(), source })?;
        Config::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Config, RecError> {

        let params: Params = serde_json::from_str(json)
            .map_err(|e| RecError::Config(e.to_string()))?;

        // validate what serde cannot
        if params.embedder.layers.is_empty() {
            return Err(RecError::NoLayers);
        }
        if params.top_k == 0 || params.top_k > TOP_K {
            return Err(RecError::Config(format!("top_k must be between 1 and {}, got {}", TOP_K, params.top_k)));
        }
        if params.k_answer == 0 {
            return Err(RecError::Config("k_answer must be positive, unanswered questions cannot be scored".to_string()));
        }
        if params.n_neighbours == 0 {
            return Err(RecError::Config("n_neighbours must be positive".to_string()));
        }
        if params.embedder.max_length < 3 {
            return Err(RecError::Config(format!("max_length {} leaves no room for words", params.embedder.max_length)));
        }

        Ok(Self { params })
    }

}
