use std::path::PathBuf;
use thiserror::Error;

use crate::data::Id;

#[derive(Debug, Error)]
pub enum RecError {

    #[error("cannot access {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed json in {} at line {line}: {source}", path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("tokenizer failure: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("model failure: {0}")]
    Model(#[from] candle_core::Error),

    #[error("cannot fetch model files: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("layer {layer} is out of range for a model with {available} hidden states")]
    InvalidLayer { layer: isize, available: usize },

    #[error("at least one layer must be selected")]
    NoLayers,

    #[error("predictions and truths differ in length: {predictions} vs {truths}")]
    LengthMismatch { predictions: usize, truths: usize },

    #[error("cannot score an empty sequence of questions")]
    EmptyInput,

    #[error("predicted users of question {index} are empty, precision is undefined")]
    EmptyPrediction { index: usize },

    #[error("true answerers of question {index} are empty, recall is undefined")]
    EmptyTruth { index: usize },

    #[error("embedding matrix has {rows} rows but {ids} question ids were given")]
    RowMismatch { rows: usize, ids: usize },

    #[error("need {needed} questions for the split, only {available} have enough answers")]
    NotEnoughQuestions { needed: usize, available: usize },

    #[error("none of the {0} train questions has an embedding, nothing to recommend from")]
    NoTrainEmbeddings(usize),

    #[error("question {0} is not among the filtered questions")]
    UnknownQuestion(Id),

    #[error("invalid configuration: {0}")]
    Config(String),
}
