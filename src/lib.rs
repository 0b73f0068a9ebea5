pub mod bert;
pub mod config;
pub mod data;
pub mod embedder;
pub mod error;
pub mod pipeline;
pub mod recommend;
pub mod score;
pub mod stopwords;

pub use config::{files_handling, Config, EmbedderParams, Params};
pub use data::Id;
pub use embedder::{BertEmbedder, HiddenStates};
pub use error::RecError;
pub use pipeline::{Pipeline, Summary};
pub use recommend::Recommender;
pub use score::{evaluate, precision_k, recall_k, Scores};
pub use stopwords::StopWords;
