// imports
use crate::config::EmbedderParams;
use crate::embedder::HiddenStates;
use crate::error::RecError;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::api::sync::Api;
use ndarray::Array2;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tokenizers::{Encoding, Tokenizer, TruncationParams};
use tracing::{debug, info};

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// The subset of a hugging face `config.json` the encoder needs.
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub model_type: Option<String>,
}

// older checkpoints name the layer norm parameters gamma and beta
fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<LayerNorm> {
    let (weight, bias) = match (vb.get(size, "weight"), vb.get(size, "bias")) {
        (Ok(weight), Ok(bias)) => (weight, bias),
        _ => (vb.get(size, "gamma")?, vb.get(size, "beta")?),
    };
    Ok(LayerNorm::new(weight, bias, eps))
}

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {

    fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<Self> {
        Ok(Self {
            word_embeddings: embedding(config.vocab_size, config.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(config.max_position_embeddings, config.hidden_size, vb.pp("position_embeddings"))?,
            token_type_embeddings: embedding(config.type_vocab_size, config.hidden_size, vb.pp("token_type_embeddings"))?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let words = self.word_embeddings.forward(input_ids)?;
        let types = self.token_type_embeddings.forward(token_type_ids)?;
        let positions = self.position_embeddings.forward(&positions)?;
        let xs = words.add(&types)?.broadcast_add(&positions)?;
        self.layer_norm.forward(&xs)
    }
}

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {

    fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let heads = config.num_attention_heads;
        if heads == 0 || hidden % heads != 0 {
            candle_core::bail!("hidden size {} cannot be split into {} attention heads", hidden, heads);
        }
        Ok(Self {
            query: linear(hidden, hidden, vb.pp("query"))?,
            key: linear(hidden, hidden, vb.pp("key"))?,
            value: linear(hidden, hidden, vb.pp("value"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    // (batch, seq, hidden) -> (batch, heads, seq, head_dim)
    fn split_heads(&self, xs: Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        xs.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let q = self.split_heads(self.query.forward(xs)?)?;
        let k = self.split_heads(self.key.forward(xs)?)?;
        let v = self.split_heads(self.value.forward(xs)?)?;

        // a single unpadded sequence, no attention mask needed
        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        probs.matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))
    }
}

// dense projection followed by a residual layer norm
struct BertResidual {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertResidual {

    fn load(vb: VarBuilder, in_dim: usize, config: &BertConfig) -> candle_core::Result<Self> {
        Ok(Self {
            dense: linear(in_dim, config.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, residual: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.dense.forward(xs)?;
        self.layer_norm.forward(&(xs + residual)?)
    }
}

struct BertLayer {
    attention: BertSelfAttention,
    attention_output: BertResidual,
    intermediate: Linear,
    output: BertResidual,
}

impl BertLayer {

    fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<Self> {
        Ok(Self {
            attention: BertSelfAttention::load(vb.pp("attention.self"), config)?,
            attention_output: BertResidual::load(vb.pp("attention.output"), config.hidden_size, config)?,
            intermediate: linear(config.hidden_size, config.intermediate_size, vb.pp("intermediate.dense"))?,
            output: BertResidual::load(vb.pp("output"), config.intermediate_size, config)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let attended = self.attention.forward(xs)?;
        let attended = self.attention_output.forward(&attended, xs)?;
        let intermediate = self.intermediate.forward(&attended)?.gelu_erf()?;
        self.output.forward(&intermediate, &attended)
    }
}

/// BERT encoder which keeps the output of every layer.
pub struct BertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    device: Device,
}

impl BertModel {

    fn load_unprefixed(vb: &VarBuilder, config: &BertConfig) -> candle_core::Result<(BertEmbeddings, Vec<BertLayer>)> {
        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| BertLayer::load(vb.pp(format!("encoder.layer.{}", i)), config))
            .collect::<candle_core::Result<Vec<BertLayer>>>()?;
        Ok((embeddings, layers))
    }

    pub fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<BertModel> {

        // pretraining checkpoints nest the encoder under the model type, e.g. `bert.embeddings`
        let (embeddings, layers) = match BertModel::load_unprefixed(&vb, config) {
            Ok(loaded) => loaded,
            Err(err) => match &config.model_type {
                Some(model_type) => BertModel::load_unprefixed(&vb.pp(model_type), config)
                    .map_err(|_| err)?,
                None => return Err(err),
            },
        };

        Ok(Self { embeddings, layers, device: vb.device().clone() })
    }

    /// Returns `num_hidden_layers + 1` tensors of shape (batch, seq, hidden),
    /// the embedding output first.
    pub fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        let mut xs = self.embeddings.forward(input_ids, token_type_ids)?;
        for layer in &self.layers {
            let next = layer.forward(&xs)?;
            hidden_states.push(xs);
            xs = next;
        }
        hidden_states.push(xs);
        Ok(hidden_states)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl HiddenStates for BertModel {

    fn hidden_states(&self, encoding: &Encoding) -> Result<Vec<Array2<f32>>, RecError> {

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let states = self.forward(&input_ids, &token_type_ids)?;

        let mut matrices = Vec::with_capacity(states.len());
        for state in states {
            let state = state.squeeze(0)?.to_dtype(DType::F32)?;
            let (n_tokens, hidden) = state.dims2()?;
            let values = state.flatten_all()?.to_vec1::<f32>()?;
            matrices.push(Array2::from_shape_vec((n_tokens, hidden), values)?);
        }
        Ok(matrices)
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

fn resolve_files(params: &EmbedderParams) -> Result<ModelFiles, RecError> {

    if let Some(model_dir) = &params.model_dir {
        return Ok(ModelFiles {
            config: model_dir.join("config.json"),
            tokenizer: model_dir.join("tokenizer.json"),
            weights: model_dir.join("model.safetensors"),
        });
    }

    // files are cached by hf-hub, only the first run hits the network
    info!(model = %params.model_name, "fetching model files");
    let repo = Api::new()?.model(params.model_name.clone());
    Ok(ModelFiles {
        config: repo.get("config.json")?,
        tokenizer: repo.get("tokenizer.json")?,
        weights: repo.get("model.safetensors")?,
    })
}

/// Loads the encoder and its tokenizer, truncating inputs to `max_length` tokens.
pub fn load_pretrained(params: &EmbedderParams) -> Result<(BertModel, Tokenizer), RecError> {

    let files = resolve_files(params)?;

    let config = fs::read_to_string(&files.config)
        .map_err(|source| RecError::File { path: files.config.clone(), source })?;
    let config: BertConfig = serde_json::from_str(&config)?;
    debug!(?config, "bert config");

    let mut tokenizer = Tokenizer::from_file(&files.tokenizer)?;
    tokenizer.with_truncation(Some(TruncationParams {
        max_length: params.max_length.min(config.max_position_embeddings),
        ..Default::default()
    }))?;

    let device = Device::Cpu;
    // safety: the weights file is not modified while mapped
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)? };
    let model = BertModel::load(vb, &config)?;

    info!(
        layers = config.num_hidden_layers,
        hidden = config.hidden_size,
        "loaded bert encoder"
    );
    Ok((model, tokenizer))
}
