// imports
use crate::bert::{self, BertModel};
use crate::config::EmbedderParams;
use crate::error::RecError;
use crate::stopwords::StopWords;

use ndarray::{stack, Array1, Array2, ArrayView1, Axis};
use tokenizers::{Encoding, Tokenizer};
use tracing::{debug, warn};

/// A contextual model seen from the outside: one `(n_tokens, hidden)` matrix
/// per hidden state, the embedding output first.
pub trait HiddenStates {
    fn hidden_states(&self, encoding: &Encoding) -> Result<Vec<Array2<f32>>, RecError>;
}

pub struct BertEmbedder<M = BertModel> {
    model: M,
    tokenizer: Tokenizer,
    layers: Vec<isize>,
    stop_words: &'static StopWords,
}

impl BertEmbedder<BertModel> {

    pub fn from_pretrained(params: &EmbedderParams) -> Result<Self, RecError> {
        let (model, tokenizer) = bert::load_pretrained(params)?;
        BertEmbedder::new(model, tokenizer, params.layers.clone())
    }

}

impl<M: HiddenStates> BertEmbedder<M> {

    pub fn new(model: M, tokenizer: Tokenizer, layers: Vec<isize>) -> Result<Self, RecError> {
        if layers.is_empty() {
            return Err(RecError::NoLayers);
        }
        Ok(Self { model, tokenizer, layers, stop_words: StopWords::english() })
    }

    pub fn layers(&self) -> &[isize] {
        &self.layers
    }

    // negative layers count back from the last hidden state
    fn sum_layers(&self, states: &[Array2<f32>]) -> Result<Array2<f32>, RecError> {

        let available = states.len();
        let mut summed: Option<Array2<f32>> = None;
        for &layer in &self.layers {
            let idx = if layer < 0 { available as isize + layer } else { layer };
            if idx < 0 || idx >= available as isize {
                return Err(RecError::InvalidLayer { layer, available });
            }
            let state = &states[idx as usize];
            summed = Some(match summed {
                Some(acc) => acc + state,
                None => state.clone(),
            });
        }
        // layers is never empty, see `new`
        summed.ok_or(RecError::NoLayers)
    }

    /// Embeds `text` into a single vector, or `None` when nothing is left to embed
    /// once stop words are removed.
    pub fn get_embeddings(&self, text: &str) -> Result<Option<Array1<f32>>, RecError> {

        // 0. preprocess: remove stop words
        let words = self.stop_words.remove(text);
        if words.is_empty() {
            warn!(text, "no words left after stop word removal, skipped");
            return Ok(None);
        }

        // 1. tokenize, each sub-word token remembers the position of its word
        let encoding = self.tokenizer.encode(words.as_slice(), true)?;

        // 2. generate hidden states and sum the selected layers
        let states = self.model.hidden_states(&encoding)?;
        let output = self.sum_layers(&states)?;

        // 3. average the tokens of every word, special tokens belong to no word
        let word_ids = encoding.get_word_ids();
        let mut sentence_embeddings: Vec<Array1<f32>> = Vec::with_capacity(words.len());
        for (position, word) in words.iter().enumerate() {
            let token_ids_word: Vec<usize> = word_ids
                .iter()
                .enumerate()
                .filter(|(_, word_id)| **word_id == Some(position as u32))
                .map(|(i, _)| i)
                .collect();

            // truncated away
            if token_ids_word.is_empty() {
                debug!(word, position, "word has no tokens left");
                continue;
            }

            if let Some(word_embedding) = output.select(Axis(0), &token_ids_word).mean_axis(Axis(0)) {
                sentence_embeddings.push(word_embedding);
            }
        }

        if sentence_embeddings.is_empty() {
            warn!(text, "no word embeddings from input, skipped");
            return Ok(None);
        }

        let views: Vec<ArrayView1<f32>> = sentence_embeddings.iter().map(|e| e.view()).collect();
        let sentence_embeddings = stack(Axis(0), &views)?;
        Ok(sentence_embeddings.mean_axis(Axis(0)))
    }

}


#[cfg(test)]
pub(crate) mod tests {

    use super::*;
    use ndarray::array;
    use std::str::FromStr;

    // word piece vocabulary small enough to reason about by hand
    pub(crate) fn tiny_tokenizer() -> Tokenizer {
        let special = |id: u32, content: &str| format!(
            r#"{{"id": {}, "content": "{}", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}}"#,
            id, content
        );
        let json = format!(r###"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{}, {}, {}, {}],
            "normalizer": null,
            "pre_tokenizer": {{"type": "BertPreTokenizer"}},
            "post_processor": {{"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]}},
            "decoder": null,
            "model": {{
                "type": "WordPiece",
                "unk_token": "[UNK]",
                "continuing_subword_prefix": "##",
                "max_input_chars_per_word": 100,
                "vocab": {{
                    "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3,
                    "rust": 4, "borrow": 5, "##ing": 6, "checker": 7, "lifetimes": 8, "?": 9
                }}
            }}
        }}"###, special(0, "[PAD]"), special(1, "[UNK]"), special(2, "[CLS]"), special(3, "[SEP]"));
        Tokenizer::from_str(&json).unwrap()
    }

    // hidden state `l` of token `t` is (l + 1) * [token id, t]
    pub(crate) struct FakeModel {
        pub n_states: usize,
    }

    impl HiddenStates for FakeModel {
        fn hidden_states(&self, encoding: &Encoding) -> Result<Vec<Array2<f32>>, RecError> {
            let ids = encoding.get_ids();
            Ok((0..self.n_states).map(|l| {
                let scale = (l + 1) as f32;
                Array2::from_shape_fn((ids.len(), 2), |(t, j)| {
                    if j == 0 { scale * ids[t] as f32 } else { scale * t as f32 }
                })
            }).collect())
        }
    }

    fn embedder(layers: Vec<isize>) -> BertEmbedder<FakeModel> {
        BertEmbedder::new(FakeModel { n_states: 3 }, tiny_tokenizer(), layers).unwrap()
    }

    #[test]
    fn tokens_carry_their_word_position() {
        let encoding = tiny_tokenizer().encode(["rust", "borrowing", "rust"].as_slice(), true).unwrap();
        assert_eq!(encoding.get_ids(), &[2, 4, 5, 6, 4, 3]);
        assert_eq!(encoding.get_word_ids(), &[None, Some(0), Some(1), Some(1), Some(2), None]);
    }

    #[test]
    fn selected_layers_are_summed() {
        // "rust" is token 1 with id 4, the sum of states 1 and 2 scales by 2 + 3
        let embedding = embedder(vec![-2, -1]).get_embeddings("rust").unwrap().unwrap();
        assert_eq!(embedding, array![20.0, 5.0]);

        // positive indices address states from the embedding output
        let embedding = embedder(vec![0]).get_embeddings("rust").unwrap().unwrap();
        assert_eq!(embedding, array![4.0, 1.0]);
    }

    #[test]
    fn repeated_words_are_aligned_by_position() {
        // word vectors: rust [12, 3], borrowing [16.5, 7.5], rust [12, 12]
        let embedding = embedder(vec![-1]).get_embeddings("the rust borrowing of rust").unwrap().unwrap();
        assert_eq!(embedding, array![13.5, 7.5]);
    }

    #[test]
    fn unknown_words_still_count() {
        // [CLS] [UNK] rust [SEP] -> [3, 3] and [12, 6]
        let embedding = embedder(vec![-1]).get_embeddings("zebra rust").unwrap().unwrap();
        assert_eq!(embedding, array![7.5, 4.5]);
    }

    #[test]
    fn degenerate_input_has_no_embedding() {
        let embedder = embedder(vec![-1]);
        assert_eq!(embedder.get_embeddings("").unwrap(), None);
        assert_eq!(embedder.get_embeddings("   ").unwrap(), None);
        assert_eq!(embedder.get_embeddings("What is it that you are doing").unwrap(), None);
    }

    #[test]
    fn embedding_is_deterministic() {
        let embedder = embedder(vec![-2, -1]);
        let text = "Why is the borrow checker rejecting lifetimes ?";
        let first = embedder.get_embeddings(text).unwrap();
        let second = embedder.get_embeddings(text).unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn layers_are_validated() {
        assert!(matches!(
            BertEmbedder::new(FakeModel { n_states: 3 }, tiny_tokenizer(), vec![]),
            Err(RecError::NoLayers)
        ));

        // the default layers need at least four hidden states
        let err = embedder(vec![-4, -3, -2, -1]).get_embeddings("rust").unwrap_err();
        assert!(matches!(err, RecError::InvalidLayer { layer: -4, available: 3 }));
        let err = embedder(vec![3]).get_embeddings("rust").unwrap_err();
        assert!(matches!(err, RecError::InvalidLayer { layer: 3, available: 3 }));
    }
}
