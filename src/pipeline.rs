// imports
use crate::config::files_handling::{exists, read_input, save_output};
use crate::config::Params;
use crate::data::{self, Dataset, Id, Question, QuestionSplit, ResultRow, SplitIds};
use crate::embedder::{BertEmbedder, HiddenStates};
use crate::error::RecError;
use crate::recommend::Recommender;
use crate::score::{self, Scores};

use ndarray::{stack, Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

const SPLIT_NAMES: [&str; 3] = ["train", "val", "test"];

pub struct Embedded {
    pub ids: Vec<Id>,
    pub w: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub val: Option<Scores>,
    pub test: Option<Scores>,
    pub results: PathBuf,
}

pub struct Pipeline {}

impl Pipeline {

    // runs the main procedure -
    // -> split of the questions (or reuse of a saved one)
    // -> embedding of every split (or reuse of saved embeddings)
    // -> nearest neighbour recommendation, scoring and results

    pub fn run(params: &Params) -> Result<Summary, RecError> {
        Pipeline::run_with(params, || BertEmbedder::from_pretrained(&params.embedder))
    }

    /// Same as `run`, `load_embedder` is only called when embeddings have to be computed.
    pub fn run_with<M, F>(params: &Params, load_embedder: F) -> Result<Summary, RecError>
    where
        M: HiddenStates,
        F: FnOnce() -> Result<BertEmbedder<M>, RecError>,
    {

        info!("{}", params);

        let timer = Instant::now();
        let dataset = data::load_data(&params.data_path)?;
        let split = Pipeline::build_split(params, &dataset)?;
        let q2users = data::answerers(&dataset.answers);
        info!(seconds = timer.elapsed().as_secs(), "finished data preparation");

        let timer = Instant::now();
        let [train, val, test] = Pipeline::embeddings(params, &split, load_embedder)?;
        info!(seconds = timer.elapsed().as_secs(), "finished embeddings");

        if train.ids.is_empty() {
            return Err(RecError::NoTrainEmbeddings(split.train.len()));
        }

        let timer = Instant::now();
        let recommender = Recommender::new(train.w, &train.ids, &q2users, params.n_neighbours)?;
        let (_, val_scores) = Pipeline::evaluate("val", &recommender, &val, &q2users, params.top_k)?;
        let (test_predictions, test_scores) = Pipeline::evaluate("test", &recommender, &test, &q2users, params.top_k)?;

        let rows: Vec<ResultRow> = test.ids
        .into_iter()
        .zip(test_predictions)
        .map(|(question_id, users)| ResultRow { question_id, users })
        .collect();
        let results = data::save_results_csv(&params.data_path, &params.results_file, &rows)?;
        info!(seconds = timer.elapsed().as_secs(), "finished recommendation");

        Ok(Summary { val: val_scores, test: test_scores, results })
    }

    fn build_split(params: &Params, dataset: &Dataset) -> Result<QuestionSplit, RecError> {

        let output_dir = params.output_dir();
        let split_path = output_dir.join("split");

        if params.saved_split {
            if exists::<SplitIds>(&split_path) {
                let ids = read_input::<SplitIds>(&split_path)?;
                let filtered = data::filter_top_questions(&dataset.questions, &dataset.answers, params.k_answer);
                let split = QuestionSplit::from_ids(filtered, &ids)?;
                info!(train = split.train.len(), val = split.val.len(), test = split.test.len(), "reusing saved split");
                return Ok(split);
            }
            warn!(path = %split_path.display(), "no saved split found, drawing a new one");
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let split = data::split_questions(&dataset.questions, &dataset.answers, &params.split_params(), &mut rng)?;
        save_output(&output_dir, "split", &split.ids())?;
        Ok(split)
    }

    fn saved_embeddings(params: &Params, split: &QuestionSplit) -> Result<Option<[Embedded; 3]>, RecError> {

        let output_dir = params.output_dir();
        let all_saved = SPLIT_NAMES.iter().all(|name| {
            exists::<Array2<f32>>(&output_dir.join(name))
                && exists::<Vec<Id>>(&output_dir.join(format!("{}_ids", name)))
        });
        if !all_saved {
            warn!(path = %output_dir.display(), "saved embeddings not found, computing them");
            return Ok(None);
        }

        let load = |name: &str| -> Result<Embedded, RecError> {
            let w = read_input::<Array2<f32>>(&output_dir.join(name))?;
            let ids = read_input::<Vec<Id>>(&output_dir.join(format!("{}_ids", name)))?;
            if w.dim().0 != ids.len() {
                return Err(RecError::RowMismatch { rows: w.dim().0, ids: ids.len() });
            }
            info!(split = name, questions = ids.len(), "loaded saved embeddings");
            Ok(Embedded { ids, w })
        };
        let saved = [load("train")?, load("val")?, load("test")?];

        // embeddings of another split would leak test questions into train
        let partitions = [&split.train, &split.val, &split.test];
        for ((name, embedded), questions) in SPLIT_NAMES.iter().zip(&saved).zip(partitions) {
            if !belongs_to(&embedded.ids, questions) {
                warn!(split = name, "saved embeddings belong to another split, computing them");
                return Ok(None);
            }
        }
        Ok(Some(saved))
    }

    fn embeddings<M, F>(params: &Params, split: &QuestionSplit, load_embedder: F) -> Result<[Embedded; 3], RecError>
    where
        M: HiddenStates,
        F: FnOnce() -> Result<BertEmbedder<M>, RecError>,
    {

        if params.saved_embeddings {
            if let Some(saved) = Pipeline::saved_embeddings(params, split)? {
                return Ok(saved);
            }
        }

        let embedder = load_embedder()?;
        let output_dir = params.output_dir();
        let embed = |name: &str, questions: &[Question]| -> Result<Embedded, RecError> {
            let timer = Instant::now();
            let embedded = embed_questions(&embedder, questions)?;
            save_output(&output_dir, name, &embedded.w)?;
            save_output(&output_dir, &format!("{}_ids", name), &embedded.ids)?;
            info!(split = name, questions = embedded.ids.len(), seconds = timer.elapsed().as_secs(), "embedded and saved");
            Ok(embedded)
        };
        Ok([embed("train", &split.train)?, embed("val", &split.val)?, embed("test", &split.test)?])
    }

    fn evaluate(
        name: &str,
        recommender: &Recommender,
        embedded: &Embedded,
        q2users: &HashMap<Id, Vec<Id>>,
        top_k: usize,
    ) -> Result<(Vec<Vec<Id>>, Option<Scores>), RecError> {

        if embedded.ids.is_empty() {
            warn!(split = name, "no questions to evaluate");
            return Ok((Vec::new(), None));
        }

        let predictions = recommender.recommend_all(&embedded.w, top_k);
        let truths: Vec<Vec<Id>> = embedded.ids
        .iter()
        .map(|id| q2users.get(id).cloned().unwrap_or_default())
        .collect();
        let scores = score::evaluate(&predictions, &truths)?;

        info!(split = name, k = top_k, %scores, "evaluated recommendations");
        Ok((predictions, Some(scores)))
    }

}

// saved ids must follow the questions in order, skipped questions aside
fn belongs_to(ids: &[Id], questions: &[Question]) -> bool {
    let mut remaining = questions.iter().map(|q| &q.question_id);
    ids.iter().all(|id| remaining.any(|question_id| question_id == id))
}

/// Embeds every question, questions without an embedding are left out of the result.
pub fn embed_questions<M: HiddenStates>(embedder: &BertEmbedder<M>, questions: &[Question]) -> Result<Embedded, RecError> {

    let mut ids: Vec<Id> = Vec::new();
    let mut rows: Vec<Array1<f32>> = Vec::new();
    for (i, question) in questions.iter().enumerate() {

        if i % 1000 == 0 && i > 0 {
            info!(done = i, total = questions.len(), "embedding questions");
        }

        if let Some(embedding) = embedder.get_embeddings(question.text())? {
            ids.push(question.question_id.clone());
            rows.push(embedding);
        }
    }

    let skipped = questions.len() - ids.len();
    if skipped > 0 {
        warn!(skipped, total = questions.len(), "questions without embedding were left out");
    }

    let w = if rows.is_empty() {
        Array2::zeros((0, 0))
    } else {
        let views: Vec<ArrayView1<f32>> = rows.iter().map(|row| row.view()).collect();
        stack(Axis(0), &views)?
    };
    Ok(Embedded { ids, w })
}
