// imports
use crate::error::RecError;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

pub const TOP_K: usize = 20;

/// Identifier of a question, answer or user. Numbers and strings are both
/// accepted and kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(id: impl Into<String>) -> Id {
        Id(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id(id.to_string())
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Id(id.to_owned())
    }
}

struct IdVisitor;
impl<'de> Visitor<'de> for IdVisitor {

    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an integer or a string id")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Id(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Id(v.to_string()))
    }

    // pandas exports integer columns with missing values as floats
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v.fract() == 0.0 && v.is_finite() {
            Ok(Id(format!("{}", v as i64)))
        } else {
            Err(E::custom(format!("{} is not an integral id", v)))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Id(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(Id(v))
    }
}

impl<'de> Deserialize<'de> for Id {

    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de> {

            // binary formats cannot guess the type, ids are always written back as strings
            if deserializer.is_human_readable() {
                deserializer.deserialize_any(IdVisitor)
            } else {
                deserializer.deserialize_string(IdVisitor)
            }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question_id: Id,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(skip_deserializing, default)]
    pub n_answers: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Question {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer_id: Id,
    pub question_id: Id,
    pub user_id: Id,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Id,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct Dataset {
    pub answers: Vec<Answer>,
    pub questions: Vec<Question>,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitParams {
    pub k_answer: usize,
    pub test_size: usize,
    pub val_size: usize,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self { k_answer: 1, test_size: 1000, val_size: 5000 }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionSplit {
    pub train: Vec<Question>,
    pub val: Vec<Question>,
    pub test: Vec<Question>,
}

/// Question ids of each partition, persisted so a run can be repeated on the same split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIds {
    pub train: Vec<Id>,
    pub val: Vec<Id>,
    pub test: Vec<Id>,
}

impl QuestionSplit {

    pub fn ids(&self) -> SplitIds {
        let ids = |questions: &[Question]| -> Vec<Id> { questions.iter().map(|q| q.question_id.clone()).collect() };
        SplitIds { train: ids(&self.train), val: ids(&self.val), test: ids(&self.test) }
    }

    // rebuild a saved split, every id must belong to the filtered questions
    pub fn from_ids(filtered: Vec<Question>, ids: &SplitIds) -> Result<QuestionSplit, RecError> {

        let mut by_id: HashMap<Id, Question> = filtered
        .into_iter()
        .map(|q| (q.question_id.clone(), q))
        .collect();

        let mut take = |ids: &[Id]| -> Result<Vec<Question>, RecError> {
            ids.iter()
            .map(|id| by_id.remove(id).ok_or_else(|| RecError::UnknownQuestion(id.clone())))
            .collect()
        };

        let test = take(&ids.test)?;
        let val = take(&ids.val)?;
        let train = take(&ids.train)?;
        Ok(QuestionSplit { train, val, test })
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub question_id: Id,
    pub users: Vec<Id>,
}


fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RecError> {

    // one json object per line, blank lines are tolerated
    let f = File::open(path).map_err(|source| RecError::File { path: path.to_owned(), source })?;
    let mut rows = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.map_err(|source| RecError::File { path: path.to_owned(), source })?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|source| RecError::Json {
            path: path.to_owned(),
            line: i + 1,
            source,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn load_data(data_path: &Path) -> Result<Dataset, RecError> {

    let inputs = data_path.join("inputs");
    let answers: Vec<Answer> = read_table(&inputs.join("answers.json"))?;
    let questions: Vec<Question> = read_table(&inputs.join("questions.json"))?;
    let users: Vec<User> = read_table(&inputs.join("users.json"))?;

    info!(
        answers = answers.len(),
        questions = questions.len(),
        users = users.len(),
        "loaded input tables"
    );

    Ok(Dataset { answers, questions, users })
}

// annotates every question with its answer count and keeps the ones with at least `k_answer`
pub fn filter_top_questions(questions: &[Question], answers: &[Answer], k_answer: usize) -> Vec<Question> {

    let mut count_question_answers: HashMap<&Id, usize> = HashMap::new();
    for answer in answers {
        *count_question_answers.entry(&answer.question_id).or_insert(0) += 1;
    }

    questions
    .iter()
    .map(|q| {
        let mut q = q.clone();
        q.n_answers = count_question_answers.get(&q.question_id).copied().unwrap_or(0);
        q
    })
    .filter(|q| q.n_answers >= k_answer)
    .collect()
}

pub fn split_questions<R: Rng + ?Sized>(
    questions: &[Question],
    answers: &[Answer],
    params: &SplitParams,
    rng: &mut R,
) -> Result<QuestionSplit, RecError> {

    let mut rest = filter_top_questions(questions, answers, params.k_answer);
    // at least one question has to be left for training
    let needed = params.test_size + params.val_size + 1;
    if rest.len() < needed {
        return Err(RecError::NotEnoughQuestions { needed, available: rest.len() });
    }

    // sampling without replacement, test first then val out of what remains
    rest.shuffle(rng);
    let test: Vec<Question> = rest.drain(..params.test_size).collect();
    let val: Vec<Question> = rest.drain(..params.val_size).collect();
    let train = rest;

    info!(train = train.len(), val = val.len(), test = test.len(), "split questions");
    Ok(QuestionSplit { train, val, test })
}

/// Users who answered each question, in answer order and without repeats.
pub fn answerers(answers: &[Answer]) -> HashMap<Id, Vec<Id>> {

    let mut seen: HashSet<(&Id, &Id)> = HashSet::new();
    let mut q2users: HashMap<Id, Vec<Id>> = HashMap::new();
    for answer in answers {
        if seen.insert((&answer.question_id, &answer.user_id)) {
            q2users.entry(answer.question_id.clone()).or_default().push(answer.user_id.clone());
        }
    }
    q2users
}

fn results_header() -> Vec<String> {
    let mut cols = vec!["question_id".to_string()];
    cols.extend((1..=TOP_K).map(|idx| format!("user{}_id", idx)));
    cols
}

pub fn save_results_csv(data_path: &Path, file_name: &str, content: &[ResultRow]) -> Result<PathBuf, RecError> {

    let results_dir = data_path.join("results");
    fs::create_dir_all(&results_dir).map_err(|source| RecError::File { path: results_dir.clone(), source })?;
    let file_path = results_dir.join(file_name);

    let mut wrt = csv::WriterBuilder::new().from_path(&file_path)?;
    wrt.write_record(results_header())?;
    for row in content {
        // shorter rankings leave the remaining user columns empty
        let mut record: Vec<&str> = Vec::with_capacity(TOP_K + 1);
        record.push(row.question_id.as_str());
        record.extend(row.users.iter().take(TOP_K).map(Id::as_str));
        record.resize(TOP_K + 1, "");
        wrt.write_record(&record)?;
    }
    wrt.flush()?;

    info!(path = %file_path.display(), rows = content.len(), "results written");
    Ok(file_path)
}

pub fn read_results_csv(file_path: &Path) -> Result<Vec<ResultRow>, RecError> {

    let mut rdr = csv::ReaderBuilder::new().from_path(file_path)?;
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let mut cells = record.iter();
        let question_id = match cells.next() {
            Some(id) => Id::new(id),
            None => continue,
        };
        let users = cells.filter(|cell| !cell.is_empty()).map(Id::from).collect();
        rows.push(ResultRow { question_id, users });
    }
    Ok(rows)
}


#[cfg(test)]
mod tests {

    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::io::Write;

    fn question(id: u64) -> Question {
        Question { question_id: Id::from(id), text: Some(format!("question {}", id)), n_answers: 0, extra: Map::new() }
    }

    fn answer(id: u64, question_id: u64, user_id: u64) -> Answer {
        Answer { answer_id: Id::from(id), question_id: Id::from(question_id), user_id: Id::from(user_id), extra: Map::new() }
    }

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut f = File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let ids: Vec<Id> = serde_json::from_str(r#"[12, "ab-3", -4, 7.0]"#).unwrap();
        assert_eq!(ids, vec![Id::new("12"), Id::new("ab-3"), Id::new("-4"), Id::new("7")]);
        assert!(serde_json::from_str::<Id>("7.5").is_err());

        // binary round trip goes through strings
        let bytes = bincode::serialize(&ids).unwrap();
        let back: Vec<Id> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, ids);
    }

    #[test]
    fn load_data_reads_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();
        write_lines(&inputs.join("answers.json"), &[
            r#"{"answer_id": 1, "question_id": 10, "user_id": 100, "score": 3}"#,
            "",
            r#"{"answer_id": 2, "question_id": 10, "user_id": 101}"#,
        ]);
        write_lines(&inputs.join("questions.json"), &[
            r#"{"question_id": 10, "text": "How do lifetimes work?", "tags": ["rust"]}"#,
            r#"{"question_id": 11, "text": null}"#,
        ]);
        write_lines(&inputs.join("users.json"), &[r#"{"user_id": 100, "name": "ferris"}"#]);

        let dataset = load_data(dir.path()).unwrap();
        assert_eq!(dataset.answers.len(), 2);
        assert_eq!(dataset.questions.len(), 2);
        assert_eq!(dataset.users.len(), 1);
        assert_eq!(dataset.questions[0].text(), "How do lifetimes work?");
        assert_eq!(dataset.questions[1].text(), "");
        assert!(dataset.questions[0].extra.contains_key("tags"));
        assert_eq!(dataset.users[0].extra["name"], "ferris");
    }

    #[test]
    fn malformed_and_missing_inputs_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_data(dir.path()), Err(RecError::File { .. })));

        let inputs = dir.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();
        write_lines(&inputs.join("answers.json"), &[
            r#"{"answer_id": 1, "question_id": 10, "user_id": 100}"#,
            r#"{"answer_id": 2, "question_id": "#,
        ]);
        match load_data(dir.path()) {
            Err(RecError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected a json error, got {:?}", other.map(|d| d.answers.len())),
        }
    }

    #[test]
    fn filter_counts_answers() {
        let questions: Vec<Question> = (0..4).map(question).collect();
        let answers = vec![answer(1, 0, 7), answer(2, 0, 8), answer(3, 2, 7), answer(4, 99, 7)];

        let filtered = filter_top_questions(&questions, &answers, 1);
        let ids: Vec<&str> = filtered.iter().map(|q| q.question_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "2"]);
        assert_eq!(filtered[0].n_answers, 2);
        assert_eq!(filtered[1].n_answers, 1);

        let filtered = filter_top_questions(&questions, &answers, 2);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].question_id, Id::from(0));
    }

    #[test]
    fn split_partitions_the_filtered_questions() {
        let questions: Vec<Question> = (0..60).map(question).collect();
        // questions with an odd id get two answers, multiples of 3 get none
        let answers: Vec<Answer> = (0..60u64)
        .filter(|q| q % 3 != 0)
        .flat_map(|q| {
            let n = if q % 2 == 1 { 2 } else { 1 };
            (0..n).map(move |j| answer(q * 10 + j, q, j))
        })
        .collect();

        let params = SplitParams { k_answer: 1, test_size: 5, val_size: 10 };
        let mut rng = StdRng::seed_from_u64(7);
        let split = split_questions(&questions, &answers, &params, &mut rng).unwrap();

        let filtered: HashSet<Id> = filter_top_questions(&questions, &answers, 1)
        .into_iter().map(|q| q.question_id).collect();
        assert_eq!(filtered.len(), 40);
        assert_eq!(split.test.len(), 5);
        assert_eq!(split.val.len(), 10);
        assert_eq!(split.train.len(), 25);

        let mut union: HashSet<Id> = HashSet::new();
        for q in split.train.iter().chain(&split.val).chain(&split.test) {
            assert!(q.n_answers >= 1);
            // disjoint partitions never insert twice
            assert!(union.insert(q.question_id.clone()));
        }
        assert_eq!(union, filtered);

        let params = SplitParams { k_answer: 2, ..params };
        let split = split_questions(&questions, &answers, &params, &mut rng).unwrap();
        for q in split.train.iter().chain(&split.val).chain(&split.test) {
            assert_eq!(q.n_answers, 2);
        }
    }

    #[test]
    fn split_needs_enough_questions() {
        let questions: Vec<Question> = (0..5).map(question).collect();
        let answers: Vec<Answer> = (0..5).map(|q| answer(q, q, 1)).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let err = split_questions(&questions, &answers, &SplitParams::default(), &mut rng).unwrap_err();
        assert!(matches!(err, RecError::NotEnoughQuestions { needed: 6001, available: 5 }));

        // test and val alone would leave nothing to recommend from
        let params = SplitParams { k_answer: 1, test_size: 2, val_size: 3 };
        let err = split_questions(&questions, &answers, &params, &mut rng).unwrap_err();
        assert!(matches!(err, RecError::NotEnoughQuestions { needed: 6, available: 5 }));

        let params = SplitParams { k_answer: 1, test_size: 2, val_size: 2 };
        let split = split_questions(&questions, &answers, &params, &mut rng).unwrap();
        assert_eq!(split.train.len(), 1);
    }

    #[test]
    fn saved_split_is_rebuilt() {
        let questions: Vec<Question> = (0..12).map(question).collect();
        let answers: Vec<Answer> = (0..12).map(|q| answer(q, q, 1)).collect();
        let params = SplitParams { k_answer: 1, test_size: 3, val_size: 4 };
        let split = split_questions(&questions, &answers, &params, &mut StdRng::seed_from_u64(1)).unwrap();

        let ids = split.ids();
        let rebuilt = QuestionSplit::from_ids(filter_top_questions(&questions, &answers, 1), &ids).unwrap();
        assert_eq!(rebuilt.ids(), ids);

        let mut unknown = ids.clone();
        unknown.test.push(Id::from(99));
        let err = QuestionSplit::from_ids(filter_top_questions(&questions, &answers, 1), &unknown).unwrap_err();
        assert!(matches!(err, RecError::UnknownQuestion(id) if id == Id::from(99)));
    }

    #[test]
    fn answerers_are_deduplicated_in_order() {
        let answers = vec![answer(1, 0, 7), answer(2, 0, 5), answer(3, 0, 7), answer(4, 1, 5)];
        let q2users = answerers(&answers);
        assert_eq!(q2users[&Id::from(0)], vec![Id::from(7), Id::from(5)]);
        assert_eq!(q2users[&Id::from(1)], vec![Id::from(5)]);
    }

    #[test]
    fn results_csv_has_twenty_user_columns() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            ResultRow { question_id: Id::from(1), users: (1..=25).map(Id::from).collect() },
            ResultRow { question_id: Id::from(2), users: vec![Id::from(9), Id::from(8)] },
        ];
        let path = save_results_csv(dir.path(), "test.csv", &rows).unwrap();
        assert_eq!(path, dir.path().join("results").join("test.csv"));

        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("question_id,user1_id,user2_id,"));
        assert!(lines[0].ends_with(",user20_id"));
        assert_eq!(lines[0].split(',').count(), 21);
        assert_eq!(lines[1].split(',').count(), 21);
        assert_eq!(lines[2], format!("2,9,8{}", ",".repeat(18)));

        let back = read_results_csv(&path).unwrap();
        assert_eq!(back[0].users.len(), 20);
        assert_eq!(back[1], rows[1]);
    }
}
