// imports
use crate::data::Id;
use crate::error::RecError;

use ndarray::{Array2, ArrayView1, Axis};
use std::collections::HashMap;
use tracing::debug;

/// Nearest neighbour recommender: the train questions closest to a query vote
/// for the users who answered them, each vote weighted by cosine similarity.
pub struct Recommender {
    w: Array2<f32>,
    answerers: Vec<Vec<Id>>,
    n_neighbours: usize,
}

fn normalize(w: &mut Array2<f32>) {
    // l2 normalize each row, zero rows stay zero
    for mut row in w.axis_iter_mut(Axis(0)) {
        let norm = row.mapv(|a| a.powi(2)).sum().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|a| a / norm);
        }
    }
}

impl Recommender {

    pub fn new(
        mut w: Array2<f32>,
        question_ids: &[Id],
        q2users: &HashMap<Id, Vec<Id>>,
        n_neighbours: usize,
    ) -> Result<Recommender, RecError> {

        if w.dim().0 != question_ids.len() {
            return Err(RecError::RowMismatch { rows: w.dim().0, ids: question_ids.len() });
        }
        normalize(&mut w);

        // answerers aligned with the rows of w
        let answerers = question_ids
        .iter()
        .map(|id| q2users.get(id).cloned().unwrap_or_default())
        .collect();

        Ok(Self { w, answerers, n_neighbours })
    }

    pub fn len(&self) -> usize {
        self.w.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` users with the highest accumulated similarity, best first.
    pub fn recommend(&self, query: ArrayView1<f32>, k: usize) -> Vec<Id> {

        if self.is_empty() {
            return Vec::new();
        }

        let mut query = query.to_owned();
        let norm = query.mapv(|a| a.powi(2)).sum().sqrt();
        if norm > 0.0 {
            query.mapv_inplace(|a| a / norm);
        }

        // multiply all train vectors by the query vector
        let scores = self.w.dot(&query);
        let mut indexed_scores: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();

        // sort by most similar in descending order
        indexed_scores.sort_by(|(_i, s), (_j, t)| t.total_cmp(s));
        indexed_scores.truncate(self.n_neighbours);

        // accumulate votes, first appearance decides among equal scores
        let mut position: HashMap<&Id, usize> = HashMap::new();
        let mut votes: Vec<(&Id, f32)> = Vec::new();
        for (index, score) in &indexed_scores {
            for user in &self.answerers[*index] {
                match position.get(user) {
                    Some(&p) => votes[p].1 += score,
                    None => {
                        position.insert(user, votes.len());
                        votes.push((user, *score));
                    }
                }
            }
        }

        votes.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        votes.truncate(k);
        debug!(neighbours = indexed_scores.len(), candidates = position.len(), "ranked users");
        votes.into_iter().map(|(user, _)| user.clone()).collect()
    }

    pub fn recommend_all(&self, queries: &Array2<f32>, k: usize) -> Vec<Vec<Id>> {
        queries
        .axis_iter(Axis(0))
        .map(|query| self.recommend(query, k))
        .collect()
    }

}
