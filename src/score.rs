use crate::error::RecError;

use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub precision: f32,
    pub recall: f32,
}

impl Display for Scores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "precision: {:.4} recall: {:.4}", self.precision, self.recall)
    }
}

fn check_lengths<P, T>(predictions: &[P], truths: &[T]) -> Result<(), RecError> {
    if predictions.len() != truths.len() {
        return Err(RecError::LengthMismatch { predictions: predictions.len(), truths: truths.len() });
    }
    if predictions.is_empty() {
        return Err(RecError::EmptyInput);
    }
    Ok(())
}

fn n_hits<T: Eq + Hash>(y_pred: &[T], y: &[T]) -> usize {
    let y_pred: HashSet<&T> = y_pred.iter().collect();
    let y: HashSet<&T> = y.iter().collect();
    y_pred.intersection(&y).count()
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

/// Average precision@20: for a given question, the share of predicted users
/// who answered it.
pub fn precision_k<T: Eq + Hash>(predictions: &[Vec<T>], truths: &[Vec<T>]) -> Result<f32, RecError> {

    check_lengths(predictions, truths)?;
    let mut precision_k = Vec::with_capacity(predictions.len());
    for (index, (y_pred, y)) in predictions.iter().zip(truths).enumerate() {
        if y_pred.is_empty() {
            return Err(RecError::EmptyPrediction { index });
        }
        precision_k.push(n_hits(y_pred, y) as f32 / y_pred.len() as f32);
    }
    Ok(mean(&precision_k))
}

/// Average recall@20: for a given question, the share of its answerers found
/// among the predicted users.
pub fn recall_k<T: Eq + Hash>(predictions: &[Vec<T>], truths: &[Vec<T>]) -> Result<f32, RecError> {

    check_lengths(predictions, truths)?;
    let mut recall_k = Vec::with_capacity(predictions.len());
    for (index, (y_pred, y)) in predictions.iter().zip(truths).enumerate() {
        if y.is_empty() {
            return Err(RecError::EmptyTruth { index });
        }
        // a repeated answerer counts once
        let n_truth = y.iter().collect::<HashSet<&T>>().len();
        recall_k.push(n_hits(y_pred, y) as f32 / n_truth as f32);
    }
    Ok(mean(&recall_k))
}

pub fn evaluate<T: Eq + Hash>(predictions: &[Vec<T>], truths: &[Vec<T>]) -> Result<Scores, RecError> {
    Ok(Scores {
        precision: precision_k(predictions, truths)?,
        recall: recall_k(predictions, truths)?,
    })
}
