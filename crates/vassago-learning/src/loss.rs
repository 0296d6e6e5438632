//! Training objectives and their analytic gradients
//!
//! Key regularizers return gradients per pool slot, keyed by slot index.

use crate::mixing::Mixed;
use crate::prompt::{PromptPool, Selection};
use crate::tensor::{self, Matrix};
use crate::{LearningError, Result};
use std::collections::BTreeMap;

/// Guard inside the contrastive log
const CONTRASTIVE_EPS: f32 = 1e-6;

/// Gradients of a key regularizer, by slot
pub type KeyGradients = BTreeMap<usize, Vec<f32>>;

/// Mean cross-entropy over rows and its gradient with respect to the logits
pub fn cross_entropy(logits: &Matrix, labels: &[usize]) -> Result<(f32, Matrix)> {
    weighted_cross_entropy(logits, &[(labels, 1.0)])
}

/// `lam * CE(labels_a) + (1 - lam) * CE(labels_b)` for a mixed batch
pub fn mixed_cross_entropy(logits: &Matrix, mixed: &Mixed) -> Result<(f32, Matrix)> {
    weighted_cross_entropy(
        logits,
        &[
            (mixed.labels_a.as_slice(), mixed.lam),
            (mixed.labels_b.as_slice(), 1.0 - mixed.lam),
        ],
    )
}

fn weighted_cross_entropy(logits: &Matrix, targets: &[(&[usize], f32)]) -> Result<(f32, Matrix)> {
    let (batch, classes) = (logits.rows(), logits.cols());
    let mut grad = Matrix::zeros(batch, classes);
    if batch == 0 {
        return Ok((0.0, grad));
    }

    let mut loss = 0.0;
    for b in 0..batch {
        let probs = tensor::softmax(logits.row(b));
        let g = grad.row_mut(b);
        for (labels, weight) in targets {
            let label = *labels
                .get(b)
                .ok_or_else(|| LearningError::shape(&[batch], &[labels.len()]))?;
            if label >= classes {
                return Err(LearningError::precondition("label < exposed classes", label));
            }
            loss -= weight * probs[label].max(f32::MIN_POSITIVE).ln();
            for (c, (gc, p)) in g.iter_mut().zip(&probs).enumerate() {
                let target = if c == label { 1.0 } else { 0.0 };
                *gc += weight * (p - target) / batch as f32;
            }
        }
    }
    Ok((loss / batch as f32, grad))
}

/// `weight * mean(distance to every chosen key)`
pub fn pull_constraint(
    query: &Matrix,
    pool: &PromptPool,
    selection: &Selection,
    weight: f32,
) -> (f32, KeyGradients) {
    let mut grads = KeyGradients::new();
    let pairs = selection.distance.data().len();
    if pairs == 0 {
        return (0.0, grads);
    }

    let scale = weight / pairs as f32;
    for (b, row) in selection.indices.iter().enumerate() {
        for &s in row {
            let key = &pool.slots()[s].key;
            let g = tensor::cosine_distance_grad(query.row(b), key);
            add_scaled(&mut grads, s, &g, scale);
        }
    }
    (weight * selection.mean_distance(), grads)
}

/// Contrast chosen query-key distances against key-key distances
///
/// With mass `m_t` of chosen slot `t`, `A = sum exp(K[t, i] / m_t)` over
/// every key `i` and `B = sum exp(d(q, k_t) / m_t)` over every choice, the
/// loss is `-ln(A / (A + B) + eps)`: small when chosen keys sit close to
/// their queries and far from the rest of the pool. Masses are constants.
pub fn contrastive_key_loss(
    query: &Matrix,
    pool: &PromptPool,
    selection: &Selection,
    weight: f32,
) -> (f32, KeyGradients) {
    let mut grads = KeyGradients::new();
    if selection.distance.data().is_empty() {
        return (0.0, grads);
    }

    let keys: Vec<&[f32]> = pool.keys().collect();
    let key_dist = pool.key_distances();

    let mut a = 0.0;
    let mut bs = 0.0;
    for (b, row) in selection.indices.iter().enumerate() {
        for (j, &t) in row.iter().enumerate() {
            let m = pool.slots()[t].mass();
            a += key_dist.row(t).iter().map(|k| (k / m).exp()).sum::<f32>();
            bs += (selection.distance.row(b)[j] / m).exp();
        }
    }

    let total = a + bs;
    let ratio = a / total;
    let loss = -(ratio + CONTRASTIVE_EPS).ln();

    let outer = -1.0 / (ratio + CONTRASTIVE_EPS);
    let d_a = weight * outer * bs / (total * total);
    let d_b = -weight * outer * a / (total * total);

    for (b, row) in selection.indices.iter().enumerate() {
        for (j, &t) in row.iter().enumerate() {
            let m = pool.slots()[t].mass();
            for (i, key_i) in keys.iter().enumerate() {
                if i == t {
                    continue;
                }
                let e = (key_dist.row(t)[i] / m).exp() / m;
                add_scaled(&mut grads, i, &tensor::cosine_distance_grad(keys[t], key_i), d_a * e);
                add_scaled(&mut grads, t, &tensor::cosine_distance_grad(key_i, keys[t]), d_a * e);
            }
            let e = (selection.distance.row(b)[j] / m).exp() / m;
            add_scaled(&mut grads, t, &tensor::cosine_distance_grad(query.row(b), keys[t]), d_b * e);
        }
    }
    (weight * loss, grads)
}

fn add_scaled(grads: &mut KeyGradients, slot: usize, g: &[f32], scale: f32) {
    let acc = grads.entry(slot).or_insert_with(|| vec![0.0; g.len()]);
    for (a, v) in acc.iter_mut().zip(g) {
        *a += scale * v;
    }
}

/// Scale logits by `2 * sigmoid(mask)`, element-wise
pub fn apply_class_mask(logits: &Matrix, mask: &Matrix) -> Result<Matrix> {
    if logits.shape() != mask.shape() {
        return Err(LearningError::shape(&logits.shape(), &mask.shape()));
    }
    let data = logits
        .data()
        .iter()
        .zip(mask.data())
        .map(|(x, m)| x * 2.0 * sigmoid(*m))
        .collect();
    Matrix::from_vec(logits.rows(), logits.cols(), data)
}

/// Backward of [`apply_class_mask`]
///
/// Takes the unmasked logits and the gradient of the masked ones; returns the
/// gradients of the unmasked logits and of the mask logits.
pub fn class_mask_backward(
    logits: &Matrix,
    mask: &Matrix,
    grad: &Matrix,
) -> Result<(Matrix, Matrix)> {
    if logits.shape() != mask.shape() || grad.shape() != mask.shape() {
        return Err(LearningError::shape(&mask.shape(), &grad.shape()));
    }
    let [rows, cols] = mask.shape();
    let mut grad_logits = Matrix::zeros(rows, cols);
    let mut grad_mask = Matrix::zeros(rows, cols);
    for (i, ((x, m), g)) in logits.data().iter().zip(mask.data()).zip(grad.data()).enumerate() {
        let s = sigmoid(*m);
        grad_logits.data_mut()[i] = g * 2.0 * s;
        grad_mask.data_mut()[i] = g * x * 2.0 * s * (1.0 - s);
    }
    Ok((grad_logits, grad_mask))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
