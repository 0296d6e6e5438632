//! Dense row-major buffers and the vector math shared by the learner

use crate::{LearningError, Result};
use serde::{Deserialize, Serialize};

/// Denominator floor for cosine similarity
const COSINE_EPS: f32 = 1e-8;

/// Denominator floor for L1 normalization
const L1_EPS: f32 = 1e-12;

/// Row-major 2D buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Zero-filled matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap a flat buffer
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(LearningError::shape(&[rows * cols], &[data.len()]));
        }
        Ok(Self { rows, cols, data })
    }

    /// Stack equally sized rows
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(LearningError::shape(&[cols], &[row.len()]));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Shape of a single input sample (channels x height x width)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Flat vector of the given length
    pub fn flat(len: usize) -> Self {
        Self::new(1, 1, len)
    }

    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Batch of raw inputs handed to the backbone
#[derive(Debug, Clone, PartialEq)]
pub struct InputBatch {
    shape: InputShape,
    batch: usize,
    data: Vec<f32>,
}

impl InputBatch {
    pub fn new(shape: InputShape, batch: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != batch * shape.numel() {
            return Err(LearningError::shape(
                &[batch, shape.channels, shape.height, shape.width],
                &[data.len()],
            ));
        }
        Ok(Self { shape, batch, data })
    }

    /// Concatenate single samples into a batch
    pub fn from_samples<S: AsRef<[f32]>>(shape: InputShape, samples: &[S]) -> Result<Self> {
        let mut data = Vec::with_capacity(samples.len() * shape.numel());
        for sample in samples {
            let sample = sample.as_ref();
            if sample.len() != shape.numel() {
                return Err(LearningError::shape(&[shape.numel()], &[sample.len()]));
            }
            data.extend_from_slice(sample);
        }
        Ok(Self {
            shape,
            batch: samples.len(),
            data,
        })
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.batch
    }

    pub fn is_empty(&self) -> bool {
        self.batch == 0
    }

    pub fn sample(&self, i: usize) -> &[f32] {
        let n = self.shape.numel();
        &self.data[i * n..(i + 1) * n]
    }

    pub fn sample_mut(&mut self, i: usize) -> &mut [f32] {
        let n = self.shape.numel();
        &mut self.data[i * n..(i + 1) * n]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Token sequences produced by the backbone: [batch, tokens, dim]
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    pub batch: usize,
    pub tokens: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl TokenBatch {
    pub fn new(batch: usize, tokens: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != batch * tokens * dim {
            return Err(LearningError::shape(&[batch, tokens, dim], &[data.len()]));
        }
        Ok(Self {
            batch,
            tokens,
            dim,
            data,
        })
    }

    pub fn token(&self, b: usize, t: usize) -> &[f32] {
        let start = (b * self.tokens + t) * self.dim;
        &self.data[start..start + self.dim]
    }
}

/// Prompts gathered per sample: [batch, count, len, dim]
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBatch {
    pub batch: usize,
    pub count: usize,
    pub len: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl PromptBatch {
    pub fn zeros(batch: usize, count: usize, len: usize, dim: usize) -> Self {
        Self {
            batch,
            count,
            len,
            dim,
            data: vec![0.0; batch * count * len * dim],
        }
    }

    /// Same prompt tensor repeated for every sample
    pub fn repeated(prompt: &[f32], batch: usize, len: usize, dim: usize) -> Self {
        let mut data = Vec::with_capacity(batch * prompt.len());
        for _ in 0..batch {
            data.extend_from_slice(prompt);
        }
        Self {
            batch,
            count: 1,
            len,
            dim,
            data,
        }
    }

    /// Prompt rows per sample (count * len)
    pub fn rows_per_sample(&self) -> usize {
        self.count * self.len
    }

    pub fn prompt(&self, b: usize, j: usize) -> &[f32] {
        let size = self.len * self.dim;
        let start = (b * self.count + j) * size;
        &self.data[start..start + size]
    }

    pub fn prompt_mut(&mut self, b: usize, j: usize) -> &mut [f32] {
        let size = self.len * self.dim;
        let start = (b * self.count + j) * size;
        &mut self.data[start..start + size]
    }

    /// One prompt row of one sample, flattened across prompts
    pub fn row(&self, b: usize, r: usize) -> &[f32] {
        let start = (b * self.rows_per_sample() + r) * self.dim;
        &self.data[start..start + self.dim]
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Cosine similarity with the denominator clamped away from zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b) / (norm(a) * norm(b)).max(COSINE_EPS)
}

/// `1 - cos(a, b)`, in [0, 2]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Gradient of `1 - cos(a, b)` with respect to `b`
pub fn cosine_distance_grad(a: &[f32], b: &[f32]) -> Vec<f32> {
    let na = norm(a);
    let nb = norm(b);
    if na * nb < COSINE_EPS {
        return vec![0.0; b.len()];
    }
    let cos = dot(a, b) / (na * nb);
    a.iter()
        .zip(b)
        .map(|(x, y)| -(x / (na * nb) - cos * y / (nb * nb)))
        .collect()
}

/// Divide by the L1 norm
pub fn l1_normalize(v: &[f32]) -> Vec<f32> {
    let total: f32 = v.iter().map(|x| x.abs()).sum();
    let denom = total.max(L1_EPS);
    v.iter().map(|x| x / denom).collect()
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices of the `k` smallest values, ascending; ties go to the lower index
pub fn top_k_smallest(values: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

/// Indices of the `k` largest values, descending; ties go to the lower index
pub fn top_k_largest(values: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}
