//! Training and evaluation metrics
//!
//! Evaluation keeps raw sums until the end so workers can add them together
//! before any ratio is taken. A class with no evaluation samples has no
//! accuracy (`None`) and is left out of every mean.

use crate::tensor::{self, Matrix};
use crate::{LearningError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of rows whose label is within the `k` highest logits
pub fn top_k_correct(logits: &Matrix, labels: &[usize], k: usize) -> usize {
    (0..logits.rows())
        .zip(labels)
        .filter(|&(b, &label)| tensor::top_k_largest(logits.row(b), k).contains(&label))
        .count()
}

/// Index of the highest logit per row
pub fn argmax(logits: &Matrix) -> Vec<usize> {
    (0..logits.rows())
        .map(|b| tensor::top_k_largest(logits.row(b), 1).first().copied().unwrap_or(0))
        .collect()
}

/// Per-step training report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Mean loss over the optimizer steps of one stream event
    pub loss: f32,
    /// Top-k accuracy over every sample those steps saw
    pub acc: f32,
    /// Optimizer steps taken
    pub iterations: usize,
    /// Learning rate after the last step
    pub lr: f32,
}

/// Raw evaluation sums
#[derive(Debug, Clone, PartialEq)]
pub struct EvalAccumulator {
    loss_sum: f32,
    batches: f32,
    correct: f32,
    total: f32,
    class_correct: Vec<f32>,
    class_count: Vec<f32>,
    topk: usize,
}

impl EvalAccumulator {
    pub fn new(num_classes: usize, topk: usize) -> Self {
        Self {
            loss_sum: 0.0,
            batches: 0.0,
            correct: 0.0,
            total: 0.0,
            class_correct: vec![0.0; num_classes],
            class_count: vec![0.0; num_classes],
            topk: topk.max(1),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_count.len()
    }

    /// Add one evaluation batch
    pub fn observe(&mut self, logits: &Matrix, labels: &[usize], loss: f32) -> Result<()> {
        if logits.rows() != labels.len() {
            return Err(LearningError::shape(&[labels.len()], &[logits.rows()]));
        }
        if logits.cols() != self.num_classes() {
            return Err(LearningError::shape(&[self.num_classes()], &[logits.cols()]));
        }

        self.loss_sum += loss;
        self.batches += 1.0;
        self.correct += top_k_correct(logits, labels, self.topk) as f32;
        self.total += labels.len() as f32;

        for (&label, pred) in labels.iter().zip(argmax(logits)) {
            if label >= self.num_classes() {
                return Err(LearningError::precondition(
                    "evaluation label is an exposed class",
                    label,
                ));
            }
            self.class_count[label] += 1.0;
            if pred == label {
                self.class_correct[label] += 1.0;
            }
        }
        Ok(())
    }

    /// Flatten into one buffer for a sum all-reduce
    pub fn to_flat(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(4 + 2 * self.num_classes());
        out.extend_from_slice(&[self.loss_sum, self.batches, self.correct, self.total]);
        out.extend_from_slice(&self.class_correct);
        out.extend_from_slice(&self.class_count);
        out
    }

    /// Overwrite the sums with a reduced buffer from `to_flat`
    pub fn load_flat(&mut self, flat: &[f32]) -> Result<()> {
        let n = self.num_classes();
        if flat.len() != 4 + 2 * n {
            return Err(LearningError::shape(&[4 + 2 * n], &[flat.len()]));
        }
        self.loss_sum = flat[0];
        self.batches = flat[1];
        self.correct = flat[2];
        self.total = flat[3];
        self.class_correct.copy_from_slice(&flat[4..4 + n]);
        self.class_count.copy_from_slice(&flat[4 + n..]);
        Ok(())
    }

    /// Accuracy of one class, or the degenerate-metric error when it had no samples
    pub fn class_accuracy(&self, class_index: usize) -> Result<f32> {
        match self.class_count.get(class_index) {
            Some(&count) if count > 0.0 => Ok(self.class_correct[class_index] / count),
            _ => Err(LearningError::DegenerateMetric { class_index }),
        }
    }

    pub fn finish(&self) -> EvalReport {
        let per_class_acc = (0..self.num_classes())
            .map(|c| match self.class_accuracy(c) {
                Ok(acc) => Some(acc),
                Err(e) => {
                    debug!(error = %e, "class excluded from accuracy mean");
                    None
                }
            })
            .collect();

        EvalReport {
            avg_loss: if self.batches > 0.0 {
                self.loss_sum / self.batches
            } else {
                0.0
            },
            avg_acc: if self.total > 0.0 {
                self.correct / self.total
            } else {
                0.0
            },
            per_class_acc,
        }
    }
}

/// Result of one evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub avg_loss: f32,
    pub avg_acc: f32,
    /// Indexed by head output; `None` for classes without samples
    pub per_class_acc: Vec<Option<f32>>,
}

impl EvalReport {
    /// Mean over classes that had samples
    pub fn mean_class_accuracy(&self) -> Option<f32> {
        mean(self.per_class_acc.iter().flatten().copied())
    }
}

/// Accuracy at a task boundary; never changed after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    task: usize,
    samples_seen: u64,
    task_accuracy: f32,
    per_class_acc: Vec<Option<f32>>,
}

impl TaskRecord {
    pub fn new(task: usize, samples_seen: u64, report: &EvalReport) -> Self {
        Self {
            task,
            samples_seen,
            task_accuracy: report.avg_acc,
            per_class_acc: report.per_class_acc.clone(),
        }
    }

    pub fn task(&self) -> usize {
        self.task
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn task_accuracy(&self) -> f32 {
        self.task_accuracy
    }

    pub fn per_class_acc(&self) -> &[Option<f32>] {
        &self.per_class_acc
    }
}

/// Whole-run accuracy and forgetting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Mean of the periodic evaluation accuracies
    pub a_auc: f32,
    /// Mean task-boundary accuracy
    pub a_avg: f32,
    /// Accuracy after the last task
    pub a_last: f32,
    /// Mean drop from each class's best earlier accuracy to its last one
    pub f_last: f32,
}

impl RunSummary {
    pub fn from_records(periodic_acc: &[f32], records: &[TaskRecord]) -> Self {
        let a_auc = mean(periodic_acc.iter().copied()).unwrap_or(0.0);
        let a_avg = mean(records.iter().map(TaskRecord::task_accuracy)).unwrap_or(0.0);
        let a_last = records.last().map(TaskRecord::task_accuracy).unwrap_or(0.0);

        let f_last = match records.split_last() {
            Some((last, earlier)) if !earlier.is_empty() => {
                let drops = last.per_class_acc().iter().enumerate().filter_map(|(c, now)| {
                    let best = earlier
                        .iter()
                        .filter_map(|r| r.per_class_acc().get(c).copied().flatten())
                        .fold(f32::NEG_INFINITY, f32::max);
                    let now = (*now)?;
                    (best > 0.0).then(|| best - now)
                });
                mean(drops).unwrap_or(0.0)
            }
            _ => 0.0,
        };

        Self {
            a_auc,
            a_avg,
            a_last,
            f_last,
        }
    }
}

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f32)
}
