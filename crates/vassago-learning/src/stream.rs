//! Stream events and the held-out evaluation set

use crate::head::{ClassId, ClassRegistry};
use crate::tensor::{InputBatch, InputShape};
use crate::{LearningError, Result};

/// Inputs with their stream labels
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledBatch {
    pub inputs: InputBatch,
    pub labels: Vec<ClassId>,
}

impl LabeledBatch {
    pub fn new(inputs: InputBatch, labels: Vec<ClassId>) -> Result<Self> {
        if inputs.len() != labels.len() {
            return Err(LearningError::shape(&[inputs.len()], &[labels.len()]));
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows `rank, rank + world_size, ...` of the batch
    pub fn shard(&self, rank: usize, world_size: usize) -> Result<LabeledBatch> {
        let rows: Vec<usize> = (rank..self.len()).step_by(world_size.max(1)).collect();
        let samples: Vec<&[f32]> = rows.iter().map(|&i| self.inputs.sample(i)).collect();
        Ok(LabeledBatch {
            inputs: InputBatch::from_samples(self.inputs.shape(), &samples)?,
            labels: rows.iter().map(|&i| self.labels[i]).collect(),
        })
    }
}

/// One step of a class-incremental stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Training samples
    Batch(LabeledBatch),
    /// The task with this id has ended
    EndOfTask(usize),
}

/// Held-out samples; evaluation only uses exposed classes
#[derive(Debug, Clone, Default)]
pub struct EvalSet {
    shape: Option<InputShape>,
    samples: Vec<Vec<f32>>,
    labels: Vec<ClassId>,
}

impl EvalSet {
    pub fn new(shape: InputShape) -> Self {
        Self {
            shape: Some(shape),
            samples: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn push(&mut self, sample: Vec<f32>, label: ClassId) -> Result<()> {
        let shape = self.shape.unwrap_or_else(|| InputShape::flat(sample.len()));
        if sample.len() != shape.numel() {
            return Err(LearningError::shape(&[shape.numel()], &[sample.len()]));
        }
        self.shape = Some(shape);
        self.samples.push(sample);
        self.labels.push(label);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// This worker's batches over exposed classes, labels as head indices
    pub fn batches(
        &self,
        registry: &ClassRegistry,
        batch_size: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Vec<(InputBatch, Vec<usize>)>> {
        let Some(shape) = self.shape else {
            return Ok(Vec::new());
        };
        let visible: Vec<(usize, usize)> = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, &label)| registry.index_of(label).map(|idx| (i, idx)))
            .skip(rank)
            .step_by(world_size.max(1))
            .collect();

        visible
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let samples: Vec<&[f32]> =
                    chunk.iter().map(|&(i, _)| self.samples[i].as_slice()).collect();
                let inputs = InputBatch::from_samples(shape, &samples)?;
                Ok((inputs, chunk.iter().map(|&(_, idx)| idx).collect()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> LabeledBatch {
        let shape = InputShape::flat(1);
        let samples: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32]).collect();
        LabeledBatch::new(InputBatch::from_samples(shape, &samples).unwrap(), vec![10, 11, 12, 13, 14])
            .unwrap()
    }

    #[test]
    fn test_label_count_checked() {
        let inputs = InputBatch::from_samples(InputShape::flat(1), &[vec![0.0]]).unwrap();
        assert!(LabeledBatch::new(inputs, vec![1, 2]).is_err());
    }

    #[test]
    fn test_shard_interleaves_rows() {
        let b = batch();
        let s0 = b.shard(0, 2).unwrap();
        let s1 = b.shard(1, 2).unwrap();
        assert_eq!(s0.labels, vec![10, 12, 14]);
        assert_eq!(s1.labels, vec![11, 13]);
        assert_eq!(s1.inputs.sample(1), &[3.0]);
        assert_eq!(b.shard(0, 1).unwrap(), b);
    }

    #[test]
    fn test_eval_batches_only_exposed() {
        let mut eval = EvalSet::new(InputShape::flat(1));
        for (i, label) in [5u32, 6, 5, 7, 6].into_iter().enumerate() {
            eval.push(vec![i as f32], label).unwrap();
        }
        let mut registry = ClassRegistry::new();
        registry.register(6);
        registry.register(5);

        let batches = eval.batches(&registry, 3, 0, 1).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1, vec![1, 0, 1]);
        assert_eq!(batches[1].1, vec![0]);

        let rank1 = eval.batches(&registry, 8, 1, 2).unwrap();
        assert_eq!(rank1[0].1, vec![0, 0]);
    }
}
