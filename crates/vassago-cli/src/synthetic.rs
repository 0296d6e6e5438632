//! Synthetic class-incremental stream
//!
//! Each class is a Gaussian cluster around a random center. Classes are
//! shuffled, split into disjoint task groups, and streamed task by task.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use vassago_learning::{
    ClassId, EvalSet, InputBatch, InputShape, LabeledBatch, LearningError, Result, StreamEvent,
};

use crate::config::StreamConfig;

/// Training events plus the held-out evaluation set
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub shape: InputShape,
    pub events: Vec<StreamEvent>,
    pub eval: EvalSet,
    /// Class ids of each task, in stream order
    pub tasks: Vec<Vec<ClassId>>,
}

pub fn generate(config: &StreamConfig, batch_size: usize) -> Result<SyntheticData> {
    let shape = InputShape::new(config.channels, config.height, config.width);
    let dim = shape.numel();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let center_dist = Normal::new(0.0f32, config.separation)
        .map_err(|e| LearningError::ConfigError(format!("separation: {}", e)))?;
    let noise = Normal::new(0.0f32, config.noise)
        .map_err(|e| LearningError::ConfigError(format!("noise: {}", e)))?;

    let centers: Vec<Vec<f32>> = (0..config.num_classes)
        .map(|_| (0..dim).map(|_| center_dist.sample(&mut rng)).collect())
        .collect();
    let draw = |class: usize, rng: &mut StdRng| -> Vec<f32> {
        centers[class].iter().map(|c| c + noise.sample(rng)).collect()
    };

    let mut order: Vec<ClassId> = (0..config.num_classes as ClassId).collect();
    order.shuffle(&mut rng);
    let per_task = config.num_classes.div_ceil(config.n_tasks);
    let tasks: Vec<Vec<ClassId>> = order.chunks(per_task).map(<[ClassId]>::to_vec).collect();

    let mut events = Vec::new();
    for (task, classes) in tasks.iter().enumerate() {
        let mut samples: Vec<(Vec<f32>, ClassId)> = Vec::new();
        for &class in classes {
            for _ in 0..config.samples_per_class {
                samples.push((draw(class as usize, &mut rng), class));
            }
        }
        samples.shuffle(&mut rng);

        for chunk in samples.chunks(batch_size.max(1)) {
            let rows: Vec<&[f32]> = chunk.iter().map(|(x, _)| x.as_slice()).collect();
            let inputs = InputBatch::from_samples(shape, &rows)?;
            let labels = chunk.iter().map(|&(_, y)| y).collect();
            events.push(StreamEvent::Batch(LabeledBatch::new(inputs, labels)?));
        }
        events.push(StreamEvent::EndOfTask(task));
    }

    let mut eval = EvalSet::new(shape);
    for class in 0..config.num_classes {
        for _ in 0..config.eval_per_class {
            eval.push(draw(class, &mut rng), class as ClassId)?;
        }
    }

    Ok(SyntheticData {
        shape,
        events,
        eval,
        tasks,
    })
}
