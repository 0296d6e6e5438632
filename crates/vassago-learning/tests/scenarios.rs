//! Behavioural scenarios for the pool, memory, head and expansion.

use vassago_learning::{
    ClassId, DynamicExpansionController, ExpansionConfig, HeadConfig, IncrementalClassifierHead,
    Matrix, MemoryConfig, Optimizer, OptimizerKind, PoolConfig, PromptPool, PromptSlot,
    ReservoirMemory,
};

fn sgd() -> Optimizer {
    Optimizer::new(
        OptimizerKind::Sgd {
            momentum: 0.9,
            weight_decay: 0.0,
        },
        0.01,
    )
}

fn pool_config(pool_size: usize, selection_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        selection_size,
        prompt_len: 2,
        ..Default::default()
    }
}

/// Keys spread around the unit sphere in four dimensions
fn spread_keys(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            let mut key = vec![0.05; 4];
            key[i % 4] = 1.0;
            key[(i / 4 + 1 + i % 4) % 4] += 0.3 * (i / 4) as f32;
            key
        })
        .collect()
}

#[test]
fn test_query_equal_to_key_selects_it() {
    let keys = spread_keys(10);
    let slots = keys
        .iter()
        .enumerate()
        .map(|(i, k)| PromptSlot::new(k.clone(), vec![i as f32; 8]))
        .collect();
    let mut pool = PromptPool::from_slots(pool_config(10, 3), 4, slots, Vec::new()).unwrap();

    let query = Matrix::from_rows(&[keys[2].clone()]).unwrap();
    for diversified in [false, true] {
        let distance = pool.distances(&query).unwrap();
        assert!(distance.row(0)[2].abs() < 1e-6);

        let selection = pool.select(&query, 3, false, diversified).unwrap();
        assert_eq!(selection.indices[0].len(), 3);
        assert!(selection.indices[0].contains(&2));
        assert_eq!(selection.indices[0][0], 2);
        pool.update();
    }
}

#[test]
fn test_small_reservoir_keeps_distinct_exemplars() {
    let mut memory = ReservoirMemory::new(MemoryConfig {
        memory_size: 5,
        seed: Some(42),
    });
    for id in 1..=20u32 {
        memory.offer(id, id % 3);
    }

    assert_eq!(memory.len(), 5);
    assert_eq!(memory.seen(), 20);
    let mut ids: Vec<u32> = memory.exemplars().iter().map(|e| e.payload).collect();
    assert!(ids.iter().all(|&id| (1..=20).contains(&id)));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    for (i, exemplar) in memory.exemplars().iter().enumerate() {
        assert_eq!(exemplar.slot, i);
    }
}

#[test]
fn test_exposure_preserves_learned_rows() {
    let mut optimizer = sgd();
    let mut head = IncrementalClassifierHead::new(4, HeadConfig { seed: Some(3) }, &mut optimizer);
    assert_eq!(head.num_classes(), 0);

    let classes: [ClassId; 3] = [3, 7, 5];
    let mut row_of_3 = None;
    for (expected, &class) in classes.iter().enumerate() {
        let exposure = head.expose(class, &mut optimizer).unwrap();
        assert_eq!(exposure.index(), expected);
        assert_eq!(head.num_classes(), expected + 1);
        if class == 3 {
            row_of_3 = head.row(0).map(<[f32]>::to_vec);
        }
    }

    assert_eq!(head.registry().classes(), &classes);
    assert_eq!(head.row(0).map(<[f32]>::to_vec), row_of_3);
    // Re-exposing is a no-op
    assert!(!head.expose(7, &mut optimizer).unwrap().is_new());
    assert_eq!(head.num_classes(), 3);
}

#[test]
fn test_two_uncovered_samples_spawn_two_slots() {
    let slots = vec![
        PromptSlot::new(vec![1.0, 0.0, 0.0, 0.0], vec![1.0; 8]),
        PromptSlot::new(vec![0.0, 1.0, 0.0, 0.0], vec![2.0; 8]),
    ];
    let mut pool = PromptPool::from_slots(pool_config(2, 1), 4, slots, Vec::new()).unwrap();

    let mut rows = Vec::new();
    for i in 0..6 {
        let mut q = vec![0.0; 4];
        q[i % 2] = 1.0;
        q[(i + 1) % 2] = 0.05 * i as f32;
        rows.push(q);
    }
    rows.push(vec![0.0, 0.1, 1.0, 0.0]);
    rows.push(vec![0.0, 0.0, 0.2, 1.0]);
    let query = Matrix::from_rows(&rows).unwrap();

    let controller = DynamicExpansionController::new(ExpansionConfig {
        enabled: true,
        coverage_constant: 0.3,
    });
    let outcome = controller.expand(&query, &mut pool).unwrap();

    assert_eq!(outcome.uncovered, vec![6, 7]);
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.slot(2).unwrap().key, rows[6]);
    assert_eq!(pool.slot(3).unwrap().key, rows[7]);
    // Warm start copies the nearest prompt
    assert_eq!(pool.slot(2).unwrap().prompt, vec![2.0; 8]);
}

#[test]
fn test_eval_selection_is_deterministic() {
    let slots = spread_keys(10)
        .into_iter()
        .map(|k| PromptSlot::new(k, vec![0.0; 8]))
        .collect();
    let mut pool = PromptPool::from_slots(pool_config(10, 3), 4, slots, Vec::new()).unwrap();
    pool.slot_mut(4).unwrap().frequency = 50.0;
    pool.set_training(false);

    let query = Matrix::from_rows(&[
        vec![0.3, 0.9, 0.1, 0.0],
        vec![-0.2, 0.1, 0.4, 1.0],
        vec![1.0, 1.0, 1.0, 1.0],
    ])
    .unwrap();

    let first = pool.select(&query, 3, false, true).unwrap();
    for _ in 0..5 {
        let again = pool.select(&query, 3, false, true).unwrap();
        assert_eq!(again.indices, first.indices);
    }
    pool.update();
    assert_eq!(pool.slot(4).unwrap().frequency, 50.0);
}
