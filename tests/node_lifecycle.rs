//! Garbage-collection stability under allocate-then-drop churn, and
//! agreement between incremental and batch construction.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use mdd_rs::{Domain, EdgeLabeling, Forest, NodeDeletion, Policies, RangeType};

const VARS: usize = 8;
const BOUND: i32 = 3;

fn forest(deletion: NodeDeletion) -> Forest {
    let domain = Domain::bottom_up(&[BOUND as u32; VARS]).unwrap();
    domain
        .new_forest(
            false,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(false).with_deletion(deletion),
        )
        .unwrap()
}

fn random_minterms(rng: &mut ChaCha8Rng, count: usize) -> Vec<Vec<i32>> {
    (0..count)
        .map(|_| (0..VARS).map(|_| rng.gen_range(0..BOUND)).collect())
        .collect()
}

#[test_log::test]
fn gc_stability_pessimistic() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let f = forest(NodeDeletion::Pessimistic);
    let mut last_peak = 0;
    for _ in 0..50 {
        {
            let a = f
                .edge_from_minterms(&random_minterms(&mut rng, 12), None)
                .unwrap();
            let b = f
                .edge_from_minterms(&random_minterms(&mut rng, 12), None)
                .unwrap();
            let _u = a.union(&b).unwrap();
            assert!(f.active_node_count() > 0);
        }
        // Everything dropped; the compute table may pin zombies but no
        // node is active.
        f.garbage_collect();
        assert_eq!(f.active_node_count(), 0);
        let peak = f.peak_node_count();
        assert!(peak >= last_peak);
        last_peak = peak;
    }
}

#[test_log::test]
fn gc_stability_optimistic() {
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let f = forest(NodeDeletion::Optimistic);
    let mut last_peak = 0;
    for _ in 0..50 {
        {
            let _a = f
                .edge_from_minterms(&random_minterms(&mut rng, 15), None)
                .unwrap();
        }
        f.garbage_collect();
        assert_eq!(f.active_node_count(), 0);
        let peak = f.peak_node_count();
        assert!(peak >= last_peak);
        last_peak = peak;
    }
}

/// A tree of nodes built and reduced incrementally produces the same
/// handle as the equivalent batch construction.
#[test_log::test]
fn incremental_matches_batch() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let f = forest(NodeDeletion::Pessimistic);
    let minterms = random_minterms(&mut rng, 20);

    let batch = f.edge_from_minterms(&minterms, None).unwrap();

    let mut incremental = f.transparent();
    for m in &minterms {
        let single = f.edge_from_minterms(std::slice::from_ref(m), None).unwrap();
        incremental = incremental.union(&single).unwrap();
    }

    assert_eq!(batch, incremental);
}

#[test_log::test]
fn compute_table_counters_move() {
    let mut rng = ChaCha8Rng::seed_from_u64(10);
    let f = forest(NodeDeletion::Pessimistic);
    let a = f
        .edge_from_minterms(&random_minterms(&mut rng, 10), None)
        .unwrap();
    let b = f
        .edge_from_minterms(&random_minterms(&mut rng, 10), None)
        .unwrap();
    let _u1 = a.union(&b).unwrap();
    let (hits_before, misses) = f.compute_table_counters();
    assert!(misses > 0);
    // The identical union is answered from the table top-down.
    let _u2 = a.union(&b).unwrap();
    let (hits_after, _) = f.compute_table_counters();
    assert!(hits_after > hits_before);
}
