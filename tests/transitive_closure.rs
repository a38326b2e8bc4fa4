//! Distance-annotated transitive closure of a small hand-built chain.

use mdd_rs::{transitive_closure, Domain, EdgeLabeling, EdgeValue, Policies, RangeType};

#[test_log::test]
fn three_state_chain_distances() {
    // One variable with bound 4; transitions 0 -> 1 -> 2, state 3 inert.
    let domain = Domain::bottom_up(&[4]).unwrap();
    let rel_forest = domain
        .new_forest(
            true,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(true),
        )
        .unwrap();
    let closure_forest = domain
        .new_forest(true, RangeType::Integer, EdgeLabeling::EvPlus, Policies::new(true))
        .unwrap();

    let rel = rel_forest
        .edge_from_relation_minterms(&[vec![0], vec![1]], &[vec![1], vec![2]], None)
        .unwrap();
    let closure = transitive_closure(&rel, &closure_forest).unwrap();

    let distance = |s: i32, t: i32| -> Option<i64> {
        let (v, term) = closure.evaluate(&[s], Some(&[t])).unwrap();
        if term.as_bool() {
            Some(v.plus())
        } else {
            None
        }
    };

    // Diagonal at distance 0.
    for s in 0..4 {
        assert_eq!(distance(s, s), Some(0), "diagonal at {}", s);
    }
    // Chain steps.
    assert_eq!(distance(0, 1), Some(1));
    assert_eq!(distance(1, 2), Some(1));
    assert_eq!(distance(0, 2), Some(2));
    // Nothing else is reachable.
    for (s, t) in [(1, 0), (2, 0), (2, 1), (0, 3), (3, 0), (3, 2), (1, 3)] {
        assert_eq!(distance(s, t), None, "unexpected path {} -> {}", s, t);
    }

    // The closure is itself closed.
    let minterms: Vec<(Vec<i32>, Vec<i32>, i64)> = closure
        .minterms()
        .map(|m| (m.unprimed.clone(), m.primed.clone().unwrap(), m.value.plus()))
        .collect();
    assert_eq!(minterms.len(), 7);

    // Root value holds the minimum distance overall.
    assert_eq!(closure.value(), EdgeValue::Plus(0));
}
