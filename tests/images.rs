//! Pre/post images and the EV+ matrix multiplies on small hand-built
//! systems.

use mdd_rs::{
    lift_to_ev_plus, mat_vec_multiply, post_image, pre_image, vec_mat_multiply, Domain, Edge,
    EdgeLabeling, EdgeValue, Forest, Policies, RangeType, Terminal, DONT_CARE, DONT_CHANGE,
};

fn setup() -> (Forest, Forest, Edge) {
    let domain = Domain::bottom_up(&[2, 2]).unwrap();
    let mdd = domain
        .new_forest(
            false,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(false),
        )
        .unwrap();
    let mxd = domain
        .new_forest(
            true,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(true),
        )
        .unwrap();
    // (0,0) -> (1,0) and (1,0) -> (1,1).
    let rel = mxd
        .edge_from_relation_minterms(
            &[vec![0, 0], vec![1, 0]],
            &[vec![1, 0], vec![1, 1]],
            None,
        )
        .unwrap();
    (mdd, mxd, rel)
}

#[test_log::test]
fn post_image_fires_one_step() {
    let (mdd, _mxd, rel) = setup();
    let start = mdd.edge_from_minterms(&[vec![0, 0]], None).unwrap();
    let step1 = post_image(&start, &rel).unwrap();
    assert_eq!(step1, mdd.edge_from_minterms(&[vec![1, 0]], None).unwrap());
    let step2 = post_image(&step1, &rel).unwrap();
    assert_eq!(step2, mdd.edge_from_minterms(&[vec![1, 1]], None).unwrap());
    assert!(post_image(&step2, &rel).unwrap().is_transparent());
}

#[test_log::test]
fn pre_image_reverses_post() {
    let (mdd, _mxd, rel) = setup();
    let target = mdd.edge_from_minterms(&[vec![1, 1]], None).unwrap();
    let pre = pre_image(&target, &rel).unwrap();
    assert_eq!(pre, mdd.edge_from_minterms(&[vec![1, 0]], None).unwrap());
}

#[test_log::test]
fn identity_relation_is_a_fixed_point() {
    let domain = Domain::bottom_up(&[3, 3]).unwrap();
    let mdd = domain
        .new_forest(
            false,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(false),
        )
        .unwrap();
    let mxd = domain
        .new_forest(
            true,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(true),
        )
        .unwrap();
    // Don't-care / don't-change on every variable: the identity.
    let ident = mxd
        .edge_from_relation_minterms(
            &[vec![DONT_CARE, DONT_CARE]],
            &[vec![DONT_CHANGE, DONT_CHANGE]],
            None,
        )
        .unwrap();
    let set = mdd
        .edge_from_minterms(&[vec![0, 1], vec![2, 2], vec![1, 0]], None)
        .unwrap();
    assert_eq!(post_image(&set, &ident).unwrap(), set);
    assert_eq!(pre_image(&set, &ident).unwrap(), set);
}

#[test_log::test]
fn min_plus_matrix_vector() {
    let domain = Domain::bottom_up(&[3]).unwrap();
    let vec_forest = domain
        .new_forest(false, RangeType::Integer, EdgeLabeling::EvPlus, Policies::new(false))
        .unwrap();
    let mat_forest = domain
        .new_forest(true, RangeType::Integer, EdgeLabeling::EvPlus, Policies::new(true))
        .unwrap();
    let rel_forest = domain
        .new_forest(
            true,
            RangeType::Boolean,
            EdgeLabeling::MultiTerminal,
            Policies::new(true),
        )
        .unwrap();

    // The lift maps the boolean 1-terminal to value 1, so every arc of
    // the skeleton costs one step: M[0][1] = M[1][2] = 1.
    let skeleton = rel_forest
        .edge_from_relation_minterms(&[vec![0], vec![1]], &[vec![1], vec![2]], None)
        .unwrap();
    let matrix = lift_to_ev_plus(&mat_forest, &skeleton).unwrap();

    // v = {state 2 at cost 0}.
    let v = vec_forest
        .edge_from_minterms(&[vec![2]], Some(&[Terminal::Int(0)]))
        .unwrap();

    // y[i] = min_j (M[i][j] + v[j]): only state 1 reaches 2.
    let y = mat_vec_multiply(&matrix, &v).unwrap();
    let (v1, t1) = y.evaluate(&[1], None).unwrap();
    assert!(t1.as_bool());
    assert_eq!(v1, EdgeValue::Plus(1));
    let (_, t0) = y.evaluate(&[0], None).unwrap();
    assert!(!t0.as_bool());

    // Backward: from {state 0} one application reaches state 1.
    let v0 = vec_forest
        .edge_from_minterms(&[vec![0]], Some(&[Terminal::Int(0)]))
        .unwrap();
    let z = vec_mat_multiply(&v0, &matrix).unwrap();
    let (z1, tz) = z.evaluate(&[1], None).unwrap();
    assert!(tz.as_bool());
    assert_eq!(z1, EdgeValue::Plus(1));
}
