//! Cross-product checks over random minterm sets: a set crossed with
//! the full space equals the corresponding row (column) relation, and
//! the product of the projections is the full cross product.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use mdd_rs::{cross_product, Domain, Edge, EdgeLabeling, Forest, Policies, RangeType, Terminal, DONT_CARE};

const VARS: usize = 6;
const BOUND: i32 = 4;

fn random_minterms(rng: &mut ChaCha8Rng, count: usize) -> Vec<Vec<i32>> {
    (0..count)
        .map(|_| (0..VARS).map(|_| rng.gen_range(0..BOUND)).collect())
        .collect()
}

fn setup() -> (Forest, Forest) {
    let domain = Domain::bottom_up(&[BOUND as u32; VARS]).unwrap();
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
    (mdd, mxd)
}

fn rows_relation(mxd: &Forest, minterms: &[Vec<i32>]) -> Edge {
    let cols = vec![vec![DONT_CARE; VARS]; minterms.len()];
    mxd.edge_from_relation_minterms(minterms, &cols, None).unwrap()
}

fn cols_relation(mxd: &Forest, minterms: &[Vec<i32>]) -> Edge {
    let rows = vec![vec![DONT_CARE; VARS]; minterms.len()];
    mxd.edge_from_relation_minterms(&rows, minterms, None).unwrap()
}

#[test_log::test]
fn cross_product_matches_projections() {
    let mut rng = ChaCha8Rng::seed_from_u64(123456789);
    let (mdd, mxd) = setup();
    let one = mdd.constant(Terminal::Bool(true)).unwrap();

    for m in 1..=20 {
        let row_terms = random_minterms(&mut rng, m);
        let rs = mdd.edge_from_minterms(&row_terms, None).unwrap();
        let rr = rows_relation(&mxd, &row_terms);

        // RS x 1 must equal the row relation built from minterms.
        let cross_rows = cross_product(&rs, &one, &mxd).unwrap();
        assert_eq!(cross_rows, rr, "row projection mismatch at m = {}", m);

        let col_terms = random_minterms(&mut rng, m);
        let cs = mdd.edge_from_minterms(&col_terms, None).unwrap();
        let cr = cols_relation(&mxd, &col_terms);

        let cross_cols = cross_product(&one, &cs, &mxd).unwrap();
        assert_eq!(cross_cols, cr, "column projection mismatch at m = {}", m);

        // Intersecting the projections gives the full product.
        let full = cross_product(&rs, &cs, &mxd).unwrap();
        let intersected = cross_rows.intersection(&cross_cols).unwrap();
        assert_eq!(intersected, full, "cross product mismatch at m = {}", m);
    }
}

#[test_log::test]
fn cross_cardinality_is_product() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let (mdd, mxd) = setup();
    let a_terms = random_minterms(&mut rng, 8);
    let b_terms = random_minterms(&mut rng, 5);
    let a = mdd.edge_from_minterms(&a_terms, None).unwrap();
    let b = mdd.edge_from_minterms(&b_terms, None).unwrap();
    let cross = cross_product(&a, &b, &mxd).unwrap();
    assert_eq!(cross.cardinality(), a.cardinality() * b.cardinality());
}
