//! The Kanban manufacturing model: saturation vs. traditional
//! reachability, and variable reordering on the resulting set.

use mdd_rs::{
    reachable_states_bfs, reachable_states_dfs, Domain, Edge, EdgeLabeling, Forest, Policies,
    RangeType, ReorderStrategy, DONT_CARE, DONT_CHANGE,
};

/// One row per event; position `v` of each string is the effect on
/// variable `v` (`-` take a token, `+` add one, `.` leave unchanged).
const KANBAN: [&str; 16] = [
    "X-+..............", // Tin1
    "X.-+.............", // Tr1
    "X.+-.............", // Tb1
    "X.-.+............", // Tg1
    "X.....-+.........", // Tr2
    "X.....+-.........", // Tb2
    "X.....-.+........", // Tg2
    "X+..--+..-+......", // Ts1_23
    "X.........-+.....", // Tr3
    "X.........+-.....", // Tb3
    "X.........-.+....", // Tg3
    "X....+..-+..--+..", // Ts23_4
    "X.............-+.", // Tr4
    "X.............+-.", // Tb4
    "X............+..-", // Tout4
    "X.............-.+", // Tg4
];

fn build_nsf(mxd: &Forest, tokens: i32) -> Edge {
    let bound = tokens + 1;
    let mut nsf = mxd.transparent();
    for event in KANBAN {
        let chars: Vec<char> = event.chars().collect();
        let mut rows: Vec<Vec<i32>> = vec![vec![DONT_CARE; 16]];
        let mut cols: Vec<Vec<i32>> = vec![vec![DONT_CHANGE; 16]];
        for v in 1..=16usize {
            let transitions: Vec<(i32, i32)> = match chars[v] {
                '-' => (1..bound).map(|i| (i, i - 1)).collect(),
                '+' => (0..bound - 1).map(|i| (i, i + 1)).collect(),
                _ => continue,
            };
            let mut next_rows = Vec::new();
            let mut next_cols = Vec::new();
            for (r, c) in rows.iter().zip(cols.iter()) {
                for &(from, to) in &transitions {
                    let mut r2 = r.clone();
                    let mut c2 = c.clone();
                    r2[v - 1] = from;
                    c2[v - 1] = to;
                    next_rows.push(r2);
                    next_cols.push(c2);
                }
            }
            rows = next_rows;
            cols = next_cols;
        }
        let fired = mxd
            .edge_from_relation_minterms(&rows, &cols, None)
            .unwrap();
        nsf = nsf.union(&fired).unwrap();
    }
    nsf
}

fn setup(tokens: i32) -> (Domain, Forest, Forest, Edge, Edge) {
    let domain = Domain::bottom_up(&[(tokens + 1) as u32; 16]).unwrap();
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

    let mut initial = vec![0i32; 16];
    initial[0] = tokens;
    initial[4] = tokens;
    initial[8] = tokens;
    initial[12] = tokens;
    let init_state = mdd.edge_from_minterms(&[initial], None).unwrap();
    let nsf = build_nsf(&mxd, tokens);
    (domain, mdd, mxd, init_state, nsf)
}

#[test_log::test]
fn kanban_3_saturation_cardinality() {
    let (_domain, _mdd, _mxd, init, nsf) = setup(3);
    let reachable = reachable_states_dfs(&init, &nsf).unwrap();
    assert_eq!(reachable.cardinality(), 58400u32.into());
}

#[test_log::test]
fn kanban_bfs_and_dfs_agree() {
    let (_domain, _mdd, _mxd, init, nsf) = setup(2);
    let bfs = reachable_states_bfs(&init, &nsf).unwrap();
    let dfs = reachable_states_dfs(&init, &nsf).unwrap();
    assert_eq!(bfs, dfs);
    assert_eq!(bfs.cardinality(), 4600u32.into());
}

#[test_log::test]
fn kanban_saturation_is_idempotent() {
    let (_domain, _mdd, _mxd, init, nsf) = setup(2);
    let once = reachable_states_dfs(&init, &nsf).unwrap();
    let twice = reachable_states_dfs(&once, &nsf).unwrap();
    assert_eq!(once, twice);
}

#[test_log::test]
fn kanban_reorder_round_trip() {
    let (domain, mdd, mxd, init, nsf) = setup(2);
    let reachable = reachable_states_dfs(&init, &nsf).unwrap();
    let cardinality = reachable.cardinality();

    // The relation forest does not support reordering; retire it first.
    drop(nsf);
    drop(mxd);
    drop(init);

    // An interleaving-style permutation of the 16 variables.
    let target: Vec<u32> = (1..=16u32)
        .map(|v| if v % 2 == 1 { (v + 1) / 2 } else { 8 + v / 2 })
        .collect();
    domain
        .reorder(&target, ReorderStrategy::LowestInversion)
        .unwrap();
    assert_eq!(reachable.cardinality(), cardinality);

    let identity: Vec<u32> = (1..=16).collect();
    domain
        .reorder(&identity, ReorderStrategy::BubbleDown)
        .unwrap();
    assert_eq!(reachable.cardinality(), cardinality);

    // Same function, same order, hence the same canonical handle.
    let again = {
        let mut initial = vec![0i32; 16];
        initial[0] = 2;
        initial[4] = 2;
        initial[8] = 2;
        initial[12] = 2;
        let init = mdd.edge_from_minterms(&[initial], None).unwrap();
        let mxd = domain
            .new_forest(
                true,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(true),
            )
            .unwrap();
        let nsf = build_nsf(&mxd, 2);
        reachable_states_dfs(&init, &nsf).unwrap()
    };
    assert_eq!(again, reachable);
}
