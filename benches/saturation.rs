use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use mdd_rs::{
    reachable_states_bfs, reachable_states_dfs, Domain, Edge, EdgeLabeling, Forest, Policies,
    RangeType, DONT_CARE, DONT_CHANGE,
};

const KANBAN: [&str; 16] = [
    "X-+..............",
    "X.-+.............",
    "X.+-.............",
    "X.-.+............",
    "X.....-+.........",
    "X.....+-.........",
    "X.....-.+........",
    "X+..--+..-+......",
    "X.........-+.....",
    "X.........+-.....",
    "X.........-.+....",
    "X....+..-+..--+..",
    "X.............-+.",
    "X.............+-.",
    "X............+..-",
    "X.............-.+",
];

fn build_model(tokens: i32) -> (Forest, Edge, Edge) {
    let bound = tokens + 1;
    let domain = Domain::bottom_up(&[bound as u32; 16]).unwrap();
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

    let mut initial = vec![0i32; 16];
    for p in [0, 4, 8, 12] {
        initial[p] = tokens;
    }
    let init = mdd.edge_from_minterms(&[initial], None).unwrap();
    (mdd, init, nsf)
}

fn bench_reachability(c: &mut Criterion) {
    let mut group = c.benchmark_group("kanban-reachability");
    for tokens in [1i32, 2] {
        let (_mdd, init, nsf) = build_model(tokens);
        group.bench_with_input(BenchmarkId::new("saturation", tokens), &tokens, |b, _| {
            b.iter(|| reachable_states_dfs(&init, &nsf).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("bfs", tokens), &tokens, |b, _| {
            b.iter(|| reachable_states_bfs(&init, &nsf).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reachability);
criterion_main!(benches);
