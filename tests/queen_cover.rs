//! Queen cover: place queens so every square of an N x N board is
//! attacked or occupied. Encoded with per-queen coordinates, symmetry
//! broken by lexicographic ordering, and the minimal number of distinct
//! queens recovered by a min-range sweep.

use mdd_rs::{Domain, Edge, EdgeLabeling, Forest, Policies, RangeType, Terminal};

const N: i32 = 5;
const QUEENS: u32 = 5;

struct Board {
    forest: Forest,
    rows: Vec<Edge>,
    cols: Vec<Edge>,
}

impl Board {
    fn new() -> Board {
        // Variables bottom-up: row_1, col_1, row_2, col_2, ...
        let domain = Domain::bottom_up(&vec![N as u32; 2 * QUEENS as usize]).unwrap();
        let forest = domain
            .new_forest(
                false,
                RangeType::Integer,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let rows = (0..QUEENS)
            .map(|q| forest.edge_for_variable(2 * q + 1, false, None).unwrap())
            .collect();
        let cols = (0..QUEENS)
            .map(|q| forest.edge_for_variable(2 * q + 2, false, None).unwrap())
            .collect();
        Board { forest, rows, cols }
    }

    fn constant(&self, v: i32) -> Edge {
        self.forest.constant(Terminal::Int(v)).unwrap()
    }

    fn or(&self, a: &Edge, b: &Edge) -> Edge {
        a.max_with(b).unwrap()
    }

    fn and(&self, a: &Edge, b: &Edge) -> Edge {
        a.times(b).unwrap()
    }

    /// Queen `q` attacks or occupies square (r, c).
    fn covers(&self, q: usize, r: i32, c: i32) -> Edge {
        let row = &self.rows[q];
        let col = &self.cols[q];
        let same_row = row.equal(&self.constant(r)).unwrap();
        let same_col = col.equal(&self.constant(c)).unwrap();
        let diag_sum = row
            .plus(col)
            .unwrap()
            .equal(&self.constant(r + c))
            .unwrap();
        let diag_diff = row
            .minus(col)
            .unwrap()
            .equal(&self.constant(r - c))
            .unwrap();
        let attack = self.or(&same_row, &same_col);
        let attack = self.or(&attack, &diag_sum);
        self.or(&attack, &diag_diff)
    }

    /// Every square is covered by some queen.
    fn covered(&self) -> Edge {
        let mut all = self.constant(1);
        for r in 0..N {
            for c in 0..N {
                let mut any = self.constant(0);
                for q in 0..QUEENS as usize {
                    let cov = self.covers(q, r, c);
                    any = self.or(&any, &cov);
                }
                all = self.and(&all, &any);
            }
        }
        all
    }

    /// Queens listed in non-decreasing (row, col) order; duplicates
    /// allowed, which is what lets fewer than `QUEENS` distinct
    /// positions appear.
    fn ordered(&self) -> Edge {
        let mut ord = self.constant(1);
        for q in 1..QUEENS as usize {
            let row_lt = self.rows[q - 1].less_than(&self.rows[q]).unwrap();
            let row_eq = self.rows[q - 1].equal(&self.rows[q]).unwrap();
            let col_le = self.cols[q - 1].less_or_equal(&self.cols[q]).unwrap();
            let tie = self.and(&row_eq, &col_le);
            let step = self.or(&row_lt, &tie);
            ord = self.and(&ord, &step);
        }
        ord
    }

    /// Number of distinct queen positions (well-defined under the
    /// ordering constraint, where duplicates are adjacent).
    fn distinct_count(&self) -> Edge {
        let mut count = self.constant(1);
        for q in 1..QUEENS as usize {
            let row_ne = self.rows[q - 1].not_equal(&self.rows[q]).unwrap();
            let col_ne = self.cols[q - 1].not_equal(&self.cols[q]).unwrap();
            let moved = self.or(&row_ne, &col_ne);
            count = count.plus(&moved).unwrap();
        }
        count
    }
}

#[test_log::test]
fn five_queens_cover_the_board() {
    let board = Board::new();
    let solutions = board.and(&board.covered(), &board.ordered());
    assert!(solutions.cardinality() > 0u32.into());
    assert_eq!(solutions.max_range().unwrap(), Terminal::Int(1));
}

#[test_log::test]
fn minimal_cover_needs_three_queens() {
    let board = Board::new();
    let solutions = board.and(&board.covered(), &board.ordered());

    // Outside the solution set, force a sentinel above any real count.
    let distinct = board.distinct_count();
    let in_solutions = board.and(&distinct, &solutions);
    let sentinel = board
        .constant(QUEENS as i32 + 1)
        .times(&solutions.equal(&board.constant(0)).unwrap())
        .unwrap();
    let objective = in_solutions.plus(&sentinel).unwrap();

    assert_eq!(objective.min_range().unwrap(), Terminal::Int(3));
}
