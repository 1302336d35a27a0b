//! Hybrid path solving over [`Grid`]s
//!
//! Three strategies share one input (grid plus endpoints) and one output
//! ([`PathOutcome`]):
//!
//! - [`bfs_path`]: exhaustive breadth-first reference solver, shortest path or
//!   an explicit `Unreachable`.
//! - [`greedy_path`]: steps to the open unvisited neighbour maximising
//!   `-manhattan(candidate, goal) + w * model_score(candidate)`, backtracking on
//!   dead ends. Bounded by `step_bound_factor * rows * cols` steps.
//! - [`model_ordered_bfs`]: breadth-first search whose neighbour expansion order
//!   follows the model score. Still shortest; only tie paths differ.
//!
//! Model scores come from a [`CellScorer`]; [`ModelScorer`] runs one BDH forward
//! pass per step on the encoded board with the current position marked.

use std::collections::VecDeque;

use anyhow::Result;
use candle_core::{DType, IndexOp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExplorerError;
use crate::forward_bdh::BdhModel;
use crate::grid::{Coord, Grid, CURRENT_TOKEN};

/// Result of one solver run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PathOutcome {
    /// `path` runs from start to goal inclusive
    Found { path: Vec<Coord>, steps: usize },
    /// The search space was exhausted without reaching the goal
    Unreachable { steps: usize },
    /// The greedy step bound ran out first; `partial` is the path at that point
    StepBoundExceeded {
        steps: usize,
        bound: usize,
        partial: Vec<Coord>,
    },
}

impl PathOutcome {
    pub fn path(&self) -> Option<&[Coord]> {
        match self {
            PathOutcome::Found { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, PathOutcome::Found { .. })
    }

    /// Path length in moves (edges)
    pub fn length(&self) -> Option<usize> {
        self.path().map(|p| p.len().saturating_sub(1))
    }

    pub fn steps(&self) -> usize {
        match self {
            PathOutcome::Found { steps, .. }
            | PathOutcome::Unreachable { steps }
            | PathOutcome::StepBoundExceeded { steps, .. } => *steps,
        }
    }
}

/// Solver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Bfs,
    Greedy,
    ModelBfs,
}

/// Fixed-size visited set indexed by row and column
#[derive(Debug, Clone)]
pub struct VisitedMap {
    cols: usize,
    bits: Vec<u64>,
}

impl VisitedMap {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cols,
            bits: vec![0; (rows * cols).div_ceil(64)],
        }
    }

    pub fn for_grid(grid: &Grid) -> Self {
        Self::new(grid.rows(), grid.cols())
    }

    /// Mark `c`; returns false if it was already marked
    pub fn insert(&mut self, c: Coord) -> bool {
        let i = c.row * self.cols + c.col;
        let (word, bit) = (i / 64, 1u64 << (i % 64));
        let fresh = self.bits[word] & bit == 0;
        self.bits[word] |= bit;
        fresh
    }

    pub fn contains(&self, c: Coord) -> bool {
        let i = c.row * self.cols + c.col;
        self.bits[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Scores every cell of a board for a given current position
pub trait CellScorer {
    /// Row-major scores, one per cell; higher is better
    fn score_cells(&self, grid: &Grid, start: Coord, goal: Coord, current: Coord) -> Result<Vec<f32>>;
}

/// Scores every cell 0; greedy then follows Manhattan distance alone
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroScorer;

impl CellScorer for ZeroScorer {
    fn score_cells(&self, grid: &Grid, _: Coord, _: Coord, _: Coord) -> Result<Vec<f32>> {
        Ok(vec![0.0; grid.area()])
    }
}

/// Which logits are read as cell scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellReadout {
    /// `logits[T-1, cell]`: the vocabulary enumerates cells (V == rows*cols)
    LastToken,
    /// `logits[cell, token]`: per-position logit of one board token
    PerPosition { token: u32 },
}

impl CellReadout {
    /// Cell-indexed vocabularies read the last position, board vocabularies
    /// read the current-position token at every cell
    pub fn for_model(model: &BdhModel, grid: &Grid) -> Self {
        if model.vocab_size() == grid.area() {
            CellReadout::LastToken
        } else {
            CellReadout::PerPosition {
                token: CURRENT_TOKEN,
            }
        }
    }
}

/// Cell scores from BDH logits
#[derive(Debug, Clone, Copy)]
pub struct ModelScorer<'a> {
    model: &'a BdhModel,
    readout: CellReadout,
}

impl<'a> ModelScorer<'a> {
    pub fn new(model: &'a BdhModel, readout: CellReadout) -> Result<Self> {
        if let CellReadout::PerPosition { token } = readout {
            if token as usize >= model.vocab_size() {
                return Err(ExplorerError::invalid_argument(
                    "readout",
                    format!("token {token} is outside the vocabulary (V={})", model.vocab_size()),
                )
                .into());
            }
        }
        Ok(Self { model, readout })
    }

    pub fn for_grid(model: &'a BdhModel, grid: &Grid) -> Result<Self> {
        Self::new(model, CellReadout::for_model(model, grid))
    }

    pub fn readout(&self) -> CellReadout {
        self.readout
    }
}

impl CellScorer for ModelScorer<'_> {
    fn score_cells(&self, grid: &Grid, start: Coord, goal: Coord, current: Coord) -> Result<Vec<f32>> {
        let tokens = grid.encode_board(start, goal, current)?;
        let input = self.model.input_tensor(&tokens)?;
        // [T, V]
        let logits = self.model.forward(&input)?.i(0)?.to_dtype(DType::F32)?;
        let area = grid.area();
        match self.readout {
            CellReadout::LastToken => {
                let last: Vec<f32> = logits.i(area - 1)?.to_vec1()?;
                if last.len() < area {
                    return Err(ExplorerError::shape_mismatch(
                        "cell readout",
                        format!("vocabulary >= {area}"),
                        last.len(),
                    )
                    .into());
                }
                Ok(last[..area].to_vec())
            }
            CellReadout::PerPosition { token } => Ok(logits.i((.., token as usize))?.to_vec1()?),
        }
    }
}

/// Knobs of the greedy solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreedyParams {
    /// Weight `w` of the model score
    pub heuristic_weight: f32,
    /// Step bound is this factor times the grid area
    pub step_bound_factor: usize,
    /// Explicit step bound, overriding the factor
    #[serde(default)]
    pub max_steps: Option<usize>,
}

impl Default for GreedyParams {
    fn default() -> Self {
        Self {
            heuristic_weight: 0.1,
            step_bound_factor: 4,
            max_steps: None,
        }
    }
}

impl GreedyParams {
    pub fn step_bound(&self, grid: &Grid) -> usize {
        self.max_steps
            .unwrap_or(self.step_bound_factor * grid.area())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.heuristic_weight.is_finite() {
            return Err(ExplorerError::invalid_argument("heuristic_weight", "must be finite").into());
        }
        if self.step_bound_factor == 0 {
            return Err(ExplorerError::invalid_argument("step_bound_factor", "must be at least 1").into());
        }
        Ok(())
    }
}

/// Shortest path by breadth-first search
pub fn bfs_path(grid: &Grid, start: Coord, goal: Coord) -> Result<PathOutcome> {
    ordered_bfs(grid, start, goal, |_, neighbours| Ok(neighbours))
}

/// Breadth-first search expanding neighbours in descending model-score order
///
/// Equal scores keep the up, down, left, right order.
pub fn model_ordered_bfs(
    grid: &Grid,
    start: Coord,
    goal: Coord,
    scorer: &dyn CellScorer,
) -> Result<PathOutcome> {
    ordered_bfs(grid, start, goal, |current, mut neighbours| {
        if neighbours.len() > 1 {
            let scores = cell_scores(scorer, grid, start, goal, current)?;
            let key = |c: &Coord| sanitize(scores[grid.index(*c)]);
            neighbours.sort_by(|a, b| key(b).total_cmp(&key(a)));
        }
        Ok(neighbours)
    })
}

fn ordered_bfs<F>(grid: &Grid, start: Coord, goal: Coord, mut order: F) -> Result<PathOutcome>
where
    F: FnMut(Coord, Vec<Coord>) -> Result<Vec<Coord>>,
{
    grid.endpoints(Some(start), Some(goal))?;

    let mut visited = VisitedMap::for_grid(grid);
    let mut parent: Vec<Option<Coord>> = vec![None; grid.area()];
    let mut queue = VecDeque::from([start]);
    visited.insert(start);
    let mut steps = 0;

    while let Some(current) = queue.pop_front() {
        if current == goal {
            let mut path = vec![current];
            let mut cursor = current;
            while let Some(prev) = parent[grid.index(cursor)] {
                path.push(prev);
                cursor = prev;
            }
            path.reverse();
            return Ok(PathOutcome::Found { path, steps });
        }
        steps += 1;

        let fresh: Vec<Coord> = grid
            .neighbours(current)
            .filter(|n| !visited.contains(*n))
            .collect();
        for next in order(current, fresh)? {
            visited.insert(next);
            parent[grid.index(next)] = Some(current);
            queue.push_back(next);
        }
    }

    Ok(PathOutcome::Unreachable { steps })
}

/// Heuristic-guided greedy walk with backtracking
///
/// A step is either a move onto a fresh cell or a retreat from a dead end. Each
/// cell is entered at most once and left at most once, so the walk finishes
/// within `2 * area` steps; the configured bound still applies on its own.
pub fn greedy_path(
    grid: &Grid,
    start: Coord,
    goal: Coord,
    scorer: &dyn CellScorer,
    params: &GreedyParams,
) -> Result<PathOutcome> {
    params.validate()?;
    grid.endpoints(Some(start), Some(goal))?;

    let bound = params.step_bound(grid);
    let w = f64::from(params.heuristic_weight);
    let mut visited = VisitedMap::for_grid(grid);
    visited.insert(start);
    let mut path = vec![start];
    let mut steps = 0;

    while let Some(&current) = path.last() {
        if current == goal {
            return Ok(PathOutcome::Found { path, steps });
        }
        if steps >= bound {
            return Ok(PathOutcome::StepBoundExceeded {
                steps,
                bound,
                partial: path,
            });
        }
        steps += 1;

        let candidates: Vec<Coord> = grid
            .neighbours(current)
            .filter(|n| !visited.contains(*n))
            .collect();
        if candidates.is_empty() {
            path.pop();
            continue;
        }

        let scores = if w == 0.0 {
            None
        } else {
            Some(cell_scores(scorer, grid, start, goal, current)?)
        };
        let score = |c: Coord| {
            let model = scores.as_ref().map_or(0.0, |s| sanitize(s[grid.index(c)]));
            -(c.manhattan(goal) as f64) + w * model
        };

        let mut best = candidates[0];
        let mut best_score = score(best);
        for &c in &candidates[1..] {
            let s = score(c);
            if s > best_score || (s == best_score && c < best) {
                best = c;
                best_score = s;
            }
        }
        visited.insert(best);
        path.push(best);
    }

    Ok(PathOutcome::Unreachable { steps })
}

fn cell_scores(
    scorer: &dyn CellScorer,
    grid: &Grid,
    start: Coord,
    goal: Coord,
    current: Coord,
) -> Result<Vec<f32>> {
    let scores = scorer.score_cells(grid, start, goal, current)?;
    if scores.len() != grid.area() {
        return Err(ExplorerError::shape_mismatch("cell scores", grid.area(), scores.len()).into());
    }
    Ok(scores)
}

/// NaN never wins a comparison
fn sanitize(score: f32) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        f64::from(score)
    }
}

/// Run one strategy
pub fn solve(
    grid: &Grid,
    start: Coord,
    goal: Coord,
    strategy: Strategy,
    scorer: &dyn CellScorer,
    params: &GreedyParams,
) -> Result<PathOutcome> {
    let outcome = match strategy {
        Strategy::Bfs => bfs_path(grid, start, goal)?,
        Strategy::Greedy => greedy_path(grid, start, goal, scorer, params)?,
        Strategy::ModelBfs => model_ordered_bfs(grid, start, goal, scorer)?,
    };
    debug!(
        "{:?} {} -> {}: found={} steps={}",
        strategy,
        start,
        goal,
        outcome.is_found(),
        outcome.steps()
    );
    Ok(outcome)
}

/// Reference BFS result next to a candidate strategy's result
#[derive(Debug, Clone, Serialize)]
pub struct PathComparison {
    pub strategy: Strategy,
    pub reference: PathOutcome,
    pub candidate: PathOutcome,
    /// Both found the same coordinate sequence
    pub paths_match: bool,
    /// Both found a path of the same length
    pub lengths_match: bool,
    /// Candidate length minus reference length, when both found one
    pub length_delta: Option<i64>,
}

impl PathComparison {
    pub fn new(strategy: Strategy, reference: PathOutcome, candidate: PathOutcome) -> Self {
        let (paths_match, lengths_match, length_delta) = match (reference.path(), candidate.path()) {
            (Some(r), Some(c)) => (r == c, r.len() == c.len(), Some(c.len() as i64 - r.len() as i64)),
            _ => (false, false, None),
        };
        Self {
            strategy,
            reference,
            candidate,
            paths_match,
            lengths_match,
            length_delta,
        }
    }
}

/// Solve with BFS and with `strategy`, and report whether they agree
pub fn compare(
    grid: &Grid,
    start: Coord,
    goal: Coord,
    strategy: Strategy,
    scorer: &dyn CellScorer,
    params: &GreedyParams,
) -> Result<PathComparison> {
    let reference = bfs_path(grid, start, goal)?;
    let candidate = solve(grid, start, goal, strategy, scorer, params)?;
    let comparison = PathComparison::new(strategy, reference, candidate);
    info!(
        "Path {} -> {}: bfs={:?} {:?}={:?} match={}",
        start,
        goal,
        comparison.reference.length(),
        strategy,
        comparison.candidate.length(),
        comparison.paths_match
    );
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExplorerError;
    use crate::forward_bdh::tests::tiny_model;
    use crate::grid::{random_board, BoardSpec};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Scores cells from a fixed table, ignoring the current position
    struct TableScorer(Vec<f32>);

    impl CellScorer for TableScorer {
        fn score_cells(&self, _: &Grid, _: Coord, _: Coord, _: Coord) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn assert_valid_path(grid: &Grid, path: &[Coord], start: Coord, goal: Coord) {
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&goal));
        assert!(path.windows(2).all(|w| w[0].is_adjacent(w[1])));
        assert!(path.iter().all(|&c| grid.is_open(c)));
    }

    #[test]
    fn test_bfs_open_grid_length() {
        let grid = Grid::open(10, 10).unwrap();
        let (start, goal) = (Coord::new(0, 0), Coord::new(9, 9));
        let outcome = bfs_path(&grid, start, goal).unwrap();
        assert_eq!(outcome.length(), Some(18));
        assert_valid_path(&grid, outcome.path().unwrap(), start, goal);
    }

    #[test]
    fn test_bfs_prefers_up_down_before_left_right() {
        let grid = Grid::open(2, 2).unwrap();
        let outcome = bfs_path(&grid, Coord::new(0, 0), Coord::new(1, 1)).unwrap();
        assert_eq!(
            outcome.path().unwrap(),
            &[Coord::new(0, 0), Coord::new(1, 0), Coord::new(1, 1)]
        );
    }

    #[test]
    fn test_start_equals_goal() {
        let grid = Grid::open(3, 3).unwrap();
        let c = Coord::new(1, 1);
        assert_eq!(bfs_path(&grid, c, c).unwrap().length(), Some(0));
        let greedy = greedy_path(&grid, c, c, &ZeroScorer, &GreedyParams::default()).unwrap();
        assert_eq!(greedy.path().unwrap(), &[c]);
    }

    #[test]
    fn test_enclosed_goal_unreachable() {
        let grid = Grid::parse_ascii(
            "
            S....
            ..###
            ..#E#
            ..###
            .....
            ",
        )
        .unwrap();
        let (start, goal) = grid.endpoints(None, None).unwrap();
        assert!(matches!(
            bfs_path(&grid, start, goal).unwrap(),
            PathOutcome::Unreachable { .. }
        ));
        let greedy = greedy_path(&grid, start, goal, &ZeroScorer, &GreedyParams::default()).unwrap();
        assert!(matches!(greedy, PathOutcome::Unreachable { .. }));
        let ordered = model_ordered_bfs(&grid, start, goal, &ZeroScorer).unwrap();
        assert!(matches!(ordered, PathOutcome::Unreachable { .. }));
    }

    #[test]
    fn test_rejects_wall_endpoints() {
        let grid = Grid::parse_ascii("S#\n..").unwrap();
        let err = bfs_path(&grid, Coord::new(0, 0), Coord::new(0, 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplorerError>(),
            Some(ExplorerError::InvalidGrid(_))
        ));
    }

    #[test]
    fn test_greedy_open_grid_is_shortest() {
        let grid = Grid::open(10, 10).unwrap();
        let (start, goal) = (Coord::new(0, 0), Coord::new(9, 9));
        let outcome = greedy_path(&grid, start, goal, &ZeroScorer, &GreedyParams::default()).unwrap();
        assert_eq!(outcome.length(), Some(18));
        assert_valid_path(&grid, outcome.path().unwrap(), start, goal);
    }

    #[test]
    fn test_greedy_ties_break_lexicographically() {
        // From (1,1) to (0,0): (0,1) and (1,0) are equally close; (0,1) wins
        let grid = Grid::open(2, 2).unwrap();
        let outcome = greedy_path(
            &grid,
            Coord::new(1, 1),
            Coord::new(0, 0),
            &ZeroScorer,
            &GreedyParams::default(),
        )
        .unwrap();
        assert_eq!(outcome.path().unwrap()[1], Coord::new(0, 1));
    }

    #[test]
    fn test_greedy_follows_model_scores() {
        let grid = Grid::open(2, 2).unwrap();
        // Distances tie, so the model score decides
        let mut table = vec![0.0; 4];
        table[grid.index(Coord::new(1, 0))] = 5.0;
        let outcome = greedy_path(
            &grid,
            Coord::new(1, 1),
            Coord::new(0, 0),
            &TableScorer(table),
            &GreedyParams::default(),
        )
        .unwrap();
        assert_eq!(outcome.path().unwrap()[1], Coord::new(1, 0));
    }

    #[test]
    fn test_greedy_backtracks_out_of_dead_end() {
        // Manhattan pulls right into the pocket first
        let grid = Grid::parse_ascii(
            "
            S..#
            .#.#
            .###
            ...E
            ",
        )
        .unwrap();
        let (start, goal) = grid.endpoints(None, None).unwrap();
        let outcome = greedy_path(&grid, start, goal, &ZeroScorer, &GreedyParams::default()).unwrap();
        let path = outcome.path().unwrap();
        assert_valid_path(&grid, path, start, goal);
        assert_eq!(outcome.length(), Some(6));
        assert!(outcome.steps() > 6);
    }

    #[test]
    fn test_step_bound_exceeded_is_distinct() {
        // A single corridor: reaching E takes exactly 13 moves
        let grid = Grid::parse_ascii(
            "
            S...
            ###.
            ....
            .###
            ...E
            ",
        )
        .unwrap();
        let (start, goal) = grid.endpoints(None, None).unwrap();
        let params = GreedyParams {
            heuristic_weight: 0.0,
            step_bound_factor: 1,
            max_steps: None,
        };
        let full = greedy_path(&grid, start, goal, &ZeroScorer, &params).unwrap();
        assert_eq!(full.length(), Some(13));
        assert_eq!(full.steps(), 13);

        let exact = GreedyParams {
            max_steps: Some(13),
            ..params.clone()
        };
        assert!(greedy_path(&grid, start, goal, &ZeroScorer, &exact).unwrap().is_found());

        let short = GreedyParams {
            max_steps: Some(12),
            ..params
        };
        match greedy_path(&grid, start, goal, &ZeroScorer, &short).unwrap() {
            PathOutcome::StepBoundExceeded {
                steps,
                bound,
                partial,
            } => {
                assert_eq!((steps, bound), (12, 12));
                assert_eq!(partial.len(), 13);
                assert_eq!(partial[0], start);
            }
            other => panic!("expected step bound, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_short_score_vectors() {
        let grid = Grid::open(3, 3).unwrap();
        let err = greedy_path(
            &grid,
            Coord::new(0, 0),
            Coord::new(2, 2),
            &TableScorer(vec![0.0; 4]),
            &GreedyParams::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplorerError>(),
            Some(ExplorerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_greedy_terminates_on_equal_scores() {
        let spec = BoardSpec {
            wall_density: 0.3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let flat = TableScorer(vec![1.0; 100]);
        for _ in 0..20 {
            let board = random_board(&spec, &mut rng).unwrap();
            let params = GreedyParams::default();
            let outcome = greedy_path(&board.grid, board.start, board.end, &flat, &params).unwrap();
            assert!(outcome.steps() <= params.step_bound(&board.grid));
            // Solvable boards are always found within 2 * area steps
            assert!(outcome.is_found());
        }
    }

    #[test]
    fn test_bfs_never_longer_than_other_strategies() {
        let spec = BoardSpec::default();
        let mut rng = StdRng::seed_from_u64(5);
        let mut table = vec![0.0f32; 100];
        for (i, s) in table.iter_mut().enumerate() {
            *s = ((i * 37) % 11) as f32;
        }
        let scorer = TableScorer(table);
        for _ in 0..20 {
            let board = random_board(&spec, &mut rng).unwrap();
            let bfs = bfs_path(&board.grid, board.start, board.end).unwrap();
            for strategy in [Strategy::Greedy, Strategy::ModelBfs] {
                let other = solve(
                    &board.grid,
                    board.start,
                    board.end,
                    strategy,
                    &scorer,
                    &GreedyParams::default(),
                )
                .unwrap();
                let path = other.path().unwrap();
                assert_valid_path(&board.grid, path, board.start, board.end);
                assert!(bfs.length().unwrap() <= other.length().unwrap());
            }
        }
    }

    #[test]
    fn test_model_ordered_bfs_is_shortest() {
        let grid = Grid::open(6, 6).unwrap();
        let mut table = vec![0.0f32; 36];
        table[grid.index(Coord::new(0, 1))] = 9.0;
        let outcome =
            model_ordered_bfs(&grid, Coord::new(0, 0), Coord::new(5, 5), &TableScorer(table)).unwrap();
        assert_eq!(outcome.length(), Some(10));
        // The high-scoring right neighbour is expanded first
        assert_eq!(outcome.path().unwrap()[1], Coord::new(0, 1));
    }

    #[test]
    fn test_comparison() {
        let grid = Grid::open(3, 3).unwrap();
        let cmp = compare(
            &grid,
            Coord::new(0, 0),
            Coord::new(2, 2),
            Strategy::Bfs,
            &ZeroScorer,
            &GreedyParams::default(),
        )
        .unwrap();
        assert!(cmp.paths_match);
        assert_eq!(cmp.length_delta, Some(0));

        let unreachable = PathComparison::new(
            Strategy::Greedy,
            PathOutcome::Unreachable { steps: 3 },
            PathOutcome::Unreachable { steps: 5 },
        );
        assert!(!unreachable.paths_match);
        assert_eq!(unreachable.length_delta, None);
    }

    #[test]
    fn test_visited_map() {
        let mut map = VisitedMap::new(9, 9);
        assert!(map.insert(Coord::new(8, 8)));
        assert!(!map.insert(Coord::new(8, 8)));
        assert!(map.contains(Coord::new(8, 8)));
        assert!(!map.contains(Coord::new(0, 0)));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn test_model_scorer_per_position() {
        let model = tiny_model();
        let grid = Grid::open(3, 3).unwrap();
        let scorer = ModelScorer::for_grid(&model, &grid).unwrap();
        assert_eq!(scorer.readout(), CellReadout::PerPosition { token: CURRENT_TOKEN });
        let scores = scorer
            .score_cells(&grid, Coord::new(0, 0), Coord::new(2, 2), Coord::new(1, 1))
            .unwrap();
        assert_eq!(scores.len(), 9);
        assert!(scores.iter().all(|s| s.is_finite()));

        let outcome = greedy_path(
            &grid,
            Coord::new(0, 0),
            Coord::new(2, 2),
            &scorer,
            &GreedyParams::default(),
        )
        .unwrap();
        assert!(outcome.is_found());
    }

    #[test]
    fn test_model_scorer_last_token() {
        let model = tiny_model();
        let grid = Grid::open(1, 4).unwrap();
        let scorer = ModelScorer::new(&model, CellReadout::LastToken).unwrap();
        let scores = scorer
            .score_cells(&grid, Coord::new(0, 0), Coord::new(0, 3), Coord::new(0, 0))
            .unwrap();
        assert_eq!(scores.len(), 4);

        assert!(ModelScorer::new(&model, CellReadout::PerPosition { token: 9 }).is_err());
    }

    #[test]
    fn test_board_vocabulary_never_reads_last_token() {
        // V=5 board vocabulary on a grid with fewer or as many cells
        let model = tiny_model();
        for (rows, cols) in [(2, 2), (1, 3)] {
            let grid = Grid::open(rows, cols).unwrap();
            assert_eq!(
                CellReadout::for_model(&model, &grid),
                CellReadout::PerPosition { token: CURRENT_TOKEN }
            );
        }
        let grid = Grid::open(1, 5).unwrap();
        assert_eq!(CellReadout::for_model(&model, &grid), CellReadout::LastToken);
    }

    #[test]
    fn test_model_scorer_rejects_outside_positions() {
        let model = tiny_model();
        let grid = Grid::open(2, 2).unwrap();
        let scorer = ModelScorer::for_grid(&model, &grid).unwrap();
        let err = scorer
            .score_cells(&grid, Coord::new(0, 0), Coord::new(1, 1), Coord::new(2, 0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExplorerError>(),
            Some(ExplorerError::InvalidGrid(_))
        ));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(PathOutcome::Unreachable { steps: 2 }).unwrap();
        assert_eq!(json["status"], "unreachable");
        assert_eq!(json["steps"], 2);
    }
}
