//! Grid boards for the path solvers
//!
//! A [`Grid`] is an immutable rectangle of [`CellKind`]s. Start and end may be
//! marked in the grid itself or supplied by the caller at solve time.
//!
//! The board encoding fed to the model follows the training vocabulary:
//!
//! | token | meaning          |
//! |-------|------------------|
//! | 0     | empty            |
//! | 1     | wall             |
//! | 2     | start            |
//! | 3     | end              |
//! | 4     | current position |

use std::fmt;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExplorerError;
use crate::pathfind::{bfs_path, PathOutcome};

/// Token marking the solver's current position in an encoded board
pub const CURRENT_TOKEN: u32 = 4;

/// Content of one grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Empty,
    Wall,
    Start,
    End,
}

impl CellKind {
    pub fn code(self) -> u8 {
        match self {
            CellKind::Empty => 0,
            CellKind::Wall => 1,
            CellKind::Start => 2,
            CellKind::End => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CellKind::Empty),
            1 => Some(CellKind::Wall),
            2 => Some(CellKind::Start),
            3 => Some(CellKind::End),
            _ => None,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '.' | '0' => Some(CellKind::Empty),
            '#' | '1' => Some(CellKind::Wall),
            'S' | '2' => Some(CellKind::Start),
            'E' | '3' => Some(CellKind::End),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            CellKind::Empty => '.',
            CellKind::Wall => '#',
            CellKind::Start => 'S',
            CellKind::End => 'E',
        }
    }
}

/// A `(row, col)` position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub row: usize,
    pub col: usize,
}

impl Coord {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn manhattan(self, other: Coord) -> usize {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }

    /// True when `other` is one step up, down, left or right
    pub fn is_adjacent(self, other: Coord) -> bool {
        self.manhattan(other) == 1
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Immutable rectangular board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<CellKind>,
}

impl Grid {
    /// Build a grid from row-major cells
    ///
    /// Rejects empty dimensions, a cell count that does not match, and more
    /// than one start or end marker.
    pub fn new(rows: usize, cols: usize, cells: Vec<CellKind>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(ExplorerError::InvalidGrid(format!("empty grid ({rows} x {cols})")).into());
        }
        if cells.len() != rows * cols {
            return Err(ExplorerError::InvalidGrid(format!(
                "{} cells for a {rows} x {cols} grid",
                cells.len()
            ))
            .into());
        }
        for marker in [CellKind::Start, CellKind::End] {
            let count = cells.iter().filter(|&&c| c == marker).count();
            if count > 1 {
                return Err(ExplorerError::InvalidGrid(format!("{count} {marker:?} markers")).into());
            }
        }
        Ok(Self { rows, cols, cells })
    }

    /// An all-empty grid
    pub fn open(rows: usize, cols: usize) -> Result<Self> {
        Self::new(rows, cols, vec![CellKind::Empty; rows * cols])
    }

    /// Build from nested rows of cell codes (0 empty, 1 wall, 2 start, 3 end)
    pub fn from_codes(rows: &[Vec<u8>]) -> Result<Self> {
        let width = rows.first().map_or(0, Vec::len);
        let mut cells = Vec::with_capacity(rows.len() * width);
        for (r, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ExplorerError::InvalidGrid(format!(
                    "row {r} has {} cells, expected {width}",
                    row.len()
                ))
                .into());
            }
            for (c, &code) in row.iter().enumerate() {
                let cell = CellKind::from_code(code).ok_or_else(|| {
                    ExplorerError::InvalidGrid(format!("unknown cell code {code} at ({r}, {c})"))
                })?;
                cells.push(cell);
            }
        }
        Self::new(rows.len(), width, cells)
    }

    /// Parse a JSON array of rows of cell codes
    pub fn from_json(json: &str) -> Result<Self> {
        let rows: Vec<Vec<u8>> = serde_json::from_str(json)
            .map_err(|e| ExplorerError::InvalidGrid(format!("board is not a code matrix: {e}")))?;
        Self::from_codes(&rows)
    }

    /// Parse an ASCII board: `.` empty, `#` wall, `S` start, `E` end
    ///
    /// Blank lines and surrounding whitespace are ignored.
    pub fn parse_ascii(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let cols = lines.first().map_or(0, |l| l.chars().count());
        let mut cells = Vec::with_capacity(lines.len() * cols);
        for (r, line) in lines.iter().enumerate() {
            if line.chars().count() != cols {
                return Err(ExplorerError::InvalidGrid(format!("line {r} is not {cols} cells wide")).into());
            }
            for (c, ch) in line.chars().enumerate() {
                let cell = CellKind::from_char(ch).ok_or_else(|| {
                    ExplorerError::InvalidGrid(format!("unknown cell '{ch}' at ({r}, {c})"))
                })?;
                cells.push(cell);
            }
        }
        Self::new(lines.len(), cols, cells)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn area(&self) -> usize {
        self.rows * self.cols
    }

    /// Row-major index of a cell
    pub fn index(&self, c: Coord) -> usize {
        c.row * self.cols + c.col
    }

    pub fn contains(&self, c: Coord) -> bool {
        c.row < self.rows && c.col < self.cols
    }

    pub fn get(&self, c: Coord) -> Option<CellKind> {
        self.contains(c).then(|| self.cells[self.index(c)])
    }

    /// In bounds and not a wall
    pub fn is_open(&self, c: Coord) -> bool {
        matches!(self.get(c), Some(kind) if kind != CellKind::Wall)
    }

    pub fn start(&self) -> Option<Coord> {
        self.find(CellKind::Start)
    }

    pub fn end(&self) -> Option<Coord> {
        self.find(CellKind::End)
    }

    fn find(&self, kind: CellKind) -> Option<Coord> {
        self.cells
            .iter()
            .position(|&c| c == kind)
            .map(|i| Coord::new(i / self.cols, i % self.cols))
    }

    /// Open 4-neighbours in the fixed order up, down, left, right
    pub fn neighbours(&self, c: Coord) -> impl Iterator<Item = Coord> + '_ {
        let up = c.row.checked_sub(1).map(|r| Coord::new(r, c.col));
        let down = Some(Coord::new(c.row + 1, c.col));
        let left = c.col.checked_sub(1).map(|col| Coord::new(c.row, col));
        let right = Some(Coord::new(c.row, c.col + 1));
        [up, down, left, right]
            .into_iter()
            .flatten()
            .filter(move |&n| self.is_open(n))
    }

    /// Resolve solver endpoints, falling back to the grid's markers
    pub fn endpoints(&self, start: Option<Coord>, goal: Option<Coord>) -> Result<(Coord, Coord)> {
        let start = start
            .or_else(|| self.start())
            .ok_or_else(|| ExplorerError::InvalidGrid("no start given or marked".into()))?;
        let goal = goal
            .or_else(|| self.end())
            .ok_or_else(|| ExplorerError::InvalidGrid("no goal given or marked".into()))?;
        for (name, c) in [("start", start), ("goal", goal)] {
            if !self.contains(c) {
                return Err(ExplorerError::InvalidGrid(format!(
                    "{name} {c} is outside the {} x {} grid",
                    self.rows, self.cols
                ))
                .into());
            }
            if !self.is_open(c) {
                return Err(ExplorerError::InvalidGrid(format!("{name} {c} is a wall")).into());
            }
        }
        Ok((start, goal))
    }

    /// Flattened token sequence with start, end and current position marked
    ///
    /// Markers are written in that order, so `current` wins when it coincides
    /// with an endpoint.
    pub fn encode_board(&self, start: Coord, end: Coord, current: Coord) -> Result<Vec<u32>> {
        for (name, c) in [("start", start), ("end", end), ("current", current)] {
            if !self.contains(c) {
                return Err(ExplorerError::InvalidGrid(format!(
                    "{name} {c} is outside the {} x {} grid",
                    self.rows, self.cols
                ))
                .into());
            }
        }
        let mut tokens: Vec<u32> = self
            .cells
            .iter()
            .map(|&c| match c {
                CellKind::Wall => 1,
                _ => 0,
            })
            .collect();
        tokens[self.index(start)] = u32::from(CellKind::Start.code());
        tokens[self.index(end)] = u32::from(CellKind::End.code());
        tokens[self.index(current)] = CURRENT_TOKEN;
        Ok(tokens)
    }

    /// Nested rows of cell codes
    pub fn to_codes(&self) -> Vec<Vec<u8>> {
        self.cells
            .chunks_exact(self.cols)
            .map(|row| row.iter().map(|c| c.code()).collect())
            .collect()
    }

    /// ASCII picture with `path` cells drawn as `*`
    pub fn render(&self, path: &[Coord]) -> String {
        let mut chars: Vec<char> = self.cells.iter().map(|c| c.as_char()).collect();
        for &c in path {
            if self.contains(c) && self.cells[self.index(c)] == CellKind::Empty {
                chars[self.index(c)] = '*';
            }
        }
        chars
            .chunks_exact(self.cols)
            .map(|row| row.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Serialize for Grid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_codes().serialize(serializer)
    }
}

/// Parameters of random board generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    pub rows: usize,
    pub cols: usize,
    /// Probability that a cell is a wall
    pub wall_density: f64,
    /// Minimum BFS path length, in cells, including both endpoints
    pub min_path_length: usize,
    pub max_attempts: usize,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            rows: 10,
            cols: 10,
            wall_density: 0.25,
            min_path_length: 5,
            max_attempts: 1000,
        }
    }
}

/// A generated board and its shortest path
#[derive(Debug, Clone, Serialize)]
pub struct RandomBoard {
    pub grid: Grid,
    pub start: Coord,
    pub end: Coord,
    pub path: Vec<Coord>,
    pub attempts: usize,
}

/// Draw boards until one is solvable with a long enough shortest path
///
/// Start and end are written into the returned grid.
pub fn random_board<R: Rng>(spec: &BoardSpec, rng: &mut R) -> Result<RandomBoard> {
    if spec.rows == 0 || spec.cols == 0 || spec.rows * spec.cols < 2 {
        return Err(ExplorerError::invalid_argument("board", "needs at least two cells").into());
    }
    if !(0.0..1.0).contains(&spec.wall_density) {
        return Err(ExplorerError::invalid_argument(
            "wall_density",
            format!("must lie in [0, 1), got {}", spec.wall_density),
        )
        .into());
    }

    for attempt in 1..=spec.max_attempts {
        let mut cells: Vec<CellKind> = (0..spec.rows * spec.cols)
            .map(|_| {
                if rng.gen_bool(spec.wall_density) {
                    CellKind::Wall
                } else {
                    CellKind::Empty
                }
            })
            .collect();
        let start = Coord::new(rng.gen_range(0..spec.rows), rng.gen_range(0..spec.cols));
        let end = Coord::new(rng.gen_range(0..spec.rows), rng.gen_range(0..spec.cols));
        let (si, ei) = (start.row * spec.cols + start.col, end.row * spec.cols + end.col);
        if si == ei || cells[si] == CellKind::Wall || cells[ei] == CellKind::Wall {
            continue;
        }
        cells[si] = CellKind::Start;
        cells[ei] = CellKind::End;

        let grid = Grid::new(spec.rows, spec.cols, cells)?;
        if let PathOutcome::Found { path, .. } = bfs_path(&grid, start, end)? {
            if path.len() >= spec.min_path_length {
                debug!("Random board after {attempt} attempts, path of {} cells", path.len());
                return Ok(RandomBoard {
                    grid,
                    start,
                    end,
                    path,
                    attempts: attempt,
                });
            }
        }
    }

    Err(ExplorerError::invalid_argument(
        "board",
        format!(
            "no solvable {}x{} board with path >= {} in {} attempts",
            spec.rows, spec.cols, spec.min_path_length, spec.max_attempts
        ),
    )
    .into())
}
