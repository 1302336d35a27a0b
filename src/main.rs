//! bdh-explorer CLI: BDH model introspection

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bdh_explorer::{
    random_board, save_checkpoint, select_device, BdhConfig, BoardSpec, Coord, Explorer,
    ExplorerConfig, Grid, ModelCache, ModelSource, ProjectionSet, Strategy, TopologyRequest,
};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "bdh-explorer")]
#[command(about = "Activation, topology and pathfinding introspection for BDH models")]
#[command(version)]
struct Cli {
    /// Local safetensors checkpoint
    #[arg(long, conflicts_with = "hub")]
    checkpoint: Option<PathBuf>,

    /// `HuggingFace` repository holding model.safetensors
    #[arg(long)]
    hub: Option<String>,

    /// Hub revision (branch, tag or commit)
    #[arg(long, requires = "hub")]
    revision: Option<String>,

    /// Seed for a random (untrained) model when no checkpoint is given
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Model dimensions JSON for the random model
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Analysis configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write JSON results here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the model summary and the analysis configuration
    Config,
    /// Tracked inference on a token sequence
    Infer {
        /// Comma-separated token ids
        #[arg(value_delimiter = ',', required = true)]
        tokens: Vec<u32>,
    },
    /// Activation sparsity of a token sequence
    Sparsity {
        #[arg(value_delimiter = ',', required = true)]
        tokens: Vec<u32>,
    },
    /// Neuron graph of a projection set
    Topology {
        #[arg(long, value_enum, default_value = "context")]
        projection: Projection,
        /// Edge magnitude cutoff (default from config)
        #[arg(long)]
        threshold: Option<f32>,
        /// Keep only the K highest-degree neurons
        #[arg(long)]
        top_k: Option<usize>,
        /// Hub percentile (default from config)
        #[arg(long)]
        hub_percentile: Option<f64>,
    },
    /// Solve a board with BFS and a second strategy
    Pathfind {
        /// Board file: JSON rows of cell codes, or ASCII (. # S E)
        #[arg(long, conflicts_with = "board_seed")]
        board: Option<PathBuf>,
        /// Generate a random board with this seed instead
        #[arg(long)]
        board_seed: Option<u64>,
        /// Start as `row,col` (default: the board's S marker)
        #[arg(long, value_parser = parse_coord)]
        start: Option<Coord>,
        /// Goal as `row,col` (default: the board's E marker)
        #[arg(long, value_parser = parse_coord)]
        goal: Option<Coord>,
        #[arg(long, value_enum, default_value = "greedy")]
        strategy: StrategyArg,
    },
    /// Generate a solvable random board
    RandomBoard {
        #[arg(long, default_value_t = 0)]
        board_seed: u64,
        #[arg(long, default_value_t = 10)]
        rows: usize,
        #[arg(long, default_value_t = 10)]
        cols: usize,
        #[arg(long, default_value_t = 0.25)]
        wall_density: f64,
        /// Minimum shortest-path length in cells
        #[arg(long, default_value_t = 5)]
        min_path: usize,
    },
    /// Initialise a random model and save it as a checkpoint
    SaveRandom {
        /// Destination safetensors file
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Projection {
    Context,
    Output,
}

impl From<Projection> for ProjectionSet {
    fn from(p: Projection) -> Self {
        match p {
            Projection::Context => ProjectionSet::Context,
            Projection::Output => ProjectionSet::Output,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Bfs,
    Greedy,
    ModelBfs,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Bfs => Strategy::Bfs,
            StrategyArg::Greedy => Strategy::Greedy,
            StrategyArg::ModelBfs => Strategy::ModelBfs,
        }
    }
}

fn parse_coord(s: &str) -> Result<Coord, String> {
    let (row, col) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `row,col`, got `{s}`"))?;
    let parse = |v: &str| v.trim().parse::<usize>().map_err(|e| format!("`{v}`: {e}"));
    Ok(Coord::new(parse(row)?, parse(col)?))
}

fn model_source(cli: &Cli) -> Result<ModelSource> {
    if let Some(path) = &cli.checkpoint {
        return Ok(ModelSource::Checkpoint(path.clone()));
    }
    if let Some(repo) = &cli.hub {
        return Ok(ModelSource::Hub {
            repo: repo.clone(),
            revision: cli.revision.clone(),
        });
    }
    let config = match &cli.model_config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            BdhConfig::from_json(&json)?
        }
        None => BdhConfig::default(),
    };
    Ok(ModelSource::Random {
        config,
        seed: cli.seed,
    })
}

fn load_board(path: &Path) -> Result<Grid> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read board {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        Grid::from_json(&text)
    } else {
        Grid::parse_ascii(&text)
    }
}

fn emit<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Results saved to: {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let output = cli.output.as_deref();

    // Board generation needs no model
    if let Command::RandomBoard {
        board_seed,
        rows,
        cols,
        wall_density,
        min_path,
    } = &cli.command
    {
        let spec = BoardSpec {
            rows: *rows,
            cols: *cols,
            wall_density: *wall_density,
            min_path_length: *min_path,
            ..Default::default()
        };
        let board = random_board(&spec, &mut StdRng::seed_from_u64(*board_seed))?;
        info!("Board:\n{}", board.grid.render(&board.path));
        return emit(&board, output);
    }

    let explorer_config = match &cli.config {
        Some(path) => ExplorerConfig::load(path)?,
        None => ExplorerConfig::default(),
    };
    let source = model_source(&cli)?;
    info!("Model source: {}", source);
    let cache = ModelCache::new(source, select_device(cli.cpu));
    let model = cache.get()?;

    if let Command::SaveRandom { path } = &cli.command {
        return save_checkpoint(&model, path);
    }

    let explorer = Explorer::new(Arc::clone(&model), explorer_config)?;
    match &cli.command {
        Command::Config => {
            #[derive(Serialize)]
            struct ConfigView<'a> {
                model: bdh_explorer::ModelSummary,
                explorer: &'a ExplorerConfig,
            }
            emit(
                &ConfigView {
                    model: explorer.summary(),
                    explorer: explorer.config(),
                },
                output,
            )
        }
        Command::Infer { tokens } => emit(&explorer.infer(tokens)?, output),
        Command::Sparsity { tokens } => emit(&explorer.sparsity(tokens)?, output),
        Command::Topology {
            projection,
            threshold,
            top_k,
            hub_percentile,
        } => {
            let request = TopologyRequest {
                threshold: *threshold,
                top_k: *top_k,
                hub_percentile: *hub_percentile,
            };
            emit(&explorer.topology((*projection).into(), &request)?, output)
        }
        Command::Pathfind {
            board,
            board_seed,
            start,
            goal,
            strategy,
        } => {
            let grid = match (board, board_seed) {
                (Some(path), _) => load_board(path)?,
                (None, seed) => {
                    let seed = seed.unwrap_or(cli.seed);
                    random_board(&BoardSpec::default(), &mut StdRng::seed_from_u64(seed))?.grid
                }
            };
            let report = explorer.pathfind(&grid, *start, *goal, (*strategy).into())?;
            if let Some(path) = report.comparison.candidate.path() {
                info!("Candidate path:\n{}", grid.render(path));
            }
            emit(&report, output)
        }
        Command::RandomBoard { .. } | Command::SaveRandom { .. } => Ok(()),
    }
}
