//! Integration tests for bdh-explorer
//!
//! Model-backed tests use small random models on the CPU. Tests marked with
//! #[ignore] download a checkpoint from the hub.
//! Run them explicitly with: BDH_HUB_REPO=<owner/repo> cargo test --ignored

use std::sync::{Arc, OnceLock};
use std::thread;

use bdh_explorer::{
    analyze_sparsity, bfs_path, greedy_path, load_checkpoint, random_board, save_checkpoint,
    ActivationSnapshot, ActivationTracker, BdhConfig, BdhModel, BoardSpec, Coord, Explorer,
    ExplorerConfig, ExplorerError, Grid, GreedyParams, LayerActivations, ModelCache, ModelScorer,
    ModelSource, PathOutcome, ProjectionSet, Strategy, TopologyRequest, ZeroScorer,
};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serial_test::serial;
use tempfile::TempDir;

fn small_config() -> BdhConfig {
    BdhConfig {
        vocab_size: 5,
        max_seq_len: 100,
        n_heads: 2,
        n_neurons: 64,
        d_model: 16,
        n_layers: 4,
        dropout: 0.0,
        use_rope: true,
        use_abs_pos: false,
    }
}

/// One model shared by every test that goes through the cache
fn shared_cache() -> &'static ModelCache {
    static CACHE: OnceLock<ModelCache> = OnceLock::new();
    CACHE.get_or_init(|| {
        ModelCache::new(
            ModelSource::Random {
                config: small_config(),
                seed: 1234,
            },
            Device::Cpu,
        )
    })
}

fn explorer() -> Explorer {
    Explorer::new(shared_cache().get().unwrap(), ExplorerConfig::default()).unwrap()
}

/// Scenario A: BFS on an open 10x10 board
#[test]
fn test_open_grid_shortest_path() {
    let grid = Grid::open(10, 10).unwrap();
    let outcome = bfs_path(&grid, Coord::new(0, 0), Coord::new(9, 9)).unwrap();
    assert_eq!(outcome.length(), Some(18));
}

/// Scenario B: an enclosed goal is an explicit negative result for every solver
#[test]
#[serial]
fn test_enclosed_goal() {
    let grid = Grid::parse_ascii(
        "
        S.........
        ..........
        ..........
        ......###.
        ......#E#.
        ......###.
        ..........
        ..........
        ..........
        ..........
        ",
    )
    .unwrap();
    for strategy in [Strategy::Bfs, Strategy::Greedy, Strategy::ModelBfs] {
        let report = explorer().pathfind(&grid, None, None, strategy).unwrap();
        assert!(matches!(
            report.comparison.reference,
            PathOutcome::Unreachable { .. }
        ));
        assert!(!report.comparison.candidate.is_found());
        assert!(!report.comparison.paths_match);
    }
}

/// Scenario C: a threshold above every entry gives an empty graph, not an error
#[test]
#[serial]
fn test_topology_threshold_above_max() {
    let explorer = explorer();
    for set in [ProjectionSet::Context, ProjectionSet::Output] {
        let graph = explorer
            .topology(
                set,
                &TopologyRequest {
                    threshold: Some(1e9),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(graph.metrics.edge_count, 0);
        assert_eq!(graph.metrics.hub_count, 0);
        assert_eq!(graph.metrics.node_count, 64);
        assert_eq!(graph.metrics.avg_degree, 0.0);
    }
}

/// Scenario D: an all-zero snapshot gives all-zero sparsity
#[test]
fn test_all_zero_snapshot() {
    let device = Device::Cpu;
    let zeros = |r: usize, c: usize| Tensor::zeros((r, c), DType::F32, &device).unwrap();
    let layers = (0..3)
        .map(|_| LayerActivations {
            context_vector: zeros(6, 32),
            neuron_activations: zeros(6, 32),
            output_activations: zeros(6, 8),
            attention_scores: zeros(6, 6),
        })
        .collect();
    let record = analyze_sparsity(&ActivationSnapshot::new(layers), 128).unwrap();
    for family in [&record.context, &record.output] {
        assert!(family.per_layer.iter().all(|&s| s == 0.0));
        assert_eq!((family.mean, family.std, family.min, family.max), (0.0, 0.0, 0.0, 0.0));
    }
}

#[test]
#[serial]
fn test_edge_count_monotone_in_threshold() {
    let explorer = explorer();
    let mut previous = usize::MAX;
    for threshold in [0.0, 0.001, 0.005, 0.01, 0.02, 0.05, 0.1] {
        let graph = explorer
            .topology(
                ProjectionSet::Context,
                &TopologyRequest {
                    threshold: Some(threshold),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(graph.metrics.edge_count <= previous);
        for node in &graph.nodes.items {
            assert_eq!(node.degree, node.in_degree + node.out_degree);
        }
        previous = graph.metrics.edge_count;
    }
}

#[test]
#[serial]
fn test_tracked_inference_matches_untracked() {
    let model = shared_cache().get().unwrap();
    let input = model.input_tensor(&[2, 0, 0, 1, 3, 4]).unwrap();
    let plain: Vec<f32> = model.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();

    let mut tracker = ActivationTracker::enabled(model.n_layers());
    let tracked: Vec<f32> = model
        .forward_tracked(&input, &mut tracker)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(plain, tracked);
    assert_eq!(tracker.n_layers(), 4);

    // Re-enabling resets, so a second call does not inherit the first
    tracker.enable();
    model.forward_tracked(&input, &mut tracker).unwrap();
    assert_eq!(tracker.n_layers(), 4);

    // Disabled: nothing more is recorded and the logits are unchanged
    tracker.disable();
    let untracked: Vec<f32> = model
        .forward_tracked(&input, &mut tracker)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(plain, untracked);
    assert_eq!(tracker.n_layers(), 4);
}

#[test]
#[serial]
fn test_concurrent_calls_keep_snapshots_separate() {
    let explorer = Arc::new(explorer());
    let handles: Vec<_> = [vec![0u32, 1, 2], vec![4u32, 3, 2, 1, 0, 1, 2]]
        .into_iter()
        .map(|tokens| {
            let explorer = Arc::clone(&explorer);
            thread::spawn(move || {
                let report = explorer.infer(&tokens).unwrap();
                (tokens.len(), report)
            })
        })
        .collect();
    for handle in handles {
        let (len, report) = handle.join().unwrap();
        assert_eq!(report.sparsity.seq_len, len);
        assert_eq!(report.snapshot.n_layers, 4);
        assert_eq!(report.attention.seq_len, len);
    }
}

#[test]
#[serial]
fn test_bounded_snapshot_is_deterministic() {
    let explorer = explorer();
    let tokens: Vec<u32> = (0..40).map(|i| i % 5).collect();
    let (_, snapshot) = explorer.trace(&tokens).unwrap();
    let bounds = bdh_explorer::BoundsConfig {
        max_tokens: 7,
        max_neurons: 10,
        ..Default::default()
    };
    let a = snapshot.bound(&bounds).unwrap();
    let b = snapshot.bound(&bounds).unwrap();
    assert_eq!(a, b);
    let layer = &a.layers[0];
    assert_eq!(layer.neuron_activations.shape, vec![40, 64]);
    assert_eq!(layer.neuron_activations.strides, vec![6, 7]);
    assert_eq!(layer.neuron_activations.sampled_shape(), vec![7, 10]);
}

#[test]
fn test_bfs_never_longer_than_greedy_with_model() {
    let model = BdhModel::random(small_config(), 77, &Device::Cpu).unwrap();
    let mut rng = StdRng::seed_from_u64(2024);
    let spec = BoardSpec::default();
    for _ in 0..5 {
        let board = random_board(&spec, &mut rng).unwrap();
        let scorer = ModelScorer::for_grid(&model, &board.grid).unwrap();
        let params = GreedyParams::default();
        let bfs = bfs_path(&board.grid, board.start, board.end).unwrap();
        let greedy = greedy_path(&board.grid, board.start, board.end, &scorer, &params).unwrap();
        assert!(greedy.steps() <= params.step_bound(&board.grid));
        assert!(bfs.length().unwrap() <= greedy.length().unwrap());
    }
}

#[test]
fn test_greedy_terminates_on_adversarial_boards() {
    // Comb of dead ends: equal Manhattan pulls into every tooth
    let grid = Grid::parse_ascii(
        "
        S.........
        .#.#.#.#.#
        .#.#.#.#.#
        .#.#.#.#.#
        ##########
        E.........
        ",
    )
    .unwrap();
    let (start, goal) = grid.endpoints(None, None).unwrap();
    let params = GreedyParams::default();
    let outcome = greedy_path(&grid, start, goal, &ZeroScorer, &params).unwrap();
    assert!(matches!(outcome, PathOutcome::Unreachable { .. }));
    assert!(outcome.steps() <= params.step_bound(&grid));
}

#[test]
fn test_checkpoint_round_trip_through_cache() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("bdh.safetensors");
    let model = BdhModel::random(small_config(), 5, &Device::Cpu).unwrap();
    save_checkpoint(&model, &path).unwrap();

    let cache = ModelCache::new(ModelSource::Checkpoint(path.clone()), Device::Cpu);
    let loaded = cache.get().unwrap();
    assert_eq!(loaded.config(), &small_config());

    let input = model.input_tensor(&[0, 1, 2, 3]).unwrap();
    let a: Vec<f32> = model.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = loaded.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);

    assert!(load_checkpoint(&dir.path().join("missing.safetensors"), &Device::Cpu).is_err());
}

#[test]
#[serial]
fn test_invalid_inputs_are_rejected() {
    let explorer = explorer();

    let err = explorer.infer(&[0, 9]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExplorerError>(),
        Some(ExplorerError::InvalidArgument { .. })
    ));

    let err = explorer
        .topology(
            ProjectionSet::Context,
            &TopologyRequest {
                threshold: Some(-1.0),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExplorerError>(),
        Some(ExplorerError::InvalidArgument { .. })
    ));

    let grid = Grid::parse_ascii("S#\n#E").unwrap();
    let err = explorer
        .pathfind(&grid, None, Some(Coord::new(0, 1)), Strategy::Bfs)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExplorerError>(),
        Some(ExplorerError::InvalidGrid(_))
    ));
}

/// Hub-dependent test: downloads the checkpoint named by BDH_HUB_REPO
#[test]
#[ignore = "requires network access and BDH_HUB_REPO"]
fn test_hub_loading() {
    let Ok(repo) = std::env::var("BDH_HUB_REPO") else {
        eprintln!("BDH_HUB_REPO is not set, skipping");
        return;
    };
    let cache = ModelCache::new(
        ModelSource::Hub {
            repo,
            revision: std::env::var("BDH_HUB_REVISION").ok(),
        },
        Device::Cpu,
    );
    let model = cache.get().unwrap();
    assert!(model.n_layers() > 0);
}
