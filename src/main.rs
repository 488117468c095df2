// ========================================================================================
//
//                        THE ORCHESTRATOR: HAPLOCALL
//
// ========================================================================================
//
// The binary owns the application lifecycle: argument parsing, logger and
// thread-pool setup, the train/predict/inspect flows, and process exit
// codes. All algorithmic work lives in the library; this file only wires
// resources together and narrates progress.

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use haplocall::data::{load_marker_table, load_query_table};
use haplocall::ensemble::ALL_LEVELS;
use haplocall::ensemble::combine::CombineOptions;
use haplocall::ensemble::stacking::{StackingConfig, StackingModel};
use haplocall::lookup::{CancelFlag, NomenclatureClient, build_taxonomy_offline};
use haplocall::preprocess::ImputerStats;
use haplocall::snapshot::{ModelSnapshot, SnapshotMetadata};
use haplocall::trainer::train_tree;
use haplocall::types::{MISSING_SENTINEL, TrainingConfig};

#[derive(Parser)]
#[clap(
    name = "haplocall",
    version,
    about = "A hierarchical taxonomic ensemble engine for Y-STR haplogroup prediction."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the taxonomy tree and per-level ensembles from a marker CSV.
    Train(TrainArgs),
    /// Predict haplogroups for query marker vectors against a snapshot.
    Predict(PredictArgs),
    /// Print the structure and quality metrics of a trained snapshot.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Semicolon-delimited training CSV with a haplogroup label column.
    data: PathBuf,

    /// Name of the label column.
    #[arg(long, default_value = "Haplogroup")]
    label_column: String,

    /// Output directory for the snapshot artifacts.
    #[arg(long)]
    out: PathBuf,

    /// Base URL of the nomenclature service.
    #[arg(long)]
    api_url: Option<String>,

    /// Build the taxonomy from synthetic fallback paths only, without
    /// consulting the nomenclature service.
    #[arg(long)]
    offline: bool,

    /// Master training seed.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Sample-batch size for incremental node training.
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Skip the per-level stacking ensembles (tree only).
    #[arg(long)]
    tree_only: bool,
}

#[derive(Args)]
struct PredictArgs {
    /// Snapshot directory produced by `train`.
    #[arg(long)]
    model: PathBuf,

    /// Semicolon-delimited CSV of query marker vectors.
    input: PathBuf,

    /// Flat level to combine families at: root, major or terminal.
    #[arg(long, default_value = "terminal")]
    level: String,

    /// Minimum confidence threshold; alternatives below half of it are
    /// dropped.
    #[arg(long, default_value = "0.7")]
    min_confidence: f64,

    /// Use only the preferred single family instead of the weighted
    /// ensemble combination.
    #[arg(long)]
    no_ensemble: bool,

    /// Renormalize blending weights when a configured family is absent.
    #[arg(long)]
    renormalize: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Snapshot directory produced by `train`.
    #[arg(long)]
    model: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()
    {
        log::debug!("Rayon pool already initialized: {err}");
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Predict(args) => run_predict(args),
        Command::Inspect(args) => run_inspect(args),
    };
    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run_train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let table = load_marker_table(&args.data, &args.label_column)?;

    let mut config = TrainingConfig {
        seed: args.seed,
        batch_size: args.batch_size,
        ..TrainingConfig::default()
    };
    if let Some(url) = &args.api_url {
        config.lookup_base_url = url.clone();
    }

    // Impute the training matrix once; node and level scalers are fitted on
    // the imputed values downstream.
    let imputer = ImputerStats::fit(table.x.view());
    let mut x = table.x;
    for mut row in x.rows_mut() {
        for (j, value) in row.iter_mut().enumerate() {
            if *value == MISSING_SENTINEL {
                *value = imputer.medians[j];
            }
        }
    }

    let mut arena = if args.offline {
        log::info!("Offline taxonomy build: every label takes its fallback path");
        build_taxonomy_offline(&table.labels)
    } else {
        let client = NomenclatureClient::new(
            &config.lookup_base_url,
            config.lookup_window,
            config.lookup_pause_ms,
        )?;
        let cancel = CancelFlag::new();
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(client.build_taxonomy(&table.labels, &cancel))
    };

    let summary = train_tree(&mut arena, x.view(), &table.labels, &config);
    log::info!(
        "Tree: {} nodes, {} trained, {} skipped, {} failed",
        arena.len(),
        summary.trained,
        summary.skipped,
        summary.failed
    );

    let mut levels = std::collections::BTreeMap::new();
    let mut class_weights = std::collections::BTreeMap::new();
    if !args.tree_only {
        for (index, level) in ALL_LEVELS.iter().enumerate() {
            let targets = level.targets(&table.labels);
            let mut distinct = targets.clone();
            distinct.sort();
            distinct.dedup();
            if distinct.len() < 2 {
                log::warn!(
                    "Skipping level {}: only {} distinct class(es)",
                    level.as_str(),
                    distinct.len()
                );
                continue;
            }
            log::info!(
                "Training {} level ensemble ({} classes)",
                level.as_str(),
                distinct.len()
            );
            let stacking_cfg = StackingConfig::standard(
                config.stacking_folds,
                config.seed.wrapping_add(index as u64),
            );
            let model = StackingModel::train(&stacking_cfg, x.view(), &targets)?;
            class_weights.insert(level.as_str().to_string(), model.class_weights.clone());
            levels.insert(level.as_str().to_string(), model);
        }
    }

    let snapshot = ModelSnapshot {
        metadata: SnapshotMetadata {
            schema: table.schema,
            imputer,
            config,
            class_weights,
        },
        arena,
        levels,
    };
    snapshot.save(&args.out)?;

    let importance = snapshot.root_feature_importance();
    if !importance.is_empty() {
        log::info!("Top markers by importance:");
        for (name, value) in importance {
            log::info!("  {name}: {value:.4}");
        }
    }
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn Error>> {
    let snapshot = ModelSnapshot::load(&args.model)?;
    let table = load_query_table(&args.input)?;

    let options = CombineOptions {
        renormalize_absent: args.renormalize,
        min_confidence: args.min_confidence,
        ..CombineOptions::default()
    };

    for (index, row) in table.x.rows().into_iter().enumerate() {
        let raw = row.to_vec();
        let path = snapshot.predict_tree(&raw, &table.schema)?;

        let report = if snapshot.levels.contains_key(&args.level) {
            match snapshot.predict_report(
                &args.level,
                &raw,
                &table.schema,
                &options,
                !args.no_ensemble,
            ) {
                Ok(report) => Some(report),
                Err(err) => {
                    log::error!("Sample {index}: {err}");
                    None
                }
            }
        } else {
            None
        };

        let answer = serde_json::json!({
            "sample": index,
            "path_predictions": path.levels,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&answer)?);
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<(), Box<dyn Error>> {
    let snapshot = ModelSnapshot::load(&args.model)?;

    println!(
        "Snapshot: {} features, {} taxonomy nodes ({} trained)",
        snapshot.metadata.schema.len(),
        snapshot.arena.len(),
        snapshot.arena.trained_count()
    );

    println!("Tree:");
    print_subtree(&snapshot, snapshot.arena.root(), 0);

    for (name, level) in &snapshot.levels {
        println!(
            "Level {name}: {} classes, macro_f1={:.4} weighted_f1={:.4} brier={:.4}",
            level.classes.len(),
            level.metrics.macro_f1,
            level.metrics.weighted_f1,
            level.metrics.brier
        );
    }
    Ok(())
}

fn print_subtree(snapshot: &ModelSnapshot, node: haplocall::taxonomy::NodeId, depth: usize) {
    let entry = snapshot.arena.get(node);
    let marker = if entry.is_trained() { "*" } else { "-" };
    println!("{}{} {}", "  ".repeat(depth), marker, entry.name);
    for &child in entry.children.values() {
        print_subtree(snapshot, child, depth + 1);
    }
}
