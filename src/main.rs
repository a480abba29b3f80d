// Command-line front end for the `shape_vision` library: trains shapes from image
// directories, classifies single images or whole directories, and inspects what the
// extractor produces for an image.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shape_vision::core_modules::utils::image_helper;
use shape_vision::parallel_pipeline::TaskOutput;
use shape_vision::{BatchRunner, ClassifierConfig, JsonFileStore, ShapePipeline, StoreSession, Verdict};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

/// Classify images against trained shape templates.
#[derive(Parser)]
#[command(name = "shape_vision")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration; the built-in catalogue is used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append reference rows for one shape from every image in a directory
    Train { shape: String, dir: PathBuf },
    /// Train every shape from its sub-directory of ROOT, concurrently
    TrainAll { root: PathBuf },
    /// Classify a single image
    Classify {
        image: PathBuf,
        /// Print the full verdict as JSON
        #[arg(long)]
        json: bool,
    },
    /// Classify every image in a directory
    Batch { dir: PathBuf },
    /// Show the extraction dimensions of an image for each kernel
    Inspect {
        image: PathBuf,
        /// Limit to one shape
        #[arg(long)]
        shape: Option<String>,
        /// Write the input grid and every pooled map as PNGs into this directory
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Drop stored references, for one shape or all of them
    Reset {
        #[arg(long)]
        shape: Option<String>,
    },
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ClassifierConfig> {
    match path {
        Some(path) => ClassifierConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(ClassifierConfig::default()),
    }
}

fn print_verdict(name: &str, verdict: &Verdict) {
    println!(
        "{}: {} ({:.2}%, {:?})",
        name, verdict.label, verdict.confidence, verdict.rule
    );
    for (shape, euclidian) in &verdict.euclidian {
        let cosine = verdict.cosine.get(shape).copied().unwrap_or(0.0);
        println!("    {:<12} euclidian {:>6.2}%  cosine {:.4}", shape, euclidian * 100.0, cosine);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Train { shape, dir } => {
            let session = StoreSession::open(&config.store_path)?;
            let pipeline = Arc::new(ShapePipeline::new(config, session.handle())?);
            let runner = BatchRunner::new(pipeline);
            let summary = runner.train_dir(&shape, &dir).await?;
            runner.shutdown().await;
            session.finish()?;
            println!(
                "{}: {} rows from {} images ({} failed)",
                summary.shape,
                summary.rows,
                summary.images,
                summary.failed.len()
            );
        }
        Commands::TrainAll { root } => {
            let session = StoreSession::open(&config.store_path)?;
            let pipeline = Arc::new(ShapePipeline::new(config, session.handle())?);
            let runner = BatchRunner::new(pipeline);
            let summaries = runner.train_all(&root).await?;
            runner.shutdown().await;
            session.finish()?;
            for summary in summaries {
                println!(
                    "{}: {} rows from {} images ({} failed)",
                    summary.shape,
                    summary.rows,
                    summary.images,
                    summary.failed.len()
                );
            }
        }
        Commands::Classify { image, json } => {
            let store = Arc::new(JsonFileStore::open(&config.store_path)?);
            let pipeline = ShapePipeline::new(config, store)?;
            let grid = pipeline
                .load_image(&image)
                .with_context(|| format!("failed to load {}", image.display()))?;
            let verdict = pipeline.classify(&grid)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            } else {
                print_verdict(&image.display().to_string(), &verdict);
            }
        }
        Commands::Batch { dir } => {
            let store = Arc::new(JsonFileStore::open(&config.store_path)?);
            let runner = BatchRunner::new(Arc::new(ShapePipeline::new(config, store)?));
            let outcomes = runner.classify_dir(&dir).await?;
            runner.shutdown().await;
            for outcome in outcomes {
                let name = outcome.path.display().to_string();
                match outcome.result {
                    Ok(TaskOutput::Classified(verdict)) => print_verdict(&name, &verdict),
                    Ok(TaskOutput::Trained(_)) => {}
                    Err(e) => println!("{}: error: {}", name, e),
                }
            }
        }
        Commands::Inspect { image, shape, dump } => {
            let store = Arc::new(shape_vision::MemoryStore::new());
            let pipeline = ShapePipeline::new(config, store)?;
            let grid = pipeline.load_image(&image)?;
            println!("image {} -> grid {}", image.display(), grid.dims());
            if let Some(dir) = &dump {
                std::fs::create_dir_all(dir)?;
                image_helper::save_grid_png(&grid, dir.join("input.png"))?;
            }

            let names: Vec<String> = match shape {
                Some(name) => vec![pipeline.shape(&name)?.name.clone()],
                None => pipeline.shapes().iter().map(|s| s.name.clone()).collect(),
            };
            for name in names {
                println!("{}:", name);
                for kernel in pipeline.inspect(&grid, &name)? {
                    let r = &kernel.report;
                    println!(
                        "    {:<20} kernel {}x{}  feature {}x{}  activated {}x{}  pooled {}x{} after {} passes",
                        kernel.kernel_id,
                        r.kernel_dims.0,
                        r.kernel_dims.1,
                        r.feature_dims.0,
                        r.feature_dims.1,
                        r.activated_dims.0,
                        r.activated_dims.1,
                        r.pooled_dims.0,
                        r.pooled_dims.1,
                        r.pooling_passes
                    );
                    if let Some(dir) = &dump {
                        image_helper::save_grid_png(
                            &kernel.pooled,
                            dir.join(format!("{}.png", kernel.kernel_id)),
                        )?;
                    }
                }
            }
        }
        Commands::Reset { shape } => {
            let session = StoreSession::open(&config.store_path)?;
            let pipeline = ShapePipeline::new(config, session.handle())?;
            let count = pipeline.reset(shape.as_deref())?;
            drop(pipeline);
            session.finish()?;
            println!("reset {} kernels", count);
        }
    }

    Ok(())
}
