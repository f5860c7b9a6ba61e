//! Tangent CLI - run the topic-map pipeline and inspect its outputs
//!
//! Usage: tangent-cli [OPTIONS] <COMMAND>

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use tangent::branches::analyze_branches_with_gap;
use tangent::import::{detect_chat_type, parse_export_file};
use tangent::{
    spawn_periodic_refresh, ArtifactStore, ChatType, Error, InMemoryMessageStore, MessageStore,
    Pipeline, Result, Settings, TaskQueue, TaskSource, TaskState,
};

#[derive(Parser)]
#[command(name = "tangent-cli")]
#[command(version, about = "Conversation topic maps and edit-branch analysis", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory (default: BASE_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Detailed logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once and wait for it to finish
    Process {
        /// Chat export to process (partition is detected from the file)
        #[arg(long, conflicts_with = "partition")]
        file: Option<PathBuf>,
        /// Reprocess the stored snapshot of this partition
        #[arg(long, short)]
        partition: Option<ChatType>,
    },
    /// Show edit branches of an export or a stored snapshot
    Branches {
        #[arg(long, conflicts_with = "partition")]
        file: Option<PathBuf>,
        #[arg(long, short)]
        partition: Option<ChatType>,
        /// Only this chat
        #[arg(long)]
        chat: Option<String>,
    },
    /// Print the current artifact set of a partition
    Artifacts {
        #[arg(long, short)]
        partition: ChatType,
    },
    /// Keep refreshing every partition on a timer until Ctrl-C
    Watch {
        /// Seconds between refreshes (default: refresh_interval_secs or 300)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List the month history of a partition, or print one month's state
    States {
        #[arg(long, short)]
        partition: ChatType,
        /// Month to print, YYYY-MM
        #[arg(long)]
        month: Option<String>,
    },
    /// Delete a partition's artifacts and raw snapshot
    Clear {
        #[arg(long, short)]
        partition: ChatType,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if let Err(e) = run_cli(cli).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let mut settings = Settings::load_default();
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = Some(dir.to_string_lossy().into_owned());
    }
    settings.validate()?;
    let artifacts = ArtifactStore::new(settings.data_dir());

    match cli.command {
        Commands::Process { file, partition } => {
            let (partition, source) = match (file, partition) {
                (Some(path), _) => (detect_file_partition(&path)?, Some(TaskSource::File(path))),
                (None, Some(p)) => (p, None),
                (None, None) => return Err(Error::Config("Pass --file or --partition".to_string())),
            };

            let store = rehydrated_store(&artifacts)?;
            let pipeline = Arc::new(Pipeline::from_settings(&settings)?);
            let (queue, _worker) = TaskQueue::start(store, pipeline, settings.status_retention);

            let task_id = queue.enqueue_task(partition, source)?;
            let status = queue
                .wait_for(&task_id, Duration::from_millis(200))
                .await
                .ok_or(Error::QueueClosed)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Task {}: {:?} ({:.0}%)", task_id, status.status, status.progress);
                if let Some(outcome) = &status.outcome {
                    println!(
                        "  {} messages, {} points, {} clusters, {} noise",
                        outcome.messages, outcome.points, outcome.clusters, outcome.noise_points
                    );
                    for (cluster, topic) in &outcome.topics {
                        println!("  [{}] {}", cluster, topic);
                    }
                    if outcome.months > 0 {
                        println!("  {} month states", outcome.months);
                    }
                }
            }
            if status.status != TaskState::Completed {
                let reason = status.error.unwrap_or_else(|| format!("ended as {:?}", status.status));
                return Err(Error::Task(format!("Task {} failed: {}", task_id, reason)));
            }
        }

        Commands::Branches { file, partition, chat } => {
            let messages = match (file, partition) {
                (Some(path), _) => parse_export_file(&path)?.1,
                (None, Some(p)) => rehydrated_store(&artifacts)?.snapshot(p),
                (None, None) => return Err(Error::Config("Pass --file or --partition".to_string())),
            };

            let mut analysis = analyze_branches_with_gap(&messages, settings.edit_gap_secs);
            if let Some(name) = chat {
                analysis.chats.retain(|chat_name, _| chat_name == &name);
            }

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                for (chat_name, branches) in &analysis.chats {
                    println!(
                        "{}: {} main messages, {} edit branches",
                        chat_name,
                        branches.main_branch.len(),
                        branches.edit_branches.len()
                    );
                    for (branch_id, branch) in &branches.edit_branches {
                        println!(
                            "  {} after {:.0}s gap, {} messages",
                            branch_id,
                            branch.time_gap_secs,
                            branch.branch_messages.len()
                        );
                    }
                    for (branch_id, alternates) in &branches.alternate_branches {
                        println!("  {} alternate, {} messages", branch_id, alternates.len());
                    }
                }
                if analysis.skipped > 0 {
                    println!("Skipped {} invalid records", analysis.skipped);
                }
            }
        }

        Commands::Artifacts { partition } => {
            let set = artifacts.read_artifacts(partition);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&set)?);
            } else if set.is_empty() {
                println!("No artifacts for {}", partition);
            } else {
                println!("{}: {} points, {} topics", partition, set.len(), set.topics.len());
                for (cluster, topic) in &set.topics {
                    let size = set.clusters.iter().filter(|&&c| c == *cluster).count();
                    println!("  [{}] {} ({} points)", cluster, topic, size);
                }
            }
        }

        Commands::Watch { interval } => {
            let secs = interval.or(settings.refresh_interval_secs).unwrap_or(300).max(1);
            let store = rehydrated_store(&artifacts)?;
            let pipeline = Arc::new(Pipeline::from_settings(&settings)?);
            let (queue, _worker) = TaskQueue::start(store, pipeline, settings.status_retention);

            let refresh = spawn_periodic_refresh(queue, ChatType::ALL.to_vec(), Duration::from_secs(secs));
            tracing::info!(interval_secs = secs, "Watching, Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| Error::Config(format!("Failed to listen for Ctrl-C: {}", e)))?;
            refresh.abort();
            tracing::info!("Stopped");
        }

        Commands::States { partition, month } => match month {
            Some(month) => {
                let state = artifacts
                    .read_state(partition, &month)
                    .ok_or_else(|| Error::Store(format!("No {} state for {}", partition, month)))?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                } else {
                    println!(
                        "{} {}: {} points, {} topics",
                        partition,
                        state.month_year,
                        state.total_conversations,
                        state.topics.len()
                    );
                    for (cluster, topic) in &state.topics {
                        println!("  [{}] {}", cluster, topic);
                    }
                }
            }
            None => {
                let months = artifacts.list_months(partition);
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&months)?);
                } else if months.is_empty() {
                    println!("No month history for {}", partition);
                } else {
                    for month in months {
                        println!("{}", month);
                    }
                }
            }
        },

        Commands::Clear { partition } => {
            artifacts.clear(partition)?;
            println!("Cleared {}", partition);
        }
    }

    Ok(())
}

fn detect_file_partition(path: &Path) -> Result<ChatType> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let data: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| Error::Import(format!("Failed to parse export JSON: {}", e)))?;
    detect_chat_type(&data)
}

/// In-memory store filled from the persisted raw snapshots
fn rehydrated_store(artifacts: &ArtifactStore) -> Result<Arc<InMemoryMessageStore>> {
    let store = Arc::new(InMemoryMessageStore::new());
    for partition in ChatType::ALL {
        store.rehydrate(partition, &artifacts.snapshot_path(partition))?;
    }
    Ok(store)
}
