//! Headless pipeline runner and store query tool.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::Result;
use tracing::{info, warn};

use laneflow_capture::{BufferedCapture, CaptureOptions};
use laneflow_config::AppConfig;
use laneflow_detect::ScriptedDetector;
use laneflow_pipeline::{
    logging, PipelineEvent, PipelineHandles, PipelineStores, PipelineSupervisor, ReconnectPolicy,
};
use laneflow_store::{CounterStore, HistoryFilter, QueueFilter, QueueStore};

#[derive(Parser)]
#[command(name = "laneflow", about = "Traffic camera vehicle counting pipeline")]
struct Cli {
    /// Configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Optional log file in addition to the console.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline headless, printing events.
    Run {
        /// Counters database path.
        #[arg(long, default_value = "counters.db")]
        counters_db: PathBuf,
        /// Queue events database path.
        #[arg(long, default_value = "queue.db")]
        queue_db: PathBuf,
    },
    /// Print the default configuration document.
    DefaultConfig,
    /// Show recent count history.
    History {
        #[arg(long, default_value = "counters.db")]
        counters_db: PathBuf,
        #[arg(long)]
        camera: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show aggregate queue wait metrics.
    QueueMetrics {
        #[arg(long, default_value = "queue.db")]
        queue_db: PathBuf,
        #[arg(long)]
        camera: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::initiate_logging(cli.log_file.as_deref()).map_err(|e| eyre::eyre!("{e}"))?;

    match cli.command {
        Command::Run {
            counters_db,
            queue_db,
        } => run(&cli.config, &counters_db, &queue_db),
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&AppConfig::default())?);
            Ok(())
        }
        Command::History {
            counters_db,
            camera,
            limit,
        } => {
            let store = CounterStore::open(&counters_db)?;
            let filter = HistoryFilter {
                rtsp_url: camera,
                limit: Some(limit),
                ..Default::default()
            };
            for event in store.history_events(&filter)? {
                println!(
                    "{}  {:10} {:6}  {}",
                    laneflow_types::timestamp::format_epoch_local(event.timestamp as f64),
                    event.category.label(),
                    event.direction.wire_name(),
                    event.rtsp_url
                );
            }
            Ok(())
        }
        Command::QueueMetrics { queue_db, camera } => {
            let store = QueueStore::open(&queue_db)?;
            let metrics = store.metrics(&QueueFilter {
                rtsp_url: camera,
                ..Default::default()
            })?;
            println!(
                "events: {}  avg: {:.1}s  max: {:.1}s  min: {:.1}s",
                metrics.total, metrics.avg_wait, metrics.max_wait, metrics.min_wait
            );
            Ok(())
        }
    }
}

fn run(config_path: &PathBuf, counters_db: &PathBuf, queue_db: &PathBuf) -> Result<()> {
    let config = AppConfig::load(config_path);
    if config.rtsp_url.is_empty() {
        eyre::bail!(
            "no rtsp_url configured; edit {} and retry",
            config_path.display()
        );
    }

    // a store that cannot be opened degrades to in-memory counters
    let counters = match CounterStore::open(counters_db) {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!("counter store unavailable, running in-memory only: {e}");
            None
        }
    };
    let queue = match QueueStore::open(queue_db) {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!("queue store unavailable, queue events will not persist: {e}");
            None
        }
    };

    let buffer_size = config.rtsp_buffer_size;
    let handles = PipelineHandles {
        capture_factory: Box::new(move |url, stop| {
            BufferedCapture::open_rtsp(url, &CaptureOptions::default(), stop, buffer_size)
        }),
        // the neural detector is an external collaborator; without one the
        // pipeline still captures, draws and reconnects
        detector_factory: Box::new(|options| {
            warn!(
                "no detector backend linked (model '{}'); tracks will be empty",
                options.model
            );
            Ok(Box::new(ScriptedDetector::new(
                Vec::new(),
                options.min_confidence,
            )))
        }),
        reconnect: ReconnectPolicy::default(),
    };

    let (mut supervisor, events) =
        PipelineSupervisor::start(config, PipelineStores { counters, queue }, handles);

    let (ctrlc_tx, ctrlc_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(());
    })?;

    // drain events until the pipeline winds down
    let mut frames: u64 = 0;
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(PipelineEvent::Status(status)) => info!("status: {status}"),
                Ok(PipelineEvent::Log(line)) => info!("{line}"),
                Ok(PipelineEvent::Counters(snapshot)) => {
                    info!("counted so far: {}", snapshot.grand_total())
                }
                Ok(PipelineEvent::QueueStats(stats)) => {
                    if stats.waiting_count > 0 {
                        info!(
                            "queue: {} waiting, max {:.0}s ({})",
                            stats.waiting_count,
                            stats.max_wait_current,
                            stats.status.label()
                        );
                    }
                }
                Ok(PipelineEvent::Fps(fps)) => info!("{fps:.1} fps"),
                Ok(PipelineEvent::Frame(_)) => frames += 1,
                Err(_) => break,
            },
            recv(ctrlc_rx) -> _ => {
                info!("interrupt received, stopping");
                supervisor.stop();
            }
        }
    }
    info!("pipeline finished after {frames} frames");
    Ok(())
}
