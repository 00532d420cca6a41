use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use yardbird::broadcaster::Broadcaster;
use yardbird::config::{self, AppConfig};
use yardbird::logging::init_logging;
use yardbird::pipeline::Pipeline;
use yardbird::store::DetectionRepository;

#[derive(Parser)]
#[command(name = "yardbird", version)]
#[command(about = "Classify Frigate bird events and keep the best species guess per event")]
struct Cli {
    /// Config file (default: ./yardbird.toml if present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume Frigate events until Ctrl-C
    Run {
        /// Print every broadcast detection as a server-sent-events frame
        #[arg(long)]
        print_events: bool,
    },

    /// Show recent detections
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
        #[arg(long)]
        json: bool,
    },

    /// Detection counts per species
    Species,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    init_logging(&cfg.log_level);

    match cli.command {
        Command::Run { print_events } => run(cfg, print_events).await?,

        Command::Recent { limit, offset, json } => {
            let repo = DetectionRepository::open(&cfg.database.path)?;
            let rows = repo.recent(limit, offset)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No detections yet.");
            } else {
                println!(
                    "{:<20} {:<12} {:<28} {:>5} {:>3}  {}",
                    "Time", "Camera", "Species", "Score", "Idx", "Event"
                );
                println!("{}", "─".repeat(100));
                for d in rows {
                    println!(
                        "{:<20} {:<12} {:<28} {:>4.0}% {:>3}  {}",
                        d.detection_time.format("%Y-%m-%d %H:%M:%S"),
                        d.camera_name,
                        d.display_name,
                        d.score * 100.0,
                        d.detection_index,
                        d.event_id
                    );
                }
            }
        }

        Command::Species => {
            let repo = DetectionRepository::open(&cfg.database.path)?;
            let counts = repo.species_counts()?;
            if counts.is_empty() {
                println!("No detections yet.");
            }
            for c in counts {
                println!("{:>6}  {}", c.count, c.species);
            }
        }
    }
    Ok(())
}

async fn run(cfg: AppConfig, print_events: bool) -> Result<()> {
    let broadcaster = Broadcaster::new();

    let printer = print_events.then(|| {
        let mut sub = broadcaster.subscribe();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                match event.to_sse_frame() {
                    Ok(frame) => print!("{frame}"),
                    Err(err) => warn!(error = %err, "Failed to render event"),
                }
            }
        })
    });

    let handle = Pipeline::new(cfg).start(broadcaster)?;
    info!(started_at = %handle.started_at, "Yardbird running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.stop();
    handle.join().await;

    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(())
}
