//! segments - operator inspection tool
//!
//! Read-only views over the edge segment index and the hub job queue, so
//! failed segments and errored jobs can be diagnosed without log access.

use anyhow::Result;
use clap::{Parser, Subcommand};

use watchpost::hub::queue::ProcessingQueue;
use watchpost::storage::SegmentIndex;

#[derive(Parser)]
#[command(name = "segments", about = "Inspect watchpost segment and job state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List segments in the edge index, newest first.
    Edge {
        /// Path to the edge database.
        #[arg(long, default_value = "watchpost.db", env = "WATCHPOST_DB_PATH")]
        db: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only show segments in this state (open, closed, pending_upload,
        /// uploaded, failed).
        #[arg(long)]
        state: Option<String>,
    },
    /// List jobs in the hub queue, newest first.
    Jobs {
        #[arg(long, default_value = "hub.db", env = "WATCHPOST_HUB_DB_PATH")]
        db: String,
        #[arg(long, default_value = "spool", env = "WATCHPOST_HUB_SPOOL")]
        spool: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List clustered detection events, newest first.
    Events {
        #[arg(long, default_value = "hub.db", env = "WATCHPOST_HUB_DB_PATH")]
        db: String,
        #[arg(long, default_value = "spool", env = "WATCHPOST_HUB_SPOOL")]
        spool: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Edge { db, limit, state } => {
            let index = SegmentIndex::open(&db)?;
            let filter = state
                .as_deref()
                .map(watchpost::SegmentState::parse)
                .transpose()?;
            for record in index.list_all(limit)? {
                if let Some(filter) = filter {
                    if record.state != filter {
                        continue;
                    }
                }
                println!(
                    "{:>6}  {:<16} start={} end={} state={:<14} attempts={} frames={}{}",
                    record.id,
                    record.camera_id,
                    record.start_ms,
                    record
                        .end_ms
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    record.state.as_str(),
                    record.attempts,
                    record.frame_count,
                    record
                        .last_error
                        .map(|e| format!("  error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Jobs { db, spool, limit } => {
            let queue = ProcessingQueue::open(&db, std::path::Path::new(&spool))?;
            for job in queue.list_jobs(limit)? {
                println!(
                    "{:>6}  {:<16} start={} state={:<10} detections={}{}",
                    job.id,
                    job.camera_id,
                    job.start_ms,
                    job.state,
                    job.detection_count,
                    job.last_error
                        .map(|e| format!("  error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Events { db, spool, limit } => {
            let queue = ProcessingQueue::open(&db, std::path::Path::new(&spool))?;
            for (job_id, camera_id, event) in queue.list_events(limit)? {
                println!(
                    "job {:>6}  {:<16} {} x{} conf {:.2} window {}..{} box {}x{}+{}+{}",
                    job_id,
                    camera_id,
                    event.label,
                    event.count,
                    event.peak_confidence,
                    event.first_ms,
                    event.last_ms,
                    event.region.w,
                    event.region.h,
                    event.region.x,
                    event.region.y
                );
            }
        }
    }
    Ok(())
}
