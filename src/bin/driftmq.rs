//! driftmq – inspect and drain the disk-backed overflow queue of a channel.
//
//  $ driftmq --config driftmq.toml depth orders archive
//  $ driftmq drain orders archive --limit 10

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use driftmq::core::message::decode_message;
use driftmq::{load_config, BackendQueue, Config, DiskQueue};

#[derive(Debug, Parser)]
#[command(name = "driftmq", version, about = "DriftMQ channel backend tool")]
struct Cli {
    /// Path to config TOML (env DRIFTMQ_CONFIG overrides)
    #[arg(short, long, default_value = "driftmq.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the number of messages persisted for a channel.
    Depth { topic: String, channel: String },
    /// Read, print and remove persisted messages.
    Drain {
        topic: String,
        channel: String,
        /// Stop after this many messages
        #[arg(short, long)]
        limit: Option<u64>,
        /// Give up when no message arrives within this many milliseconds
        #[arg(long, default_value_t = 500)]
        idle_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    driftmq::logging::init_logging()?;
    let cli = Cli::parse();

    let cfg_path: String = std::env::var("DRIFTMQ_CONFIG").unwrap_or(cli.config);
    let cfg: Config = load_config(&cfg_path)?;
    let opts = cfg.backend.disk_queue_options();

    match cli.cmd {
        Command::Depth { topic, channel } => {
            let queue = DiskQueue::open(format!("{topic}:{channel}"), opts)?;
            println!("{}", queue.depth());
            queue.close()?;
        }
        Command::Drain {
            topic,
            channel,
            limit,
            idle_ms,
        } => {
            let queue = DiskQueue::open(format!("{topic}:{channel}"), opts)?;
            let read_rx = queue.read_chan();
            let idle = Duration::from_millis(idle_ms);
            let mut drained = 0u64;

            while limit.map_or(true, |limit| drained < limit) {
                let buf = match tokio::time::timeout(idle, read_rx.recv_async()).await {
                    Ok(Ok(buf)) => buf,
                    _ => break,
                };
                let msg = decode_message(&buf)?;
                println!(
                    "{} attempts={} ts={} {}",
                    msg.id,
                    msg.attempts,
                    msg.timestamp,
                    String::from_utf8_lossy(&msg.body)
                );
                drained += 1;
            }

            info!(target: "driftmq::cli", drained, remaining = queue.depth(), "drain finished");
            queue.close()?;
        }
    }
    Ok(())
}
