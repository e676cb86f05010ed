use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use ringlog_common::{LogId, StreamId, StreamType, BLOCK_SIZE};
use ringlog_engine::{LogManager, LogOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod scenario;

const USAGE: &str = "\
ringlog: multi-stream circular log engine

USAGE:
  ringlog create <dir> [size-bytes]        create a new log, print its id
  ringlog list <dir>                       list log ids under a directory
  ringlog scenario <dir> <scenario.toml>   run a scripted scenario
  ringlog soak <dir> [streams] [writes]    randomized multi-stream soak
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("");
    match command {
        "create" => {
            let dir = arg_path(&args, 1)?;
            let size = match args.get(2) {
                Some(s) => s.parse::<u64>().context("size must be a byte count")?,
                None => LogOptions::default().log_file_size,
            };
            let manager = LogManager::new(&dir);
            let log_id = LogId::new_random();
            let options = LogOptions {
                log_file_size: size,
                ..LogOptions::default()
            };
            manager.create_log(log_id, &options).await?;
            println!("{log_id}");
        }
        "list" => {
            let dir = arg_path(&args, 1)?;
            let manager = LogManager::new(&dir);
            for id in manager.enumerate_logs().await? {
                println!("{id}");
            }
        }
        "scenario" => {
            let dir = arg_path(&args, 1)?;
            let path = arg_path(&args, 2)?;
            scenario::run_scenario(&dir, &path).await?;
        }
        "soak" => {
            let dir = arg_path(&args, 1)?;
            let streams: usize = args.get(2).map_or(Ok(4), |s| s.parse())?;
            let writes: u64 = args.get(3).map_or(Ok(10_000), |s| s.parse())?;
            run_soak(&dir, streams, writes).await?;
        }
        _ => {
            eprint!("{USAGE}");
            bail!("unknown command '{command}'");
        }
    }
    Ok(())
}

fn arg_path(args: &[String], ix: usize) -> anyhow::Result<PathBuf> {
    args.get(ix)
        .map(PathBuf::from)
        .with_context(|| format!("missing argument {ix}; see usage"))
}

/// Tiny xorshift so the soak is reproducible without pulling a CLI-side
/// random crate.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Many streams writing random-sized records until the target count, with
/// each stream truncating its oldest 5% whenever the log reports full.
async fn run_soak(dir: &PathBuf, stream_count: usize, writes: u64) -> anyhow::Result<()> {
    let manager = LogManager::new(dir);
    let log_id = LogId::new_random();
    let log = manager.create_log(log_id, &LogOptions::default()).await?;
    info!(%log_id, stream_count, writes, "soak starting");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            warn!("interrupt received; stopping soak");
            cancel.cancel();
        });
    }

    let mut tasks = Vec::new();
    for worker in 0..stream_count {
        let stream = Arc::new(
            log.create_stream(StreamId::new_random(), StreamType::new_random())
                .await?,
        );
        let cancel = cancel.clone();
        let per_stream_writes = writes / stream_count as u64;
        tasks.push(tokio::spawn(async move {
            let mut rng = XorShift(0x9E37_79B9_7F4A_7C15 ^ worker as u64);
            let mut truncated_to = 0u64;
            let mut asn = 0u64;
            while asn < per_stream_writes && !cancel.is_cancelled() {
                asn += 1;
                let blocks = (rng.next() % 10) as usize;
                let payload = vec![asn as u8; blocks * BLOCK_SIZE];
                match stream.write(asn, 1, &asn.to_le_bytes(), &payload).await {
                    Ok(_) => {}
                    Err(ringlog_common::LogError::LogFull) => {
                        // Drop the oldest 5% and retry this ASN.
                        let upto = truncated_to + (asn - truncated_to) / 20 + 1;
                        stream.truncate(upto, upto).await?;
                        truncated_to = upto;
                        asn -= 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok::<u64, ringlog_common::LogError>(asn)
        }));
    }

    let mut total = 0u64;
    for task in tasks {
        total += task.await??;
    }
    info!(total, "soak finished");
    Ok(())
}
