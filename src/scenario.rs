use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use ringlog_common::{Asn, LogId, StreamId, StreamType, BLOCK_SIZE};
use ringlog_engine::{Log, LogManager, LogOptions, LogStream};
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Clone, Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
    /// Log file size in bytes; defaults to the engine default.
    pub log_size: Option<u64>,
}

#[derive(Clone, Deserialize)]
#[serde(tag = "op")]
pub enum ScenarioStep {
    #[serde(rename = "create_stream")]
    CreateStream { stream: String },
    #[serde(rename = "write")]
    Write {
        stream: String,
        asn: Asn,
        version: Option<u64>,
        blocks: Option<u32>,
    },
    #[serde(rename = "write_range")]
    WriteRange {
        stream: String,
        from_asn: Asn,
        to_asn: Asn,
        blocks: Option<u32>,
    },
    #[serde(rename = "truncate")]
    Truncate {
        stream: String,
        asn: Asn,
        preferred: Option<Asn>,
    },
    #[serde(rename = "read_verify")]
    ReadVerify { stream: String, asn: Asn },
    #[serde(rename = "checkpoint")]
    Checkpoint,
    #[serde(rename = "reopen")]
    Reopen,
    #[serde(rename = "sleep_ms")]
    SleepMs { value: u64 },
    #[serde(rename = "repeat")]
    Repeat { count: u64, steps: Vec<ScenarioStep> },
}

/// Deterministic payload for an ASN: `blocks` blocks filled with the low
/// byte of the ASN. Lets `read_verify` recompute expectations after a
/// reopen.
fn payload_for(asn: Asn, blocks: u32) -> Vec<u8> {
    vec![asn as u8; blocks as usize * BLOCK_SIZE]
}

fn metadata_for(asn: Asn) -> Vec<u8> {
    asn.to_le_bytes().to_vec()
}

struct ScenarioRunner {
    manager: LogManager,
    log_id: LogId,
    log: Option<Arc<Log>>,
    streams: HashMap<String, (StreamId, LogStream)>,
    /// Remembered write shapes so read_verify can recompute expected bytes.
    written: HashMap<(String, Asn), u32>,
}

impl ScenarioRunner {
    fn log(&self) -> &Arc<Log> {
        self.log.as_ref().expect("log is open")
    }

    /// Drop every handle, then open again, running a full close/recover cycle.
    async fn reopen(&mut self) -> anyhow::Result<()> {
        let ids: Vec<(String, StreamId)> = self
            .streams
            .iter()
            .map(|(name, (id, _))| (name.clone(), *id))
            .collect();
        self.streams.clear();
        self.log = None;
        let log = self.manager.open_log(self.log_id).await?;
        for (name, id) in ids {
            let stream = log.open_stream(id)?;
            self.streams.insert(name, (id, stream));
        }
        self.log = Some(log);
        Ok(())
    }

    fn stream(&self, name: &str) -> anyhow::Result<&LogStream> {
        self.streams
            .get(name)
            .map(|(_, s)| s)
            .with_context(|| format!("unknown stream '{name}'"))
    }

    /// Read-after-write verify: up to 4 attempts, 100 ms apart, to
    /// tolerate a racing higher-version rewrite.
    async fn read_verify(&self, name: &str, asn: Asn) -> anyhow::Result<()> {
        let blocks = *self
            .written
            .get(&(name.to_string(), asn))
            .with_context(|| format!("ASN {asn} was never written to '{name}'"))?;
        let stream = self.stream(name)?;
        let mut last_err = None;
        for _ in 0..4 {
            match stream.read(asn).await {
                Ok(record) => {
                    if record.metadata != metadata_for(asn)
                        || record.io_buffer != payload_for(asn, blocks)
                    {
                        bail!("ASN {asn} read back different bytes");
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        bail!("ASN {asn} unreadable after retries: {:?}", last_err)
    }
}

/// Expand `repeat` blocks into a flat step list.
fn flatten(steps: &[ScenarioStep], out: &mut Vec<ScenarioStep>) {
    for step in steps {
        match step {
            ScenarioStep::Repeat { count, steps } => {
                for _ in 0..*count {
                    flatten(steps, out);
                }
            }
            other => out.push(other.clone()),
        }
    }
}

/// Load and run a TOML scenario against a fresh log in `root`.
pub async fn run_scenario(root: &Path, scenario_path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(scenario_path)
        .with_context(|| format!("reading {}", scenario_path.display()))?;
    let scenario: Scenario = toml::from_str(&text)?;
    info!(
        name = %scenario.meta.name,
        description = scenario.meta.description.as_deref().unwrap_or(""),
        "running scenario"
    );

    let manager = LogManager::new(root);
    let log_id = LogId::new_random();
    let options = LogOptions {
        log_file_size: scenario.meta.log_size.unwrap_or(LogOptions::default().log_file_size),
        ..LogOptions::default()
    };
    let log = manager.create_log(log_id, &options).await?;
    let mut runner = ScenarioRunner {
        manager,
        log_id,
        log: Some(log),
        streams: HashMap::new(),
        written: HashMap::new(),
    };

    let mut steps = Vec::new();
    flatten(&scenario.steps, &mut steps);

    for step in steps {
        match step {
            ScenarioStep::CreateStream { stream } => {
                let id = StreamId::new_random();
                let handle = runner
                    .log()
                    .create_stream(id, StreamType::new_random())
                    .await?;
                runner.streams.insert(stream, (id, handle));
            }
            ScenarioStep::Write {
                stream,
                asn,
                version,
                blocks,
            } => {
                let blocks = blocks.unwrap_or(1);
                runner
                    .stream(&stream)?
                    .write(
                        asn,
                        version.unwrap_or(1),
                        &metadata_for(asn),
                        &payload_for(asn, blocks),
                    )
                    .await?;
                runner.written.insert((stream, asn), blocks);
            }
            ScenarioStep::WriteRange {
                stream,
                from_asn,
                to_asn,
                blocks,
            } => {
                let blocks = blocks.unwrap_or(1);
                for asn in from_asn..=to_asn {
                    runner
                        .stream(&stream)?
                        .write(asn, 1, &metadata_for(asn), &payload_for(asn, blocks))
                        .await?;
                    runner.written.insert((stream.clone(), asn), blocks);
                }
            }
            ScenarioStep::Truncate {
                stream,
                asn,
                preferred,
            } => {
                runner
                    .stream(&stream)?
                    .truncate(asn, preferred.unwrap_or(asn))
                    .await?;
            }
            ScenarioStep::ReadVerify { stream, asn } => {
                runner.read_verify(&stream, asn).await?;
            }
            ScenarioStep::Checkpoint => {
                runner.log().checkpoint_now().await?;
            }
            ScenarioStep::Reopen => {
                runner.reopen().await?;
            }
            ScenarioStep::SleepMs { value } => {
                tokio::time::sleep(Duration::from_millis(value)).await;
            }
            ScenarioStep::Repeat { .. } => unreachable!("flattened above"),
        }
    }
    info!(name = %scenario.meta.name, "scenario complete");
    Ok(())
}
