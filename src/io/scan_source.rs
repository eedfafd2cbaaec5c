//! Scan sources - feed normalized observations into the pipeline
//!
//! The radio itself is an external collaborator. It delivers one JSON
//! object per advertisement, either on stdin or appended to a file.

use crate::domain::types::Observation;
use crate::infra::metrics::Metrics;
use crate::services::normalizer::parse_line;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[async_trait]
pub trait ScanSource: Send {
    fn name(&self) -> &str;

    /// Deliver observations until the input ends or shutdown is signalled.
    /// Dropping `tx` on return lets the pipeline see the end of input.
    async fn run(
        &mut self,
        tx: mpsc::Sender<Observation>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// JSON-lines reader over any async buffered input
pub struct JsonLinesSource<R> {
    name: String,
    reader: R,
    metrics: Arc<Metrics>,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(name: &str, reader: R, metrics: Arc<Metrics>) -> Self {
        Self { name: name.to_string(), reader, metrics }
    }
}

#[async_trait]
impl<R> ScanSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &mut self,
        tx: mpsc::Sender<Observation>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(source = %self.name, "scan_source_started");
        let mut line = String::new();
        let mut lines = 0u64;

        loop {
            line.clear();
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(source = %self.name, "scan_source_shutdown");
                    break;
                }
                read = self.reader.read_line(&mut line) => {
                    let n = read.with_context(|| format!("Failed to read from {}", self.name))?;
                    if n == 0 {
                        info!(source = %self.name, lines = %lines, "scan_source_exhausted");
                        break;
                    }
                    lines += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line, Utc::now()) {
                        Some(observation) => {
                            if tx.send(observation).await.is_err() {
                                debug!(source = %self.name, "scan_source_receiver_closed");
                                break;
                            }
                        }
                        None => self.metrics.record_observation_dropped(),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Open the configured input: "-" for stdin, otherwise a file path
pub async fn open_source(input: &str, metrics: Arc<Metrics>) -> anyhow::Result<Box<dyn ScanSource>> {
    if input == "-" {
        let reader = BufReader::new(tokio::io::stdin());
        return Ok(Box::new(JsonLinesSource::new("stdin", reader, metrics)));
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open scan input {}", input))?;
    Ok(Box::new(JsonLinesSource::new(input, BufReader::new(file), metrics)))
}
