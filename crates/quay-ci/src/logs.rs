//! Container log forwarding.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use quay_state::{JobId, LogEntry, LogSink, StorageResult, VariantId};
use tracing::{info, warn};

use crate::runtime::LogStream;

/// Where a stream of log lines comes from.
#[derive(Debug, Clone)]
pub struct LogSource {
    pub project_id: String,
    pub job_id: JobId,
    pub variant_id: Option<VariantId>,
    pub image: String,
}

impl LogSource {
    fn entry(&self, message: String) -> LogEntry {
        LogEntry {
            project_id: self.project_id.clone(),
            job_id: self.job_id.clone(),
            variant_id: self.variant_id.clone(),
            image: self.image.clone(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Drain `stream` into `sink`, returning the number of lines forwarded.
///
/// A sink failure is reported once and the remaining lines are still
/// drained: losing log lines never fails a container.
pub async fn forward_logs(
    mut stream: LogStream,
    sink: Arc<dyn LogSink>,
    source: LogSource,
) -> usize {
    let mut forwarded = 0;
    let mut sink_failed = false;
    while let Some(line) = stream.next().await {
        if sink_failed {
            continue;
        }
        match sink.feed(source.entry(line)).await {
            Ok(()) => forwarded += 1,
            Err(e) => {
                warn!(
                    image = %source.image,
                    error = %e,
                    "log sink rejected entry, dropping further output"
                );
                sink_failed = true;
            }
        }
    }
    forwarded
}

/// Tracing target of re-emitted container output.
pub const CONTAINER_TARGET: &str = "quay::container";

/// Re-emits container output as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn feed(&self, entry: LogEntry) -> StorageResult<()> {
        match &entry.variant_id {
            Some(variant) => info!(
                target: CONTAINER_TARGET,
                image = %entry.image,
                variant = %variant,
                "{}",
                entry.message
            ),
            None => info!(target: CONTAINER_TARGET, image = %entry.image, "{}", entry.message),
        }
        Ok(())
    }
}

/// Feeds every entry to each inner sink in order; the first error wins.
pub struct TeeLogSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl TeeLogSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSink for TeeLogSink {
    async fn feed(&self, entry: LogEntry) -> StorageResult<()> {
        for sink in &self.sinks {
            sink.feed(entry.clone()).await?;
        }
        Ok(())
    }
}
