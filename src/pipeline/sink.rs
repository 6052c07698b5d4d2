use crate::error::{PipelineError, PipelineResult};
use crate::io::{BundleReceiver, Popped};
use crate::series::TimeSeriesRecord;
use crate::storage::StorageWriter;
use crate::utils::{CancelToken, CountingGate};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const IDLE_TICK: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub name: String,
    pub groups: usize,
    pub records: usize,
}

/// Drains every channel of its receiver and hands each channel's records to
/// storage once that channel reaches end of stream.
///
/// Channels are visited round-robin with non-blocking pops, so one slow or
/// short channel never holds back a bounded producer on another.
pub struct Sink {
    name: String,
    inputs: BundleReceiver<TimeSeriesRecord>,
    storage: Box<dyn StorageWriter>,
    flush_gate: Option<Arc<CountingGate>>,
    cancel: CancelToken,
}

impl Sink {
    pub fn new(
        name: impl Into<String>,
        inputs: BundleReceiver<TimeSeriesRecord>,
        storage: Box<dyn StorageWriter>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            storage,
            flush_gate: None,
            cancel,
        }
    }

    /// Limits concurrent storage writes across sinks sharing `gate`.
    pub fn with_flush_gate(mut self, gate: Arc<CountingGate>) -> Self {
        self.flush_gate = Some(gate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(mut self) -> PipelineResult<SinkReport> {
        let guard = self.cancel.guard(format!("sink {}", self.name));
        let res = match self.drain() {
            Ok((groups, records)) => {
                tracing::info!(
                    "[Sink] {}: {} groups, {} records stored",
                    self.name,
                    groups,
                    records
                );
                Ok(SinkReport {
                    name: self.name,
                    groups,
                    records,
                })
            }
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("[Sink] {} failed: {}", self.name, e);
                    self.cancel
                        .cancel_because(format!("sink {} failed: {e}", self.name));
                }
                Err(e)
            }
        };
        guard.disarm();
        res
    }

    fn drain(&mut self) -> PipelineResult<(usize, usize)> {
        let mut open: Vec<String> = self.inputs.channels().map(str::to_string).collect();
        let mut buffers: BTreeMap<String, Vec<TimeSeriesRecord>> = BTreeMap::new();
        let (mut groups, mut records) = (0, 0);
        let mut idle_since = Instant::now();

        while !open.is_empty() {
            let mut progressed = false;
            let mut i = 0;
            while i < open.len() {
                match self.inputs.try_pop(&open[i])? {
                    Some(Popped::Record(r)) => {
                        buffers.entry(open[i].clone()).or_default().push(r);
                        progressed = true;
                        i += 1;
                    }
                    Some(Popped::EndOfStream) => {
                        let channel = open.remove(i);
                        let rows = buffers.remove(&channel).unwrap_or_default();
                        self.flush(&channel, &rows)?;
                        groups += 1;
                        records += rows.len();
                        progressed = true;
                    }
                    None => i += 1,
                }
            }

            if progressed {
                idle_since = Instant::now();
                continue;
            }
            if let Some(limit) = self.inputs.stall_timeout()
                && idle_since.elapsed() >= limit
            {
                return Err(PipelineError::Stalled {
                    bundle: self.inputs.bundle_name().to_string(),
                    channel: open.join(","),
                    waited: idle_since.elapsed(),
                });
            }
            thread::sleep(IDLE_TICK);
        }
        Ok((groups, records))
    }

    fn flush(&mut self, group: &str, rows: &[TimeSeriesRecord]) -> PipelineResult<()> {
        let _permit = self.flush_gate.as_deref().map(CountingGate::permit);
        tracing::debug!("[Sink] {} flushing {} ({} rows)", self.name, group, rows.len());
        self.storage
            .write(group, rows)
            .map_err(PipelineError::Storage)
    }

    pub fn spawn(self) -> PipelineResult<JoinHandle<PipelineResult<SinkReport>>> {
        let handle = thread::Builder::new()
            .name(format!("nms-sink-{}", self.name))
            .spawn(move || self.run())?;
        Ok(handle)
    }
}
