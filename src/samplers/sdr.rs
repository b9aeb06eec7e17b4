//! Software-defined receiver adapter.
//!
//! The demodulation graph writes newline-delimited status pairs into a local
//! pipe, one `KEY=VALUE` per line (`FRAMELOCK=1`, `MER=7.4`, `SS=-42.1`,
//! `VBER=0.002`). The adapter accumulates pairs until the set required for
//! the current lock state is complete, emits one record, and resets. A lock
//! drop clears every cached metric immediately.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;

use super::{finite, SampleError, SampleResult};
use crate::MetricRecord;

#[derive(Debug, Default)]
struct PendingMetrics {
    lock: Option<bool>,
    level: Option<f64>,
    snr: Option<f64>,
    ber: Option<f64>,
}

impl PendingMetrics {
    /// A record is complete when the lock state is known and, if locked,
    /// every pipe metric has arrived.
    fn complete(&self) -> bool {
        match self.lock {
            Some(true) => {
                self.level.is_some() && self.snr.is_some() && self.ber.is_some()
            }
            Some(false) => true,
            None => false,
        }
    }

    fn take(&mut self) -> MetricRecord {
        let record = if self.lock == Some(true) {
            MetricRecord {
                level: self.level,
                snr: self.snr,
                ber: self.ber,
                ..MetricRecord::locked()
            }
        } else {
            MetricRecord::unlocked()
        };

        // Reset the metric cache but remember the lock state; the graph only
        // prints FRAMELOCK on transitions and at its own cadence.
        let lock = self.lock;
        *self = Self::default();
        self.lock = lock;

        record
    }
}

pub struct SdrSampler {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    pending: PendingMetrics,
}

impl SdrSampler {
    /// Open the status pipe written by the demodulation graph.
    pub async fn open(pipe: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::File::open(pipe)
            .await
            .map_err(|e| anyhow::anyhow!("could not open status pipe {}: {e}", pipe.display()))?;
        Ok(Self::from_reader(Box::new(file)))
    }

    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            pending: PendingMetrics::default(),
        }
    }

    pub async fn sample(&mut self) -> SampleResult {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| SampleError::SourceClosed(format!("status pipe: {e}")))?
                .ok_or_else(|| SampleError::SourceClosed("status pipe closed".to_string()))?;

            let Some((key, value)) = line.trim().split_once('=') else {
                debug!("ignoring status line without key: {line}");
                continue;
            };

            match key {
                "FRAMELOCK" => {
                    let locked = value == "1";
                    if !locked {
                        // Stale metrics from the locked period must not leak
                        // into an unlocked record.
                        self.pending = PendingMetrics::default();
                    }
                    self.pending.lock = Some(locked);
                }
                "SS" => self.pending.level = value.parse().ok().and_then(finite),
                "MER" => self.pending.snr = value.parse().ok().and_then(finite),
                "VBER" => self.pending.ber = value.parse().ok().and_then(finite),
                _ => debug!("ignoring unknown status key {key}"),
            }

            if self.pending.complete() {
                return Ok(self.pending.take());
            }
        }
    }
}
