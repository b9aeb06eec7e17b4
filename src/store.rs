//! Latest-sample store shared between the sampling loop and its readers.
//!
//! The orchestrator is the single writer; the HTTP reader, log writer, and
//! reporter all consume immutable snapshots. Publication swaps the whole
//! snapshot through a watch channel, so readers never observe a half-updated
//! record.

use chrono::{DateTime, Local, Utc};
use tokio::sync::watch;

use crate::MetricRecord;

/// One published sample plus the reporting status surface.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Latest record; `None` until the first sample arrives.
    pub record: Option<MetricRecord>,

    /// When the record was published.
    pub timestamp: DateTime<Utc>,

    /// HTTP status of the most recent report attempt.
    pub report_status: Option<u16>,

    /// Render timestamps in UTC rather than local time.
    pub utc: bool,
}

/// Fixed display order, labels, and units of the rendered view.
const RENDER_FIELDS: &[(&str, &str)] = &[
    ("lock", "Lock"),
    ("level", "Level"),
    ("snr", "SNR"),
    ("ber", "BER"),
    ("fer", "FER"),
    ("quality", "Signal Quality"),
    ("pkt_err", "Packet Errors"),
];

impl Snapshot {
    fn empty(utc: bool) -> Self {
        Self {
            record: None,
            timestamp: Utc::now(),
            report_status: None,
            utc,
        }
    }

    /// Canonical single-line rendering, e.g.
    /// `2024-03-01 10:22:05  Lock = True; Level = -48.26dBm; SNR = 9.52dB;`.
    ///
    /// Fields appear in fixed order, absent fields are omitted, and the unit
    /// suffix is attached directly to finite values.
    pub fn render(&self) -> String {
        let ts = if self.utc {
            self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
        } else {
            self.timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        };

        let mut line = format!("{ts} ");

        let Some(record) = &self.record else {
            return line;
        };

        for (key, label) in RENDER_FIELDS {
            if let Some(fragment) = render_field(record, key) {
                line.push_str(&format!(" {label} = {fragment};"));
            }
        }

        line
    }

    /// Typed view: one JSON key per present field, plus the report status
    /// when one has been observed.
    pub fn typed_view(&self) -> serde_json::Value {
        let mut value = match &self.record {
            Some(record) => {
                serde_json::to_value(record).unwrap_or_else(|_| serde_json::json!({}))
            }
            None => serde_json::json!({}),
        };

        if let (Some(status), Some(obj)) = (self.report_status, value.as_object_mut()) {
            obj.insert("report_status".to_string(), status.into());
        }

        value
    }
}

fn render_field(record: &MetricRecord, key: &str) -> Option<String> {
    match key {
        "lock" => Some(if record.lock { "True" } else { "False" }.to_string()),
        "level" => record.level.map(|v| format!("{v:.2}dBm")),
        "snr" => record.snr.map(|v| format!("{v:.2}dB")),
        "ber" => record.ber.map(|v| format!("{v:.2e}")),
        "fer" => record.fer.map(|v| format!("{v:.2e}")),
        "quality" => record.quality.map(|v| format!("{v:.1}%")),
        "pkt_err" => record.pkt_err.map(|v| v.to_string()),
        _ => None,
    }
}

/// Single-writer handle over the snapshot channel.
#[derive(Debug)]
pub struct MetricStore {
    tx: watch::Sender<Snapshot>,
    utc: bool,
}

impl MetricStore {
    pub fn new(utc: bool) -> Self {
        let (tx, _rx) = watch::channel(Snapshot::empty(utc));
        Self { tx, utc }
    }

    /// Subscribe a reader. Each reader sees every publication in order and
    /// always a fully-formed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Publish a fresh record. Last-writer-wins; the report status carries
    /// over from the previous snapshot.
    pub fn publish(&self, record: MetricRecord) {
        let record = record.sanitized();
        self.tx.send_modify(|snap| {
            snap.record = Some(record);
            snap.timestamp = Utc::now();
            snap.utc = self.utc;
        });
    }

    /// Record the HTTP status of the latest report attempt.
    pub fn set_report_status(&self, status: u16) {
        self.tx.send_modify(|snap| {
            snap.report_status = Some(status);
        });
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }
}
