pub mod config;
pub mod identity;
pub mod inbox;
pub mod keyring;
pub mod logfile;
pub mod monitor;
pub mod reader;
pub mod registrar;
pub mod registry;
pub mod reporter;
pub mod samplers;
pub mod store;

use serde::{Deserialize, Serialize};

/// Uniform per-tick output of every sampler adapter.
///
/// All metrics besides `lock` are only meaningful while the demodulator is
/// locked. Units are fixed per field: `level` in dBm, `snr` in dB, `ber` and
/// `fer` as ratios in [0, 1), `quality` in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// DVB-S2 frame lock.
    pub lock: bool,

    /// Signal level in dBm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,

    /// Signal-to-noise ratio in dB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,

    /// Bit error ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ber: Option<f64>,

    /// Frame/packet error ratio.
    #[serde(skip_serializing_if = "Option::is_none", alias = "per")]
    pub fer: Option<f64>,

    /// Signal quality in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,

    /// Cumulative packet error count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkt_err: Option<u64>,
}

impl MetricRecord {
    /// A record for an unlocked demodulator, carrying no other metrics.
    pub fn unlocked() -> Self {
        Self {
            lock: false,
            level: None,
            snr: None,
            ber: None,
            fer: None,
            quality: None,
            pkt_err: None,
        }
    }

    /// A locked record with every metric initially absent.
    pub fn locked() -> Self {
        Self {
            lock: true,
            ..Self::unlocked()
        }
    }

    /// Drop non-finite values and enforce the lock invariant: an unlocked
    /// record carries nothing but `lock`.
    pub fn sanitized(mut self) -> Self {
        if !self.lock {
            return Self::unlocked();
        }
        for field in [
            &mut self.level,
            &mut self.snr,
            &mut self.ber,
            &mut self.fer,
            &mut self.quality,
        ] {
            if field.is_some_and(|v| !v.is_finite()) {
                *field = None;
            }
        }
        self
    }

    /// Canonical serialization: JSON with sorted keys, no whitespace, absent
    /// fields omitted. Byte-identical across calls for the same record.
    pub fn canonical_json(&self) -> String {
        // serde_json::Value objects are BTreeMap-backed, so key order is
        // sorted regardless of struct field order.
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        value.to_string()
    }
}
