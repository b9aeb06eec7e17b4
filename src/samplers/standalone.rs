//! Standalone demodulator adapter.
//!
//! Network-attached receivers expose their status over SNMP. Each tick issues
//! one batched get for the five status objects and maps the answers into a
//! record. The net-snmp `snmpget` tool does the protocol work, the same way
//! the USB adapter leans on its external zap tool.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{finite, SampleError, SampleResult};
use crate::MetricRecord;

/// Status object IDs, queried in one batched get. Order matters: answers are
/// mapped back by position.
const OID_LOCK: &str = "1.3.6.1.4.1.37576.2.1.1.1.0";
const OID_LEVEL: &str = "1.3.6.1.4.1.37576.2.1.1.2.0";
const OID_SNR: &str = "1.3.6.1.4.1.37576.2.1.1.3.0";
const OID_PKT_ERR: &str = "1.3.6.1.4.1.37576.2.1.1.4.0";
const OID_BER: &str = "1.3.6.1.4.1.37576.2.1.1.5.0";

const OIDS: [&str; 5] = [OID_LOCK, OID_LEVEL, OID_SNR, OID_PKT_ERR, OID_BER];

pub struct StandaloneSampler {
    address: String,
    community: String,
    timeout: Duration,

    /// Below-floor flags, one per metric that can hit the measurement floor.
    /// Used to warn once per transition instead of once per tick.
    level_below_floor: bool,
    snr_below_floor: bool,
}

impl StandaloneSampler {
    pub fn new(address: String, community: String, timeout: Duration) -> Self {
        Self {
            address,
            community,
            timeout,
            level_below_floor: false,
            snr_below_floor: false,
        }
    }

    pub async fn sample(&mut self) -> SampleResult {
        let output = Command::new("snmpget")
            .arg("-v2c")
            .arg("-c")
            .arg(&self.community)
            .arg("-t")
            .arg(self.timeout.as_secs().to_string())
            .arg("-r")
            .arg("0")
            .arg("-Oqv")
            .arg(&self.address)
            .args(OIDS)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // The tool enforces its own timeout; the outer bound only catches a
        // wedged process.
        let output = tokio::time::timeout(self.timeout + Duration::from_secs(2), output)
            .await
            .map_err(|_| SampleError::ReceiverUnreachable("snmpget did not return".to_string()))?
            .map_err(|e| SampleError::ReceiverUnreachable(format!("snmpget: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SampleError::ReceiverUnreachable(
                stderr.trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let values: Vec<String> = stdout
            .lines()
            .map(|line| line.trim().trim_matches('"').to_string())
            .collect();

        if values.len() != OIDS.len() {
            return Err(SampleError::ReceiverMalformed(format!(
                "expected {} values, got {}",
                OIDS.len(),
                values.len()
            )));
        }

        self.build_record(&values)
    }

    /// Map the five raw answers into a record.
    ///
    /// Values answered as `"< N"` are present but below the measurement
    /// floor; they are omitted with a warning on the transition. An empty
    /// dependent value while the lock object says locked means the device
    /// unlocked mid-response, so the whole record is downgraded.
    fn build_record(&mut self, values: &[String]) -> SampleResult {
        let lock = match values[0].as_str() {
            "locked" | "1" => true,
            "unlocked" | "0" => false,
            other => {
                return Err(SampleError::ReceiverMalformed(format!(
                    "unexpected lock status {other:?}"
                )))
            }
        };

        if !lock {
            return Ok(MetricRecord::unlocked());
        }

        if values[1..].iter().any(|v| v.is_empty()) {
            debug!("device unlocked mid-response; downgrading record");
            return Ok(MetricRecord::unlocked());
        }

        let mut record = MetricRecord::locked();

        record.level = parse_floored(
            &values[1],
            "signal level",
            &mut self.level_below_floor,
        )?
        .and_then(finite);
        record.snr = parse_floored(&values[2], "C/N", &mut self.snr_below_floor)?
            .and_then(finite);
        record.pkt_err = Some(values[3].parse::<u64>().map_err(|_| {
            SampleError::ReceiverMalformed(format!("bad packet error count {:?}", values[3]))
        })?);
        record.ber = finite(values[4].parse::<f64>().map_err(|_| {
            SampleError::ReceiverMalformed(format!("bad BER {:?}", values[4]))
        })?);

        Ok(record)
    }
}

/// Parse a numeric answer that may be a below-floor sentinel such as `"< 70"`.
fn parse_floored(
    raw: &str,
    what: &str,
    below_floor: &mut bool,
) -> Result<Option<f64>, SampleError> {
    if raw.starts_with('<') {
        if !*below_floor {
            warn!("{what} is below the measurement floor ({raw})");
            *below_floor = true;
        }
        return Ok(None);
    }

    let value = raw.parse::<f64>().map_err(|_| {
        SampleError::ReceiverMalformed(format!("bad {what} value {raw:?}"))
    })?;
    *below_floor = false;
    Ok(Some(value))
}
