//! USB DVB adapter, driven through an external zap tool.
//!
//! The tuning binary (`dvbv5-zap`) keeps the frontend tuned and prints a
//! status line to stderr about once per second. The adapter launches it with
//! a forced C locale so the output grammar is stable, then turns the stderr
//! stream into records. The zap process exiting is fatal: without it there is
//! no tuner.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{finite, SampleError, SampleResult};
use crate::MetricRecord;

/// Bypass the driver probe, e.g. inside containers where /dev/dvb is bind
/// mounted late.
pub const NO_DRIVERS_CHECK_ENV: &str = "BLOCKSAT_NO_USB_DRIVERS_CHECK";

pub struct UsbSampler {
    // Held to keep the subprocess alive; killed on drop.
    _child: Option<Child>,
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl UsbSampler {
    /// Probe the DVB adapter and launch the zap subprocess.
    pub fn launch(adapter: u32, frontend: u32, channel_conf: &Path) -> anyhow::Result<Self> {
        check_drivers(adapter)?;

        let mut child = Command::new("dvbv5-zap")
            .arg("-c")
            .arg(channel_conf)
            .arg("-a")
            .arg(adapter.to_string())
            .arg("-f")
            .arg(frontend.to_string())
            .arg("-r")
            .arg("-P")
            .arg("ch")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to launch dvbv5-zap: {e}"))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stderr handle for dvbv5-zap"))?;

        info!("dvbv5-zap launched on adapter {adapter}, frontend {frontend}");

        Ok(Self {
            _child: Some(child),
            lines: BufReader::new(Box::new(stderr) as Box<dyn AsyncRead + Send + Unpin>).lines(),
        })
    }

    /// Adapter over an arbitrary line stream, for tests.
    #[cfg(test)]
    fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            _child: None,
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Read stderr until the next status line yields a record.
    pub async fn sample(&mut self) -> SampleResult {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| SampleError::SourceClosed(format!("zap stderr: {e}")))?
                .ok_or_else(|| SampleError::SourceClosed("dvbv5-zap exited".to_string()))?;

            if let Some(record) = parse_zap_line(&line) {
                return Ok(record);
            }
            debug!("ignoring zap line: {line}");
        }
    }
}

fn check_drivers(adapter: u32) -> anyhow::Result<()> {
    if std::env::var_os(NO_DRIVERS_CHECK_ENV).is_some() {
        return Ok(());
    }

    let dev = format!("/dev/dvb/adapter{adapter}");
    if !Path::new(&dev).exists() {
        anyhow::bail!(
            "DVB adapter {dev} not found; are the drivers loaded? \
             (set {NO_DRIVERS_CHECK_ENV} to skip this check)"
        );
    }
    Ok(())
}

/// Parse one zap status line into a record.
///
/// Only lines carrying a `Signal` key count; `Layer A:` per-layer breakdowns
/// are skipped. Values embed their unit (`%`, `dB`, `dBm`), may use comma
/// decimal separators, and may print exponents as `x10^`.
pub fn parse_zap_line(line: &str) -> Option<MetricRecord> {
    if line.contains("Layer") || !line.contains("Signal") {
        return None;
    }

    let lock = line.contains("Lock");
    if !lock {
        return Some(MetricRecord::unlocked());
    }

    // Keys print as "name= value"; C/N carries a slash.
    static KEY_VALUE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"([A-Za-z/]+)=\s*(\S+)").expect("valid regex"));

    let mut record = MetricRecord::locked();

    for captures in KEY_VALUE.captures_iter(line) {
        let key = &captures[1];
        let raw = &captures[2];

        let Some((value, unit)) = parse_value(raw) else {
            continue;
        };

        match (key, unit) {
            ("Signal", Some("%")) => record.quality = finite(value),
            ("Signal", _) => record.level = finite(value),
            ("C/N", _) => record.snr = finite(value),
            ("postBER", _) => record.ber = finite(value),
            ("PER", _) => record.fer = finite(value),
            _ => {}
        }
    }

    Some(record)
}

/// Split a raw token into number and unit suffix.
fn parse_value(raw: &str) -> Option<(f64, Option<&'static str>)> {
    let normalized = raw.replace("x10^", "e").replace(',', ".");

    if let Some(number) = normalized.strip_suffix('%') {
        return number.parse().ok().map(|v| (v, Some("%")));
    }
    if let Some(number) = normalized.strip_suffix("dBm") {
        return number.parse().ok().map(|v| (v, Some("dBm")));
    }
    if let Some(number) = normalized.strip_suffix("dB") {
        return number.parse().ok().map(|v| (v, Some("dB")));
    }
    normalized.parse().ok().map(|v| (v, None))
}
