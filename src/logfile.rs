//! Append-only receiver log files.
//!
//! One file per process run, named after the start time and created lazily on
//! the first sample. Write failures are logged and never fatal: losing a log
//! line must not stop the sampling loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{error, info};

pub struct LogWriter {
    log_dir: PathBuf,
    path: Option<PathBuf>,
}

impl LogWriter {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            path: None,
        }
    }

    /// Append one rendered line. Creates the log directory and file on the
    /// first call.
    pub fn append(&mut self, line: &str) {
        if self.path.is_none() {
            match self.create_file() {
                Ok(path) => {
                    info!("Saving logs at {}", path.display());
                    self.path = Some(path);
                }
                Err(e) => {
                    error!("failed to create log file: {e}");
                    return;
                }
            }
        }

        let Some(path) = &self.path else { return };
        if let Err(e) = append_line(path, line) {
            error!("failed to write log line: {e}");
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn create_file(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.log_dir)?;
        let name = Local::now().format("%Y%m%d-%H%M%S").to_string() + ".log";
        let path = self.log_dir.join(name);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(path)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")
}

/// Parse a rendered numeric fragment back into value and unit, e.g.
/// `"-48.26dBm"` into `(-48.26, Some("dBm"))`.
pub fn parse_fragment(fragment: &str) -> Option<(f64, Option<&str>)> {
    let fragment = fragment.trim().trim_end_matches(';');
    for unit in ["dBm", "dB", "%"] {
        if let Some(value) = fragment.strip_suffix(unit) {
            return value.parse().ok().map(|v| (v, Some(unit)));
        }
    }
    fragment.parse().ok().map(|v| (v, None))
}
