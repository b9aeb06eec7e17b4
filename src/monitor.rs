//! Monitor orchestrator.
//!
//! Owns the periodic sampling loop and fans each record out to the metric
//! store, the log writer, the console, and the reporter. The registrar runs
//! concurrently; until it produces durable credentials the reporter stays
//! suppressed. A shutdown signal stops the loop at the next tick boundary,
//! after which in-flight HTTP work gets a bounded grace period.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MonitorContext, MonitorOptions, ReportOptions};
use crate::identity::{self, Credentials};
use crate::inbox::SpoolInbox;
use crate::keyring::Keyring;
use crate::logfile::LogWriter;
use crate::registrar::{Registrar, RegistrationError, RegistrationState};
use crate::registry::RegistryClient;
use crate::reporter::{ReportMode, ReporterHandle};
use crate::samplers::Sampler;
use crate::store::MetricStore;
use crate::MetricRecord;

/// Consecutive failed ticks before the loop degrades to publishing
/// `lock = false` records.
const UNREACHABLE_TICKS: u32 = 3;

/// Grace period for in-flight HTTP work on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Result type alias for a monitor run
pub type MonitorResult = Result<(), MonitorError>;

/// Terminal monitor outcomes
#[derive(Debug)]
pub enum MonitorError {
    /// The registration handshake failed; reporting cannot proceed
    RegistrationFailed(RegistrationError),

    /// The metric source is gone or another unrecoverable fault occurred
    Fatal(anyhow::Error),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::RegistrationFailed(e) => write!(f, "registration failed: {}", e),
            MonitorError::Fatal(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for MonitorError {}

impl MonitorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::RegistrationFailed(_) => 2,
            MonitorError::Fatal(_) => 1,
        }
    }
}

/// Reporting wiring, present only with `--report`.
struct Reporting {
    reporter: ReporterHandle,
    reporter_task: tokio::task::JoinHandle<()>,
    registrar_state: Option<watch::Receiver<RegistrationState>>,

    /// Publishes credentials to the reporter; `None` for plain destinations.
    credentials_tx: Option<watch::Sender<Option<Credentials>>>,

    /// Kept for re-arming the registrar after a 401.
    keyring: Option<Arc<Keyring>>,
    registration_done_tx: mpsc::Sender<Result<Credentials, RegistrationError>>,
}

impl Reporting {
    fn registration_running(&self) -> bool {
        self.registrar_state
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_running())
    }
}

/// Run the monitor until shutdown or a terminal error.
#[instrument(skip_all, fields(satellite = %ctx.config.satellite))]
pub async fn run(
    ctx: MonitorContext,
    mut sampler: Sampler,
    keyring: Option<Arc<Keyring>>,
    shutdown_rx: watch::Receiver<bool>,
) -> MonitorResult {
    let options = ctx.options.clone();
    let store = Arc::new(MetricStore::new(options.utc));

    if options.server {
        crate::reader::spawn_status_server(options.port, store.subscribe(), shutdown_rx.clone())
            .await
            .map_err(MonitorError::Fatal)?;
    }

    let mut log_writer = options.log_file.then(|| LogWriter::new(ctx.log_dir()));

    // First-lock signal gating the registration handshake.
    let (lock_tx, lock_rx) = watch::channel(false);

    // These stay silent when reporting is disabled.
    let (reauth_tx, mut reauth_rx) = mpsc::channel::<()>(1);
    let (registration_done_tx, mut registration_rx) =
        mpsc::channel::<Result<Credentials, RegistrationError>>(1);

    let mut reporting = match &options.report {
        Some(report_opts) => Some(
            setup_reporting(
                &ctx,
                report_opts,
                keyring,
                store.clone(),
                lock_rx,
                shutdown_rx.clone(),
                reauth_tx.clone(),
                registration_done_tx.clone(),
            )
            .await
            .map_err(MonitorError::Fatal)?,
        ),
        None => None,
    };

    let mut ticker = tokio::time::interval(options.log_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut consecutive_failures = 0u32;
    let result = loop {
        // Separate receivers for the concurrent `wait_for` call sites so the
        // shared `shutdown_rx` is never mutably borrowed twice at once.
        let mut shutdown_main = shutdown_rx.clone();
        let mut shutdown_tick = shutdown_rx.clone();
        tokio::select! {
            _ = ticker.tick() => {
                // The USB and SDR sources can legitimately stay silent for a
                // while; shutdown must still win over a blocked read.
                let sample = tokio::select! {
                    sample = sampler.sample() => sample,
                    _ = async { shutdown_tick.wait_for(|stop| *stop).await.map(|_| ()) } => break Ok(()),
                };
                match sample {
                    Ok(record) => {
                        consecutive_failures = 0;
                        publish(record, &store, &lock_tx, &mut log_writer, &options, &reporting);
                    }
                    Err(e) if e.is_fatal() => {
                        error!("{e}");
                        break Err(MonitorError::Fatal(anyhow::anyhow!("{e}")));
                    }
                    Err(e) => {
                        warn!("sample failed: {e}");
                        consecutive_failures += 1;
                        if consecutive_failures >= UNREACHABLE_TICKS {
                            publish(
                                MetricRecord::unlocked(),
                                &store,
                                &lock_tx,
                                &mut log_writer,
                                &options,
                                &reporting,
                            );
                        }
                    }
                }
            }

            res = async { shutdown_main.wait_for(|stop| *stop).await.map(|_| ()) } => {
                if res.is_ok() {
                    info!("shutdown requested; stopping at tick boundary");
                }
                break Ok(());
            }

            Some(outcome) = registration_rx.recv() => {
                match outcome {
                    Ok(credentials) => {
                        if let Some(tx) =
                            reporting.as_ref().and_then(|r| r.credentials_tx.as_ref())
                        {
                            let _ = tx.send(Some(credentials));
                        }
                    }
                    Err(e) => {
                        // Never silently restart the handshake; the user may
                        // have mis-pointed the antenna.
                        break Err(MonitorError::RegistrationFailed(e));
                    }
                }
            }

            Some(()) = reauth_rx.recv() => {
                if let Some(r) = reporting.as_mut() {
                    if r.registration_running() {
                        continue;
                    }
                    warn!("credentials rejected; clearing password and re-registering");
                    if let Some(tx) = &r.credentials_tx {
                        let _ = tx.send(None);
                    }
                    if let Err(e) =
                        arm_registrar(&ctx, r, lock_tx.subscribe(), shutdown_rx.clone())
                    {
                        error!("could not re-arm registration: {e:#}");
                    }
                }
            }
        }
    };

    // Let in-flight reports finish within the grace period.
    if let Some(r) = reporting {
        drop(r.reporter);
        if tokio::time::timeout(SHUTDOWN_GRACE, r.reporter_task)
            .await
            .is_err()
        {
            warn!("reporter did not drain within the grace period; abandoning");
        }
    }

    result
}

fn publish(
    record: MetricRecord,
    store: &MetricStore,
    lock_tx: &watch::Sender<bool>,
    log_writer: &mut Option<LogWriter>,
    options: &MonitorOptions,
    reporting: &Option<Reporting>,
) {
    if record.lock {
        // send_if_modified keeps lock waiters from waking on every tick.
        lock_tx.send_if_modified(|locked| {
            let changed = !*locked;
            *locked = true;
            changed
        });
    }

    store.publish(record);
    let snapshot = store.snapshot();
    let line = snapshot.render();

    if let Some(writer) = log_writer {
        writer.append(&line);
    }

    // Mute the console while registration logs are flowing; the log file
    // keeps recording throughout.
    let registration_running = reporting
        .as_ref()
        .is_some_and(|r| r.registration_running());

    if options.echo && !registration_running {
        if options.scrolling {
            println!("{line}");
        } else {
            print!("\x1b[K{line}\r");
            let _ = std::io::stdout().flush();
        }
    }

    if let Some(r) = reporting {
        r.reporter.submit(snapshot);
    }
}

#[allow(clippy::too_many_arguments)]
async fn setup_reporting(
    ctx: &MonitorContext,
    report_opts: &ReportOptions,
    keyring: Option<Arc<Keyring>>,
    store: Arc<MetricStore>,
    lock_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reauth_tx: mpsc::Sender<()>,
    registration_done_tx: mpsc::Sender<Result<Credentials, RegistrationError>>,
) -> anyhow::Result<Reporting> {
    if report_opts.registry {
        let keyring = keyring
            .ok_or_else(|| anyhow::anyhow!("reporting to the registry requires the keyring"))?;

        let (credentials_tx, credentials_rx) = watch::channel(None);

        let (reporter, reporter_task) = ReporterHandle::spawn(
            ReportMode::Registry {
                registry: RegistryClient::new(&report_opts.dest)?,
                keyring: keyring.clone(),
                credentials_rx,
            },
            store,
            reauth_tx,
        )?;

        let mut reporting = Reporting {
            reporter,
            reporter_task,
            registrar_state: None,
            credentials_tx: Some(credentials_tx),
            keyring: Some(keyring),
            registration_done_tx,
        };

        match identity::load(&ctx.cfg_dir)? {
            Some(credentials) => {
                info!(
                    "receiver already registered as {}",
                    credentials.identity.uuid
                );
                if let Some(tx) = &reporting.credentials_tx {
                    let _ = tx.send(Some(credentials));
                }
            }
            None => {
                info!("no durable identity; starting the registration handshake");
                arm_registrar(ctx, &mut reporting, lock_rx, shutdown_rx)?;
            }
        }

        Ok(reporting)
    } else {
        info!("Reporting Rx status to {}", report_opts.dest);

        // A custom destination gets one upfront health probe.
        let probe = RegistryClient::new(&report_opts.dest)?;
        match probe.check_info().await {
            Ok(true) => debug!("report destination validated"),
            Ok(false) => warn!("report destination does not expose a valid info document"),
            Err(e) => warn!("could not validate report destination: {e}"),
        }

        let (reporter, reporter_task) = ReporterHandle::spawn(
            ReportMode::Plain {
                url: format!("{}/report", report_opts.dest.trim_end_matches('/')),
                satellite: ctx.config.satellite,
                hostname: report_opts.hostname.clone(),
            },
            store,
            reauth_tx,
        )?;

        Ok(Reporting {
            reporter,
            reporter_task,
            registrar_state: None,
            credentials_tx: None,
            keyring: None,
            registration_done_tx,
        })
    }
}

/// Spawn (or re-spawn) the registration handshake and forward its outcome to
/// the main loop.
fn arm_registrar(
    ctx: &MonitorContext,
    reporting: &mut Reporting,
    lock_rx: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let keyring = reporting
        .keyring
        .clone()
        .ok_or_else(|| anyhow::anyhow!("registration requires the keyring"))?;
    let report_opts = ctx
        .options
        .report
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("registration without reporting options"))?;

    let (registrar, state_rx) = Registrar::new(
        ctx.cfg_dir.clone(),
        ctx.config.satellite,
        report_opts.hostname.clone().unwrap_or_default(),
        RegistryClient::new(&report_opts.dest)?,
        keyring,
        Box::new(SpoolInbox::new(ctx.inbox_dir())),
    );

    reporting.registrar_state = Some(state_rx);

    let handle = registrar.spawn(lock_rx, shutdown);
    let done_tx = reporting.registration_done_tx.clone();
    tokio::spawn(async move {
        let outcome = match handle.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RegistrationError::Transport(format!(
                "registrar task died: {e}"
            ))),
        };
        let _ = done_tx.send(outcome).await;
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReceiverConfig, Satellite};
    use crate::samplers::{SatIpSampler, SdrSampler};

    fn test_ctx(dir: &std::path::Path, options: MonitorOptions) -> MonitorContext {
        MonitorContext::new(
            dir.to_path_buf(),
            Config {
                satellite: Satellite::Galaxy18,
                receiver: ReceiverConfig::Sdr {
                    pipe: dir.join("pipe"),
                },
                lnb: None,
                interface: None,
            },
            options,
        )
    }

    #[tokio::test]
    async fn test_sdr_records_reach_store_and_logfile() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let options = MonitorOptions {
            log_file: true,
            echo: false,
            log_interval: Duration::from_millis(10),
            ..MonitorOptions::default()
        };
        let ctx = test_ctx(dir.path(), options);

        // A duplex stream keeps the pipe open after the scripted lines.
        let (mut graph_end, sampler_end) = tokio::io::duplex(1024);
        graph_end
            .write_all(b"FRAMELOCK=1\nSS=-42.1\nMER=7.4\nVBER=0.002\nFRAMELOCK=0\n")
            .await
            .unwrap();
        let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(sampler_end)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(ctx, sampler, None, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        drop(graph_end);

        let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(logs[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("Lock = True; Level = -42.10dBm; SNR = 7.40dB;"));
        assert!(content.contains("Lock = False;"));
    }

    #[tokio::test]
    async fn test_consecutive_failures_degrade_to_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let options = MonitorOptions {
            log_file: true,
            echo: false,
            log_interval: Duration::from_millis(10),
            ..MonitorOptions::default()
        };
        let ctx = test_ctx(dir.path(), options);

        // Nothing listens on port 1: every tick fails as unreachable.
        let sampler = Sampler::SatIp(
            SatIpSampler::new("127.0.0.1", 1, "admin".to_string(), "admin".to_string())
                .unwrap(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(ctx, sampler, None, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .collect();
        let content = std::fs::read_to_string(logs[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("Lock = False;"));
    }

    #[tokio::test]
    async fn test_source_closed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let options = MonitorOptions {
            echo: false,
            log_interval: Duration::from_millis(10),
            ..MonitorOptions::default()
        };
        let ctx = test_ctx(dir.path(), options);

        let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(std::io::Cursor::new(
            Vec::new(),
        ))));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = run(ctx, sampler, None, shutdown_rx).await;

        match result {
            Err(MonitorError::Fatal(_)) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
