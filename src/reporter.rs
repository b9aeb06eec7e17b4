//! Signed metric reporting to the remote registry.
//!
//! The reporter wakes on snapshots handed over by the sampling loop. Samples
//! are never queued: the handle holds a single slot, and a snapshot arriving
//! while a report is in flight is dropped — for a liveness dashboard only the
//! freshest sample matters.
//!
//! Two destinations exist:
//! - the registry, which takes canonical-JSON records under a detached
//!   signature with HTTP basic auth `(uuid, password)`;
//! - a general-purpose server, which takes the bare record plus `satellite`
//!   and optional `hostname`, unsigned.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::Satellite;
use crate::identity::Credentials;
use crate::keyring::Keyring;
use crate::registry::{ReportEnvelope, RegistryClient};
use crate::store::{MetricStore, Snapshot};

/// Where and how reports are delivered.
pub enum ReportMode {
    /// Signed reports to the registry; suppressed until credentials exist.
    Registry {
        registry: RegistryClient,
        keyring: Arc<Keyring>,
        credentials_rx: watch::Receiver<Option<Credentials>>,
    },

    /// Unsigned reports to a general-purpose destination.
    Plain {
        url: String,
        satellite: Satellite,
        hostname: Option<String>,
    },
}

pub struct ReporterActor {
    snapshot_rx: mpsc::Receiver<Snapshot>,
    mode: ReportMode,
    store: Arc<MetricStore>,
    reauth_tx: mpsc::Sender<()>,
    client: reqwest::Client,
}

/// Handle for the sampling loop: one slot, newest-sample-wins.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<Snapshot>,
}

impl ReporterHandle {
    /// Hand a snapshot to the reporter. Returns false when a report is still
    /// in flight and the snapshot was dropped.
    pub fn submit(&self, snapshot: Snapshot) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("report in flight; dropping snapshot");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Spawn the reporter actor. Dropping every handle lets the actor finish
    /// its in-flight report and exit.
    pub fn spawn(
        mode: ReportMode,
        store: Arc<MetricStore>,
        reauth_tx: mpsc::Sender<()>,
    ) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let (tx, snapshot_rx) = mpsc::channel(1);

        let actor = ReporterActor {
            snapshot_rx,
            mode,
            store,
            reauth_tx,
            client: reqwest::Client::builder()
                .connect_timeout(crate::registry::CONNECT_TIMEOUT)
                .timeout(crate::registry::REQUEST_TIMEOUT)
                .build()?,
        };

        let task = tokio::spawn(actor.run());
        Ok((Self { tx }, task))
    }
}

impl ReporterActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting reporter actor");

        while let Some(snapshot) = self.snapshot_rx.recv().await {
            self.send(snapshot).await;
        }

        debug!("reporter actor stopped");
    }

    async fn send(&mut self, snapshot: Snapshot) {
        let Some(record) = snapshot.record.clone() else {
            return;
        };

        match &mut self.mode {
            ReportMode::Registry {
                registry,
                keyring,
                credentials_rx,
            } => {
                // Reporting stays suppressed until the registration handshake
                // has produced durable credentials.
                let Some(creds) = credentials_rx.borrow().clone() else {
                    return;
                };

                let canonical = record.canonical_json();
                let signature = match keyring.sign_b64(canonical.as_bytes()) {
                    Ok(signature) => signature,
                    Err(e) => {
                        warn!("report skipped: {e}");
                        return;
                    }
                };

                let envelope = ReportEnvelope {
                    uuid: creds.identity.uuid.clone(),
                    metrics: record,
                    signature,
                    timestamp: Utc::now().to_rfc3339(),
                };

                match registry.report(&envelope, &creds.password).await {
                    Ok(status) => {
                        self.store.set_report_status(status);
                        if status == 401 {
                            // Stale password; drop it and ask for
                            // re-registration.
                            warn!("registry rejected credentials; re-arming registration");
                            let _ = self.reauth_tx.try_send(());
                        } else if status >= 400 {
                            error!("report failed with HTTP {status}");
                        }
                    }
                    Err(e) => {
                        error!("report failed: {e}");
                    }
                }
            }

            ReportMode::Plain {
                url,
                satellite,
                hostname,
            } => {
                let mut body = serde_json::to_value(&record)
                    .unwrap_or_else(|_| serde_json::json!({}));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("satellite".to_string(), serde_json::json!(satellite));
                    if let Some(hostname) = hostname {
                        obj.insert("hostname".to_string(), serde_json::json!(hostname));
                    }
                }

                match self.client.post(url.as_str()).json(&body).send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        self.store.set_report_status(status);
                        if status >= 400 {
                            error!("report failed with HTTP {status}");
                        }
                    }
                    Err(e) => error!("report failed: {e}"),
                }
            }
        }
    }
}
