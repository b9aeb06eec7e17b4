//! One-time registration handshake over the satellite channel.
//!
//! The registry cannot reach the receiver directly: the downlink is one-way,
//! broadcast, and shared. Enrollment therefore couples a conventional HTTPS
//! request with an out-of-band verification code transmitted over the very
//! satellite the receiver claims to demodulate. Decrypting the broadcast
//! proves possession of the downlink; signing the code proves possession of
//! the long-term key.
//!
//! ## State machine
//!
//! ```text
//! IDLE -> ENROLLING -> AWAITING_CODE -> VERIFYING -> PERSISTING -> REGISTERED
//!                 \________________________________________/
//!                            any failure -> FAILED
//! ```
//!
//! The pending state (uuid, nonce, expected code) is deliberately never
//! persisted: a process restart re-enrolls from scratch.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::Satellite;
use crate::identity::{self, Credentials, ReceiverIdentity};
use crate::inbox::Inbox;
use crate::keyring::Keyring;
use crate::registry::{RegisterRequest, RegistryClient, RegistryError};

/// How long AWAITING_CODE may last before the handshake fails.
pub const CODE_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Inbox poll period while awaiting the code.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

const MAX_ATTEMPTS: u32 = 3;

/// Observable progress of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    Enrolling,
    AwaitingCode,
    Verifying,
    Persisting,
    Registered,
    Failed,
}

impl RegistrationState {
    /// True while the handshake is underway (console echo is muted so the
    /// registration logs stay visible).
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            RegistrationState::Idle | RegistrationState::Registered | RegistrationState::Failed
        )
    }
}

/// Result type alias for registration operations
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Failure taxonomy of the handshake
#[derive(Debug)]
pub enum RegistrationError {
    /// Transport failure that exhausted its retries
    Transport(String),

    /// The registry rejected the request; terminal with detail
    ServerRejected { status: u16, detail: String },

    /// The keyring has not been unlocked
    KeyringLocked,

    /// No matching code arrived within the deadline
    Timeout,

    /// Shutdown was requested mid-handshake
    Aborted,

    /// Local persistence of the identity failed
    Persist(String),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::Transport(msg) => {
                write!(f, "registration transport failure: {}", msg)
            }
            RegistrationError::ServerRejected { status, detail } => {
                write!(f, "registration rejected ({}): {}", status, detail)
            }
            RegistrationError::KeyringLocked => write!(f, "keyring is locked"),
            RegistrationError::Timeout => write!(
                f,
                "no verification code received within the deadline; check the \
                 antenna pointing and relaunch to try again"
            ),
            RegistrationError::Aborted => write!(f, "registration aborted"),
            RegistrationError::Persist(msg) => write!(f, "could not persist identity: {}", msg),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Transient handshake state. Dropped on success, abort, or restart.
struct PendingRegistration {
    uuid: String,
    nonce: String,
}

/// Plaintext carried by the satellite verification message.
#[derive(Debug, Deserialize)]
struct CodeMessage {
    code: String,
    mac: String,
}

/// MAC binding a verification code to the enrollment nonce.
pub fn code_mac(nonce: &str, code: &str) -> String {
    let key = blake3::hash(nonce.as_bytes());
    hex::encode(blake3::keyed_hash(key.as_bytes(), code.as_bytes()).as_bytes())
}

pub struct Registrar {
    cfg_dir: PathBuf,
    satellite: Satellite,
    address: String,
    registry: RegistryClient,
    keyring: Arc<Keyring>,
    inbox: Box<dyn Inbox>,
    poll_interval: Duration,
    code_deadline: Duration,
    state_tx: watch::Sender<RegistrationState>,
}

/// Handle over a running registrar task.
pub struct RegistrarHandle {
    pub state_rx: watch::Receiver<RegistrationState>,
    pub task: JoinHandle<RegistrationResult<Credentials>>,
}

impl Registrar {
    pub fn new(
        cfg_dir: PathBuf,
        satellite: Satellite,
        address: String,
        registry: RegistryClient,
        keyring: Arc<Keyring>,
        inbox: Box<dyn Inbox>,
    ) -> (Self, watch::Receiver<RegistrationState>) {
        let (state_tx, state_rx) = watch::channel(RegistrationState::Idle);
        (
            Self {
                cfg_dir,
                satellite,
                address,
                registry,
                keyring,
                inbox,
                poll_interval: POLL_INTERVAL,
                code_deadline: CODE_DEADLINE,
                state_tx,
            },
            state_rx,
        )
    }

    #[cfg(test)]
    fn with_timings(mut self, poll_interval: Duration, code_deadline: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.code_deadline = code_deadline;
        self
    }

    /// Spawn the handshake as a background task. It waits for the first
    /// receiver lock before enrolling: the verification code only flows once
    /// the receiver actually demodulates the satellite.
    pub fn spawn(
        self,
        lock_rx: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> RegistrarHandle {
        let state_rx = self.state_tx.subscribe();
        let task = tokio::spawn(self.run(lock_rx, shutdown));
        RegistrarHandle { state_rx, task }
    }

    #[instrument(skip_all, fields(satellite = %self.satellite))]
    async fn run(
        mut self,
        mut lock_rx: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RegistrationResult<Credentials> {
        let result = self.run_inner(&mut lock_rx, &mut shutdown).await;
        match &result {
            Ok(_) => {
                self.set_state(RegistrationState::Registered);
                info!("receiver registered; ready to report metrics");
            }
            Err(RegistrationError::Aborted) => {
                self.set_state(RegistrationState::Idle);
            }
            Err(e) => {
                self.set_state(RegistrationState::Failed);
                warn!("registration failed: {e}");
            }
        }
        result
    }

    async fn run_inner(
        &mut self,
        lock_rx: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RegistrationResult<Credentials> {
        if !self.keyring.is_unlocked() {
            return Err(RegistrationError::KeyringLocked);
        }

        info!("waiting for receiver lock to initiate the registration");
        tokio::select! {
            res = lock_rx.wait_for(|locked| *locked) => {
                if res.is_err() {
                    return Err(RegistrationError::Aborted);
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => return Err(RegistrationError::Aborted),
        }

        info!("receiver locked; enrolling with the registry");
        let pending = self.enroll().await?;
        let code = self.await_code(&pending, shutdown).await?;
        let password = self.verify(&pending, &code).await?;

        self.set_state(RegistrationState::Persisting);
        let identity = ReceiverIdentity {
            uuid: pending.uuid,
            fingerprint: self.keyring.fingerprint().to_string(),
            satellite: self.satellite,
            address: self.address.clone(),
        };
        identity::persist(&self.cfg_dir, &identity, &password)
            .map_err(|e| RegistrationError::Persist(e.to_string()))?;

        Ok(Credentials { identity, password })
    }

    async fn enroll(&mut self) -> RegistrationResult<PendingRegistration> {
        self.set_state(RegistrationState::Enrolling);

        let request = RegisterRequest {
            fingerprint: self.keyring.fingerprint().to_string(),
            public_key: self.keyring.public_key(),
            address: self.address.clone(),
            satellite: self.satellite,
        };

        let mut last_transport = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.registry.register(&request).await {
                Ok(response) => {
                    // The server may already know this fingerprint; either
                    // way we continue with the newly-issued nonce.
                    return Ok(PendingRegistration {
                        uuid: response.uuid,
                        nonce: response.nonce,
                    });
                }
                Err(RegistryError::Transport(msg)) => {
                    warn!("enrollment attempt {attempt}/{MAX_ATTEMPTS} failed: {msg}");
                    last_transport = msg;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(RegistryError::Rejected { status, detail }) => {
                    // A rejection will not go away on retry.
                    return Err(RegistrationError::ServerRejected { status, detail });
                }
            }
        }

        Err(RegistrationError::Transport(last_transport))
    }

    async fn await_code(
        &mut self,
        pending: &PendingRegistration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RegistrationResult<String> {
        self.set_state(RegistrationState::AwaitingCode);
        info!("awaiting the verification code over satellite");

        let deadline = tokio::time::Instant::now() + self.code_deadline;

        loop {
            if *shutdown.borrow() {
                return Err(RegistrationError::Aborted);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistrationError::Timeout);
            }

            match self.inbox.next_message().await {
                Ok(Some(envelope)) => {
                    if let Some(code) = self.accept_message(pending, &envelope) {
                        info!("verification code received");
                        return Ok(code);
                    }
                }
                Ok(None) => {
                    // Empty inbox is the expected state for most of the wait.
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            return Err(RegistrationError::Aborted);
                        }
                    }
                }
                Err(e) => {
                    warn!("inbox poll failed: {e:#}");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Check one inbox message: it must decrypt under our key and carry a
    /// MAC bound to the enrollment nonce. Anything else is discarded;
    /// duplicates lose to the first match.
    fn accept_message(&self, pending: &PendingRegistration, envelope: &[u8]) -> Option<String> {
        let plaintext = match self.keyring.decrypt(envelope) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("discarding inbox message that failed to decrypt: {e}");
                return None;
            }
        };

        let message: CodeMessage = match serde_json::from_slice(&plaintext) {
            Ok(message) => message,
            Err(e) => {
                debug!("discarding unparseable inbox message: {e}");
                return None;
            }
        };

        if message.mac != code_mac(&pending.nonce, &message.code) {
            warn!("discarding verification code with mismatched MAC");
            return None;
        }

        Some(message.code)
    }

    async fn verify(
        &mut self,
        pending: &PendingRegistration,
        code: &str,
    ) -> RegistrationResult<String> {
        self.set_state(RegistrationState::Verifying);

        let signed_payload = format!("{}{}", pending.nonce, code);
        let signed_code = self
            .keyring
            .sign_b64(signed_payload.as_bytes())
            .map_err(|_| RegistrationError::KeyringLocked)?;

        let mut last_transport = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.registry.verify(&pending.uuid, &signed_code).await {
                Ok(response) => return Ok(response.password),
                Err(RegistryError::Transport(msg)) => {
                    warn!("verification attempt {attempt}/{MAX_ATTEMPTS} failed: {msg}");
                    last_transport = msg;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(RegistryError::Rejected { status, detail }) => {
                    // A replayed code is fine when the durable identity is
                    // already on disk from an earlier run.
                    if (400..500).contains(&status) && detail.contains("code already used") {
                        if let Ok(Some(creds)) = identity::load(&self.cfg_dir) {
                            info!("code already used and identity present; resuming");
                            return Ok(creds.password);
                        }
                    }
                    return Err(RegistrationError::ServerRejected { status, detail });
                }
            }
        }

        Err(RegistrationError::Transport(last_transport))
    }

    fn set_state(&self, state: RegistrationState) {
        debug!("registration state: {state:?}");
        let _ = self.state_tx.send(state);
    }
}
