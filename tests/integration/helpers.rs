//! Helper functions for integration tests

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use satmon::config::{Config, MonitorContext, MonitorOptions, ReceiverConfig, Satellite};
use satmon::keyring::{self, Keyring};
use satmon::registrar::code_mac;
use tokio::io::AsyncWriteExt;
use wiremock::MockServer;

pub fn test_context(cfg_dir: &Path, options: MonitorOptions) -> MonitorContext {
    MonitorContext::new(
        cfg_dir.to_path_buf(),
        Config {
            satellite: Satellite::Galaxy18,
            receiver: ReceiverConfig::Sdr {
                pipe: cfg_dir.join("pipe"),
            },
            lnb: None,
            interface: None,
        },
        options,
    )
}

pub fn fast_options() -> MonitorOptions {
    MonitorOptions {
        echo: false,
        log_interval: Duration::from_millis(20),
        ..MonitorOptions::default()
    }
}

pub fn test_keyring(cfg_dir: &Path) -> Arc<Keyring> {
    Arc::new(Keyring::generate(&cfg_dir.join("keyring/key.json"), "pass").unwrap())
}

/// Feed locked status records into a duplex pipe until the writer handle is
/// dropped by the returned task being aborted, or the reader closes.
pub fn spawn_sdr_feeder(mut graph_end: tokio::io::DuplexStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if graph_end
                .write_all(b"FRAMELOCK=1\nSS=-42.1\nMER=7.4\nVBER=0.002\n")
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

/// Drop an encrypted verification-code message into the spool inbox, the way
/// the broadcast pipeline would.
pub fn deliver_code(cfg_dir: &Path, keyring: &Keyring, nonce: &str, code: &str) {
    let inbox = cfg_dir.join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();

    let plaintext = serde_json::json!({
        "code": code,
        "mac": code_mac(nonce, code),
    });
    let envelope = keyring::encrypt_to(
        &keyring.decryption_public_key(),
        plaintext.to_string().as_bytes(),
    )
    .unwrap();

    std::fs::write(inbox.join("msg-0001"), envelope).unwrap();
}

/// Wait until the mock server has seen a request for `path`, returning its
/// parsed JSON body.
pub async fn wait_for_request(server: &MockServer, path: &str) -> serde_json::Value {
    for _ in 0..500 {
        let requests = server.received_requests().await.unwrap();
        if let Some(req) = requests.iter().find(|r| r.url.path() == path) {
            return serde_json::from_slice(&req.body).unwrap_or(serde_json::Value::Null);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no request for {path} arrived");
}

/// Count requests already received for `path`.
pub async fn request_count(server: &MockServer, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == path)
        .count()
}
