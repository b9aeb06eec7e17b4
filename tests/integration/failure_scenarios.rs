//! Failure-path scenarios: transient report errors and credential expiry.

use std::time::Duration;

use satmon::config::{MonitorOptions, ReportOptions, Satellite};
use satmon::identity::{self, ReceiverIdentity};
use satmon::monitor;
use satmon::samplers::{Sampler, SdrSampler};
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{
    fast_options, request_count, spawn_sdr_feeder, test_context, test_keyring, wait_for_request,
};

/// A 5xx drops the sample; the next tick posts a fresh one. No retry queue.
#[tokio::test]
async fn transient_report_failure_retries_naturally() {
    let dir = tempfile::tempdir().unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let options = MonitorOptions {
        report: Some(ReportOptions {
            dest: server.uri(),
            registry: false,
            hostname: Some("rx-1".to_string()),
            passphrase: None,
        }),
        ..fast_options()
    };
    let ctx = test_context(dir.path(), options);

    let (graph_end, sampler_end) = tokio::io::duplex(4096);
    let feeder = spawn_sdr_feeder(graph_end);
    let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(sampler_end)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(ctx, sampler, None, shutdown_rx));

    wait_for_request(&server, "/report").await;
    // Fresh samples keep being posted despite the 503s.
    for _ in 0..100 {
        if request_count(&server, "/report").await >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(request_count(&server, "/report").await >= 3);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    feeder.abort();
}

/// A 401 clears the password and re-arms the registration handshake.
#[tokio::test]
async fn unauthorized_report_rearms_registration() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = test_keyring(dir.path());

    let identity = ReceiverIdentity {
        uuid: "abc".to_string(),
        fingerprint: keyring.fingerprint().to_string(),
        satellite: Satellite::Galaxy18,
        address: "x".to_string(),
    };
    identity::persist(dir.path(), &identity, "STALE").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uuid": "abc",
            "nonce": "N2",
        })))
        .mount(&server)
        .await;

    let options = MonitorOptions {
        report: Some(ReportOptions {
            dest: server.uri(),
            registry: true,
            hostname: None,
            passphrase: None,
        }),
        ..fast_options()
    };
    let ctx = test_context(dir.path(), options);

    let (graph_end, sampler_end) = tokio::io::duplex(4096);
    let feeder = spawn_sdr_feeder(graph_end);
    let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(sampler_end)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(ctx, sampler, Some(keyring), shutdown_rx));

    // The stale password hits a 401; the registrar is re-armed and, with the
    // receiver still locked, re-enrolls.
    wait_for_request(&server, "/report").await;
    wait_for_request(&server, "/register").await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    feeder.abort();
}
