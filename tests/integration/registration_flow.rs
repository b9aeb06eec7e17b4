//! Cold-start registration followed by signed reporting.

use std::time::Duration;

use satmon::config::{MonitorOptions, ReportOptions};
use satmon::keyring;
use satmon::monitor;
use satmon::samplers::{Sampler, SdrSampler};
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{
    deliver_code, fast_options, spawn_sdr_feeder, test_context, test_keyring, wait_for_request,
};

#[tokio::test]
async fn cold_start_registers_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = test_keyring(dir.path());

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uuid": "abc",
            "nonce": "N1",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "password": "P",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let options = MonitorOptions {
        report: Some(ReportOptions {
            dest: server.uri(),
            registry: true,
            hostname: Some("Porto Alegre, RS, Brazil".to_string()),
            passphrase: None,
        }),
        ..fast_options()
    };
    let ctx = test_context(dir.path(), options);

    let (graph_end, sampler_end) = tokio::io::duplex(4096);
    let feeder = spawn_sdr_feeder(graph_end);
    let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(sampler_end)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(ctx, sampler, Some(keyring.clone()), shutdown_rx));

    // The registrar enrolls once the receiver locks; answer its enrollment
    // with a code over the "satellite".
    let register_body = wait_for_request(&server, "/register").await;
    assert_eq!(register_body["fingerprint"], keyring.fingerprint());
    assert_eq!(register_body["public_key"], keyring.public_key());
    assert_eq!(register_body["satellite"], "G18");

    deliver_code(dir.path(), &keyring, "N1", "CODE42");

    // Verification carries a signature over nonce || code.
    let verify_body = wait_for_request(&server, "/verify").await;
    assert_eq!(verify_body["uuid"], "abc");
    assert!(keyring::verify_detached(
        &keyring.public_key(),
        b"N1CODE42",
        verify_body["signed_code"].as_str().unwrap(),
    ));

    // Reports start flowing once credentials are durable, signed over the
    // canonical record serialization.
    let report_body = wait_for_request(&server, "/report").await;
    assert_eq!(report_body["uuid"], "abc");
    let metrics: satmon::MetricRecord =
        serde_json::from_value(report_body["metrics"].clone()).unwrap();
    assert!(keyring::verify_detached(
        &keyring.public_key(),
        metrics.canonical_json().as_bytes(),
        report_body["signature"].as_str().unwrap(),
    ));

    // Durable identity and password both exist.
    let creds = satmon::identity::load(dir.path()).unwrap().unwrap();
    assert_eq!(creds.identity.uuid, "abc");
    assert_eq!(creds.password, "P");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    feeder.abort();
}

#[tokio::test]
async fn existing_identity_skips_registration() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = test_keyring(dir.path());

    let identity = satmon::identity::ReceiverIdentity {
        uuid: "abc".to_string(),
        fingerprint: keyring.fingerprint().to_string(),
        satellite: satmon::config::Satellite::Galaxy18,
        address: "x".to_string(),
    };
    satmon::identity::persist(dir.path(), &identity, "P").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200))
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

    // Reports flow without any enrollment round-trip.
    wait_for_request(&server, "/report").await;
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() == "/report"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    feeder.abort();
}
