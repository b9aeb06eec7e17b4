//! Sampling loop end-to-end: records flow to the log file and the local
//! status endpoint.

use std::time::Duration;

use satmon::config::MonitorOptions;
use satmon::monitor;
use satmon::samplers::{Sampler, SdrSampler};
use tokio::sync::watch;

use crate::helpers::{fast_options, spawn_sdr_feeder, test_context};

#[tokio::test]
async fn records_served_over_local_http() {
    let dir = tempfile::tempdir().unwrap();
    let options = MonitorOptions {
        server: true,
        port: 19004,
        log_file: true,
        ..fast_options()
    };
    let ctx = test_context(dir.path(), options);

    let (graph_end, sampler_end) = tokio::io::duplex(4096);
    let feeder = spawn_sdr_feeder(graph_end);
    let sampler = Sampler::Sdr(SdrSampler::from_reader(Box::new(sampler_end)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(ctx, sampler, None, shutdown_rx));

    // Give the loop a few ticks, then read the status endpoint.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let body: serde_json::Value = reqwest::get("http://127.0.0.1:19004/")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["lock"], true);
    assert_eq!(body["level"], -42.1);
    assert_eq!(body["snr"], 7.4);
    assert_eq!(body["ber"], 0.002);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    feeder.abort();

    // The log file recorded rendered lines in order, append-only.
    let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs")).unwrap().collect();
    assert_eq!(logs.len(), 1);
    let content = std::fs::read_to_string(logs[0].as_ref().unwrap().path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(!lines.is_empty());
    for line in &lines {
        assert!(
            line.contains("Lock = True; Level = -42.10dBm; SNR = 7.40dB; BER = 2.00e-3;"),
            "unexpected log line: {line}"
        );
    }
}
