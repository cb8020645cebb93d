// ABOUTME: Health probing, readiness aggregation and the background monitor

use std::sync::Arc;
use std::time::Duration;

use super::fixtures::{eventually, FakeEngine, Harness, Mode};
use anyhow::Result;
use chess_engine_service::engine_pool::{HealthMonitor, HealthReport, Readiness};
use pretty_assertions::assert_eq;

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

#[tokio::test]
async fn test_probe_restarts_engine_that_stopped_answering() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::HangOnPing)]).await;
    let old_pid = harness.pid("sf");

    let report = HealthMonitor::run_once(harness.pool(), PROBE_TIMEOUT).await;

    assert_eq!(report.status, Readiness::Healthy);
    assert_eq!(report.engines[0].restarts, 1);
    assert!(report.engines[0].ready);
    assert_ne!(harness.pid("sf"), old_pid);
    assert_eq!(report.metrics.restarts, 1);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_option_degrades_service() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![
        fake.descriptor("good", Mode::Normal),
        fake.descriptor("bad", Mode::Reject),
    ])
    .await;

    let report = HealthMonitor::run_once(harness.pool(), PROBE_TIMEOUT).await;
    assert_eq!(report.status, Readiness::Degraded);

    let bad = report.engines.iter().find(|e| e.name == "bad").expect("listed");
    assert!(!bad.ready);
    assert_eq!(bad.state, "failed");
    assert!(bad.error.as_deref().unwrap_or_default().contains("Hash"));

    let good = report.engines.iter().find(|e| e.name == "good").expect("listed");
    assert!(good.ready);
    assert_eq!(good.state, "ready");

    // A configuration rejection is not retried
    assert_eq!(fake.count("bad", "uci"), 1);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_no_serving_engine_is_down() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("bad", Mode::Reject)]).await;

    let report = HealthReport::from_pool(harness.pool());
    assert_eq!(report.status, Readiness::Down);
    assert!(!report.status.is_serving());

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_background_monitor_recovers_hung_engine() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::HangOnPing)]).await;

    let mut monitor = HealthMonitor::new(Duration::from_millis(100), PROBE_TIMEOUT);
    monitor.start(Arc::clone(harness.pool()));
    assert!(monitor.is_running());

    let engine = Arc::clone(harness.pool().handle("sf").expect("configured"));
    assert!(eventually(|| engine.restarts() >= 1, Duration::from_secs(5)).await);
    assert!(eventually(|| monitor.latest().is_some(), Duration::from_secs(2)).await);

    monitor.stop().await;
    assert!(!monitor.is_running());

    harness.stop().await;
    Ok(())
}
