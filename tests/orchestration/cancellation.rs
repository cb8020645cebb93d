// ABOUTME: Cancellation of queued and in-flight requests

use std::time::Duration;

use super::fixtures::{eventually, FakeEngine, Harness, Mode};
use anyhow::Result;
use chess_engine_service::engine_pool::{AnalysisRequest, AnalysisStatus};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_cancelling_a_queued_request_never_touches_the_engine() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::WaitStop)]).await;

    let searching = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);

    let queued = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos moves e2e4", "sf", 5_000, 1))?;
    harness.scheduler.cancel(queued.request_id())?;

    let cancelled = queued.wait().await;
    assert_eq!(cancelled.results[0].status, AnalysisStatus::Cancelled);
    assert_eq!(harness.scheduler.queue_depth("sf"), 0);

    harness.scheduler.cancel(searching.request_id())?;
    assert_eq!(searching.wait().await.results[0].status, AnalysisStatus::Cancelled);

    // Only the first request ever reached the engine
    assert_eq!(fake.commands_starting("sf", "position"), vec!["position startpos"]);
    assert_eq!(fake.commands_starting("sf", "go").len(), 1);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelling_a_search_sends_exactly_one_stop() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::WaitStop)]).await;

    let handle = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    let request_id = handle.request_id();
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);

    harness.scheduler.cancel(request_id)?;
    // A second cancel while the first is still settling adds nothing
    let _ = harness.scheduler.cancel(request_id);

    let aggregate = handle.wait().await;
    assert_eq!(aggregate.results[0].status, AnalysisStatus::Cancelled);
    assert_eq!(fake.count("sf", "stop"), 1);

    // The engine answered stop with bestmove and is reusable
    let slot = &harness.pool().handle("sf").expect("configured").slots()[0];
    assert!(eventually(|| slot.status().is_serving(), Duration::from_secs(2)).await);
    assert_eq!(slot.restarts(), 0);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_requests_are_counted() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::WaitStop)]).await;

    let handle = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);
    harness.scheduler.cancel(handle.request_id())?;
    let _ = handle.wait().await;

    let metrics = harness.pool().metrics().snapshot();
    assert_eq!(metrics.submitted, 1);
    assert_eq!(metrics.cancelled, 1);
    assert_eq!(harness.scheduler.pending_requests(), 0);

    harness.stop().await;
    Ok(())
}
