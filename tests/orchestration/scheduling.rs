// ABOUTME: Queueing behaviour: per-engine FIFO order and bounded queue admission

use std::time::Duration;

use super::fixtures::{eventually, scheduler_config, FakeEngine, Harness, Mode};
use anyhow::Result;
use chess_engine_service::engine_pool::{AnalysisRequest, AnalysisStatus, SchedulerError};
use futures_util::future::join_all;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_single_slot_engine_serves_requests_in_submission_order() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::Normal)]).await;

    let positions = [
        "startpos",
        "startpos moves a2a3 a7a6",
        "startpos moves h2h3 h7h6",
        "startpos moves b2b3 b7b6",
    ];
    let handles = positions
        .iter()
        .map(|p| harness.scheduler.submit(AnalysisRequest::nodes(*p, "sf", 2_000, 1)))
        .collect::<Result<Vec<_>, _>>()?;

    let aggregates = join_all(handles.into_iter().map(|h| h.wait())).await;
    assert!(aggregates
        .iter()
        .all(|a| a.results[0].status == AnalysisStatus::Completed));

    let sent: Vec<String> = fake.commands_starting("sf", "position");
    let expected: Vec<String> = positions.iter().map(|p| format!("position {p}")).collect();
    assert_eq!(sent, expected);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_full_queue_rejects_with_overloaded() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start_with(
        vec![fake.descriptor("sf", Mode::WaitStop)],
        scheduler_config(1),
    )
    .await;

    // First request occupies the only slot
    let searching = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);

    // Second waits in the queue, third does not fit
    let queued = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    assert_eq!(harness.scheduler.queue_depth("sf"), 1);

    let rejected = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1));
    match rejected {
        Err(SchedulerError::Overloaded { engine, capacity }) => {
            assert_eq!(engine, "sf");
            assert_eq!(capacity, 1);
        }
        other => panic!("expected Overloaded, got {other:?}"),
    }
    assert_eq!(harness.pool().metrics().snapshot().rejected, 1);

    harness.scheduler.cancel(queued.request_id())?;
    harness.scheduler.cancel(searching.request_id())?;
    assert_eq!(queued.wait().await.results[0].status, AnalysisStatus::Cancelled);
    assert_eq!(searching.wait().await.results[0].status, AnalysisStatus::Cancelled);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_overloaded_multi_engine_request_enqueues_nothing() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start_with(
        vec![
            fake.descriptor("free", Mode::WaitStop),
            fake.descriptor("busy", Mode::WaitStop),
        ],
        scheduler_config(1),
    )
    .await;

    let first = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "busy", 5_000, 1))?;
    assert!(eventually(|| fake.commands_starting("busy", "go").len() == 1, Duration::from_secs(3)).await);
    let second = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "busy", 5_000, 1))?;

    let mut both = AnalysisRequest::nodes("startpos", "free", 5_000, 1);
    both.engines.push("busy".to_string());
    assert!(matches!(
        harness.scheduler.submit(both),
        Err(SchedulerError::Overloaded { ref engine, .. }) if engine == "busy"
    ));
    assert_eq!(harness.scheduler.queue_depth("free"), 0);
    assert!(fake.commands_starting("free", "position").is_empty());

    harness.scheduler.cancel(second.request_id())?;
    harness.scheduler.cancel(first.request_id())?;
    let _ = first.wait().await;
    let _ = second.wait().await;

    harness.stop().await;
    Ok(())
}
