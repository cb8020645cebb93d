// ABOUTME: Engine failure mid-search, restart, and permanent failure after exhausted retries

use std::time::Duration;

use super::fixtures::{eventually, scheduler_config, FakeEngine, Harness, Mode};
use anyhow::Result;
use chess_engine_service::engine_pool::{
    AnalysisRequest, AnalysisStatus, PoolError, SchedulerConfig, SchedulerError,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_engine_killed_mid_search_resolves_and_restarts() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::WaitStop)]).await;
    let old_pid = harness.pid("sf").expect("engine launched");

    let handle = harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))?;
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);

    kill(Pid::from_raw(i32::try_from(old_pid)?), Signal::SIGKILL)?;

    let aggregate = handle.wait().await;
    let result = &aggregate.results[0];
    assert!(matches!(
        result.status,
        AnalysisStatus::EngineError | AnalysisStatus::TimedOut
    ));
    assert!(result.error.is_some());

    let engine = harness.pool().handle("sf").expect("configured");
    assert!(eventually(|| engine.restarts() == 1 && engine.is_ready(), Duration::from_secs(3)).await);
    assert_ne!(harness.pid("sf"), Some(old_pid));
    // Second handshake happened on the fresh process
    assert_eq!(fake.count("sf", "uci"), 2);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_engine_dying_on_search_is_replaced() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::Die)]).await;

    let aggregate = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))
        .await?;
    assert_eq!(aggregate.results[0].status, AnalysisStatus::EngineError);

    let engine = harness.pool().handle("sf").expect("configured");
    assert!(eventually(|| engine.restarts() == 1 && engine.is_ready(), Duration::from_secs(3)).await);
    assert_eq!(harness.pool().metrics().snapshot().restarts, 1);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unresponsive_search_times_out_and_restarts() -> Result<()> {
    let fake = FakeEngine::new()?;
    let config = SchedulerConfig {
        request_timeout: Duration::from_millis(300),
        ..scheduler_config(4)
    };
    let harness = Harness::start_with(vec![fake.descriptor("sf", Mode::Hang)], config).await;

    let aggregate = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))
        .await?;
    assert_eq!(aggregate.results[0].status, AnalysisStatus::TimedOut);

    let engine = harness.pool().handle("sf").expect("configured");
    assert!(eventually(|| engine.restarts() == 1 && engine.is_ready(), Duration::from_secs(3)).await);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_restarts_make_engine_unavailable() -> Result<()> {
    let fake = FakeEngine::new()?;
    let healthy = FakeEngine::new()?;
    let harness = Harness::start(vec![
        fake.descriptor("flaky", Mode::Die),
        healthy.descriptor("sf", Mode::Normal),
    ])
    .await;

    fake.break_launches()?;
    let aggregate = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "flaky", 5_000, 1))
        .await?;
    assert_eq!(aggregate.results[0].status, AnalysisStatus::EngineError);

    let engine = harness.pool().handle("flaky").expect("configured");
    assert!(eventually(|| !engine.is_available(), Duration::from_secs(5)).await);
    assert_eq!(engine.state_label(), "failed");
    assert!(engine.unavailable_reason().is_some());

    match harness
        .scheduler
        .submit(AnalysisRequest::nodes("startpos", "flaky", 5_000, 1))
    {
        Err(SchedulerError::Pool(PoolError::EngineUnavailable { engine, .. })) => {
            assert_eq!(engine, "flaky");
        }
        other => panic!("expected EngineUnavailable, got {other:?}"),
    }

    // Other engines keep serving
    let aggregate = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "sf", 5_000, 1))
        .await?;
    assert_eq!(aggregate.results[0].status, AnalysisStatus::Completed);

    harness.stop().await;
    Ok(())
}
