// ABOUTME: Inbound boundary: request bodies, error codes and listings through ServiceHandle

use std::time::Duration;

use super::fixtures::{eventually, scheduler_config, service_config, FakeEngine, Mode};
use anyhow::Result;
use chess_engine_service::api::{AnalyzeRequestBody, ApiError, ServiceHandle};
use chess_engine_service::engine_pool::{AnalysisStatus, Readiness};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_analyze_body_with_fen_alias_and_default_engine() -> Result<()> {
    let fake = FakeEngine::new()?;
    let service = ServiceHandle::start(service_config(vec![
        fake.descriptor("stockfish", Mode::Normal),
        fake.descriptor("other", Mode::Normal),
    ]))
    .await?;

    let body: AnalyzeRequestBody = serde_json::from_str(
        r#"{"fen": "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1", "num_moves": 2}"#,
    )?;
    let response = service.analyze(body).await?;

    assert_eq!(response.results.len(), 1);
    let result = &response.results[0];
    assert_eq!(result.engine, "stockfish");
    assert_eq!(result.status, AnalysisStatus::Completed);
    assert_eq!(result.evaluation_cp, Some(30));

    let moves: Vec<&str> = result.candidates.iter().map(|c| c.uci.as_str()).collect();
    assert_eq!(moves, vec!["e2e4", "d2d4"]);

    // Omitted budget falls back to the configured default
    assert_eq!(fake.commands_starting("stockfish", "go"), vec!["go nodes 100000"]);
    assert!(fake.commands_starting("other", "go").is_empty());

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_boundary_error_codes() -> Result<()> {
    let fake = FakeEngine::new()?;
    let mut config = service_config(vec![fake.descriptor("sf", Mode::WaitStop)]);
    config.scheduler = scheduler_config(1);
    let service = ServiceHandle::start(config).await?;

    let body = |position: &str| AnalyzeRequestBody {
        position: Some(position.to_string()),
        nodes: Some(5_000),
        ..AnalyzeRequestBody::default()
    };

    let invalid = service.submit(body("not a position")).unwrap_err();
    assert_eq!((invalid.status_code(), invalid.code()), (422, "invalid_position"));

    let mut unknown = body("startpos");
    unknown.engine = Some("komodo".to_string());
    let unknown = service.submit(unknown).unwrap_err();
    assert_eq!((unknown.status_code(), unknown.code()), (404, "unknown_engine"));

    let searching = service.submit(body("startpos"))?;
    assert!(eventually(|| fake.commands_starting("sf", "go").len() == 1, Duration::from_secs(3)).await);
    let queued = service.submit(body("startpos"))?;
    let overloaded = service.submit(body("startpos")).unwrap_err();
    assert!(matches!(overloaded, ApiError::Overloaded { capacity: 1, .. }));
    assert_eq!(overloaded.to_response().status, 429);

    let cancelled = service.cancel(&queued.request_id().to_string())?;
    assert!(cancelled.cancelled);
    assert_eq!(queued.wait().await.results[0].status, AnalysisStatus::Cancelled);

    service.cancel(&searching.request_id().to_string())?;
    assert_eq!(searching.wait().await.results[0].status, AnalysisStatus::Cancelled);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_listing_and_health_reflect_engine_states() -> Result<()> {
    let fake = FakeEngine::new()?;
    let mut disabled = fake.descriptor("maia", Mode::Normal);
    disabled.enabled = false;
    let service = ServiceHandle::start(service_config(vec![
        fake.descriptor("sf", Mode::Normal),
        fake.descriptor("lc0", Mode::Reject),
        disabled,
    ]))
    .await?;

    let listing = service.engines();
    let availability: Vec<(&str, bool, bool)> = listing
        .engines
        .iter()
        .map(|e| (e.id.as_str(), e.enabled, e.available))
        .collect();
    assert_eq!(
        availability,
        vec![("sf", true, true), ("lc0", true, false), ("maia", false, false)]
    );

    let health = service.health();
    assert_eq!(health.status, Readiness::Degraded);
    assert!(health.live);
    let states: Vec<&str> = health.engines.iter().map(|e| e.state.as_str()).collect();
    assert_eq!(states, vec!["ready", "failed", "disabled"]);

    // Disabled engines are never launched
    assert!(fake.commands("maia").is_empty());

    service.shutdown().await;
    Ok(())
}
