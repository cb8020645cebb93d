// ABOUTME: End-to-end analysis through pool, scheduler, protocol and normalizer

use super::fixtures::{FakeEngine, Harness, Mode};
use anyhow::Result;
use chess_engine_service::engine_pool::{AnalysisRequest, AnalysisStatus, SchedulerError};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_startpos_analysis_returns_ranked_normalized_candidates() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::Normal)]).await;

    let aggregate = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "sf", 100_000, 3))
        .await?;

    assert_eq!(aggregate.fen, "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
    let result = aggregate.result_for("sf").expect("one result per engine");
    assert_eq!(result.status, AnalysisStatus::Completed);

    let firsts: Vec<&str> = result.candidates.iter().map(|c| c.moves[0].as_str()).collect();
    assert_eq!(firsts, vec!["e2e4", "d2d4", "g1f3"]);
    let ranks: Vec<u32> = result.candidates.iter().map(|c| c.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);

    let best = &result.candidates[0];
    assert_eq!(best.san, vec!["e4", "e5", "Nf3"]);
    assert_eq!(best.evaluation.cp, 30);
    assert_eq!(best.evaluation.wdl.win, 400);
    assert_eq!(best.evaluation.wdl.draw, 550);
    assert_eq!(best.evaluation.wdl.loss, 50);

    assert_eq!(result.best_move.as_deref(), Some("e2e4"));
    assert_eq!(result.best_move_san.as_deref(), Some("e4"));
    assert_eq!(result.evaluation.map(|e| e.cp), Some(30));
    assert_eq!(result.stats.nodes, 100_000);
    assert_eq!(result.stats.depth, 12);
    assert_eq!(result.stats.seldepth, 16);

    // Per-request MultiPV is set before the search and restored after it
    let traffic: Vec<String> = fake
        .commands("sf")
        .into_iter()
        .filter(|line| line.starts_with("setoption name MultiPV") || line.starts_with("go"))
        .collect();
    assert_eq!(
        traffic,
        vec![
            "setoption name MultiPV value 4",
            "setoption name MultiPV value 3",
            "go nodes 100000",
            "setoption name MultiPV value 4",
        ]
    );
    assert_eq!(fake.count("sf", "stop"), 0);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_fan_out_returns_one_result_per_engine_in_request_order() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![
        fake.descriptor("first", Mode::Normal),
        fake.descriptor("second", Mode::Normal),
    ])
    .await;

    let mut request = AnalysisRequest::nodes("startpos moves a2a3 a7a6", "second", 5_000, 2);
    request.engines.push("first".to_string());
    let aggregate = harness.scheduler.analyze(request).await?;

    let engines: Vec<&str> = aggregate.results.iter().map(|r| r.engine.as_str()).collect();
    assert_eq!(engines, vec!["second", "first"]);
    assert!(aggregate.is_complete());
    assert!(aggregate
        .results
        .iter()
        .all(|r| r.status == AnalysisStatus::Completed && r.candidates.len() == 2));

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_illegal_engine_output_degrades_only_that_engine() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![
        fake.descriptor("good", Mode::Normal),
        fake.descriptor("bad", Mode::Illegal),
    ])
    .await;

    let mut request = AnalysisRequest::nodes("startpos", "good", 5_000, 1);
    request.engines.push("bad".to_string());
    let aggregate = harness.scheduler.analyze(request).await?;

    assert_eq!(
        aggregate.result_for("good").map(|r| r.status),
        Some(AnalysisStatus::Completed)
    );
    let bad = aggregate.result_for("bad").expect("bad engine still answers");
    assert_eq!(bad.status, AnalysisStatus::EngineError);
    assert!(bad.candidates.is_empty());
    assert!(bad.error.as_deref().unwrap_or_default().contains("Malformed"));

    // The session itself is fine, only its output was unusable
    let again = harness
        .scheduler
        .analyze(AnalysisRequest::nodes("startpos", "bad", 5_000, 1))
        .await?;
    assert_eq!(again.results[0].status, AnalysisStatus::EngineError);
    assert_eq!(harness.pool().handle("bad").map(|h| h.restarts()), Some(0));

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_position_never_reaches_the_engine() -> Result<()> {
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::Normal)]).await;

    let no_kings = AnalysisRequest::nodes("8/8/8/8/8/8/8/8 w - - 0 1", "sf", 5_000, 1);
    assert!(matches!(
        harness.scheduler.submit(no_kings),
        Err(SchedulerError::InvalidPosition(_))
    ));

    let illegal_move = AnalysisRequest::nodes("startpos moves e2e5", "sf", 5_000, 1);
    assert!(matches!(
        harness.scheduler.submit(illegal_move),
        Err(SchedulerError::InvalidPosition(_))
    ));

    assert!(fake.commands_starting("sf", "position").is_empty());
    assert!(fake.commands_starting("sf", "go").is_empty());

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unrelated_position_starts_a_new_game() -> Result<()> {
    const ENDGAME: &str = "8/8/4k3/8/8/4K3/4P3/8 w - - 0 1";
    let fake = FakeEngine::new()?;
    let harness = Harness::start(vec![fake.descriptor("sf", Mode::Normal)]).await;

    for position in [
        "startpos".to_string(),
        "startpos moves e2e4".to_string(),
        ENDGAME.to_string(),
        format!("{ENDGAME} moves e3d4"),
        "startpos moves d2d4".to_string(),
    ] {
        // Only the traffic matters here; the scripted PVs fit startpos alone
        harness
            .scheduler
            .analyze(AnalysisRequest::nodes(position, "sf", 5_000, 1))
            .await?;
    }

    let traffic: Vec<String> = fake
        .commands("sf")
        .into_iter()
        .filter(|line| line == "ucinewgame" || line.starts_with("position"))
        .collect();
    assert_eq!(
        traffic,
        vec![
            "ucinewgame".to_string(),
            "position startpos".to_string(),
            "position startpos moves e2e4".to_string(),
            "ucinewgame".to_string(),
            format!("position fen {ENDGAME}"),
            format!("position fen {ENDGAME} moves e3d4"),
            "ucinewgame".to_string(),
            "position startpos moves d2d4".to_string(),
        ]
    );

    harness.stop().await;
    Ok(())
}
