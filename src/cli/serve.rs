// ABOUTME: CLI serve command - the service over newline-delimited JSON on stdin/stdout
//
// One JSON object per input line, tagged by "op":
//   {"op":"analyze","position":"startpos","engines":["lc0"],"nodes":100000}
//   {"op":"cancel","request_id":"..."}
//   {"op":"health"} / {"op":"health","probe":true}
//   {"op":"engines"}
// One JSON object per output line, tagged by "event". An analysis answers
// "accepted" immediately and "result" once every engine is done, so several
// analyses can be in flight at once.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{
    AnalyzeRequestBody, AnalyzeResponse, ApiError, CancelResponse, EnginesResponse, ErrorResponse,
    HealthResponse, ServiceHandle,
};
use crate::config::ServiceConfig;
use crate::engine_pool::RequestId;

/// Inbound command
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServeCommand {
    /// Submit an analysis
    Analyze(AnalyzeRequestBody),
    /// Cancel a pending analysis
    Cancel {
        /// Id from the `accepted` event
        request_id: String,
    },
    /// Report service health
    Health {
        /// Run a probe cycle before reporting
        #[serde(default)]
        probe: bool,
    },
    /// List configured engines
    Engines,
}

/// Outbound event
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServeEvent {
    /// Analysis admitted
    Accepted {
        /// Id to cancel or correlate the result with
        request_id: RequestId,
        /// Engines the request fans out to
        engines: Vec<String>,
    },
    /// Merged analysis result
    Result(AnalyzeResponse),
    /// Cancel answer
    Cancelled(CancelResponse),
    /// Health report
    Health(HealthResponse),
    /// Engine listing
    Engines(EnginesResponse),
    /// Command rejected
    Error(ErrorResponse),
}

/// Execute the serve command
///
/// Runs until stdin closes or Ctrl-C, then shuts every engine down.
pub async fn execute(config: ServiceConfig) -> Result<()> {
    let service = Arc::new(ServiceHandle::start(config).await?);
    service.start_health_monitor().await;
    info!("Serving on stdin/stdout");

    let input = BufReader::new(tokio::io::stdin());
    let outcome = tokio::select! {
        result = run_session(Arc::clone(&service), input, tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    service.shutdown().await;
    outcome
}

/// Serve commands from `input` until it closes and every accepted analysis
/// has been answered
pub async fn run_session<R, W>(service: Arc<ServiceHandle>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tx = Some(tx);
    let mut lines = input.lines();

    loop {
        tokio::select! {
            line = lines.next_line(), if tx.is_some() => match line? {
                Some(line) => {
                    if let Some(sender) = &tx {
                        handle_line(&service, &line, sender);
                    }
                }
                None => {
                    debug!("Input closed, draining in-flight analyses");
                    tx = None;
                }
            },
            Some(event) = rx.recv() => write_event(&mut output, &event).await?,
            else => break,
        }
    }

    output.flush().await?;
    Ok(())
}

fn handle_line(service: &Arc<ServiceHandle>, line: &str, tx: &mpsc::UnboundedSender<ServeEvent>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let command: ServeCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Malformed command");
            let err = ApiError::BadRequest(format!("malformed command: {e}"));
            send(tx, ServeEvent::Error(err.to_response()));
            return;
        }
    };

    match command {
        ServeCommand::Analyze(body) => match service.submit(body) {
            Ok(handle) => {
                send(
                    tx,
                    ServeEvent::Accepted {
                        request_id: handle.request_id(),
                        engines: handle.engines().map(str::to_string).collect(),
                    },
                );
                let tx = tx.clone();
                tokio::spawn(async move {
                    let aggregate = handle.wait().await;
                    send(&tx, ServeEvent::Result(AnalyzeResponse::from(&aggregate)));
                });
            }
            Err(e) => send(tx, ServeEvent::Error(e.to_response())),
        },
        ServeCommand::Cancel { request_id } => match service.cancel(&request_id) {
            Ok(response) => send(tx, ServeEvent::Cancelled(response)),
            Err(e) => send(tx, ServeEvent::Error(e.to_response())),
        },
        ServeCommand::Health { probe: false } => send(tx, ServeEvent::Health(service.health())),
        ServeCommand::Health { probe: true } => {
            let service = Arc::clone(service);
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = service.probe().await;
                send(&tx, ServeEvent::Health(report));
            });
        }
        ServeCommand::Engines => send(tx, ServeEvent::Engines(service.engines())),
    }
}

fn send(tx: &mpsc::UnboundedSender<ServeEvent>, event: ServeEvent) {
    if tx.send(event).is_err() {
        debug!("Output closed, dropping event");
    }
}

async fn write_event<W: AsyncWrite + Unpin>(output: &mut W, event: &ServeEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_pool::{EngineDescriptor, EngineKind};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::time::Duration;

    const FAKE: &str = r#"
while read -r cmd rest; do
  case "$cmd" in
    uci) echo "id name Fake 1.0"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go)
      echo "info depth 6 multipv 1 score cp 20 nodes 3000 nps 60000 time 50 pv g1f3"
      echo "bestmove g1f3" ;;
    quit) exit 0 ;;
  esac
done
"#;

    async fn service() -> Arc<ServiceHandle> {
        let mut engine = EngineDescriptor::new("fake", EngineKind::CpuSearch, "sh");
        engine.args = vec!["-c".to_string(), FAKE.to_string()];
        let mut config = ServiceConfig {
            engines: vec![engine],
            ..ServiceConfig::default()
        };
        config.pool.launch_probe = Duration::from_millis(50);
        config.pool.terminate_grace = Duration::from_millis(500);
        Arc::new(ServiceHandle::start(config).await.unwrap())
    }

    fn events(output: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    // ==================== Command Parsing Tests ====================

    #[test]
    fn test_parse_commands() {
        let analyze: ServeCommand =
            serde_json::from_str(r#"{"op":"analyze","fen":"startpos","nodes":5000}"#).unwrap();
        let ServeCommand::Analyze(body) = analyze else {
            panic!("expected analyze");
        };
        assert_eq!(body.position.as_deref(), Some("startpos"));
        assert_eq!(body.nodes, Some(5000));

        let health: ServeCommand = serde_json::from_str(r#"{"op":"health"}"#).unwrap();
        assert!(matches!(health, ServeCommand::Health { probe: false }));

        assert!(serde_json::from_str::<ServeCommand>(r#"{"op":"launch"}"#).is_err());
    }

    // ==================== Session Tests ====================

    #[tokio::test]
    async fn test_session_answers_every_command() {
        let service = service().await;
        let input = concat!(
            "{\"op\":\"engines\"}\n",
            "\n",
            "{\"op\":\"analyze\",\"position\":\"startpos\",\"nodes\":5000,\"num_moves\":1}\n",
            "not json\n",
            "{\"op\":\"health\"}\n",
        );
        let mut output = Vec::new();
        run_session(Arc::clone(&service), input.as_bytes(), &mut output)
            .await
            .unwrap();

        let events = events(&output);
        let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["engines", "accepted", "error", "health", "result"]);

        assert_eq!(events[0]["engines"][0]["id"], "fake");
        assert_eq!(events[2]["error"], "invalid_request");
        assert_eq!(events[3]["status"], "healthy");
        assert_eq!(events[4]["request_id"], events[1]["request_id"]);
        assert_eq!(events[4]["results"][0]["best_move"], "g1f3");
        assert_eq!(events[4]["results"][0]["candidates"][0]["move_san"], "Nf3");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_reports_submission_errors() {
        let service = service().await;
        let input = concat!(
            "{\"op\":\"analyze\",\"position\":\"startpos\",\"engine\":\"nope\"}\n",
            "{\"op\":\"cancel\",\"request_id\":\"8d3c1f3e-5a55-4c4e-9f0a-2b5c1d7e9a10\"}\n",
        );
        let mut output = Vec::new();
        run_session(Arc::clone(&service), input.as_bytes(), &mut output)
            .await
            .unwrap();

        let events = events(&output);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["error"], "unknown_engine");
        assert_eq!(events[0]["status"], 404);
        assert_eq!(events[1]["error"], "unknown_request");

        service.shutdown().await;
    }
}
