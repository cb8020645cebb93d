// ABOUTME: CLI analyze command - run one analysis request and print the merged result
//
// Starts only the pool and scheduler (no health monitor), submits one request,
// waits for every engine and shuts the engines down again.

use anyhow::{bail, Context, Result};

use super::{AnalyzeArgs, OutputFormat};
use crate::api::{AnalyzeRequestBody, AnalyzeResponse, EngineAnalysis, ServiceHandle};
use crate::config::ServiceConfig;
use crate::engine_pool::AnalysisStatus;

impl From<AnalyzeArgs> for AnalyzeRequestBody {
    fn from(args: AnalyzeArgs) -> Self {
        Self {
            position: Some(args.position),
            engine: None,
            engines: args.engines,
            nodes: args.nodes,
            depth: args.depth,
            time_ms: args.time_ms,
            num_moves: args.num_moves,
        }
    }
}

/// Execute the analyze command
pub async fn execute(args: AnalyzeArgs, config: ServiceConfig, format: OutputFormat) -> Result<()> {
    let service = ServiceHandle::start(config).await?;
    let outcome = service.analyze(args.into()).await;
    service.shutdown().await;
    let response = outcome?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("Failed to serialize analysis")?
            );
        }
        OutputFormat::Text => print!("{}", render(&response)),
    }

    if !response
        .results
        .iter()
        .any(|r| r.status == AnalysisStatus::Completed)
    {
        bail!("No engine completed the analysis");
    }
    Ok(())
}

/// Human-readable rendering of a response
pub fn render(response: &AnalyzeResponse) -> String {
    let mut out = String::new();
    out.push_str(&format!("Position: {}\n", response.fen));
    out.push_str(&format!("Request:  {}\n", response.request_id));

    for result in &response.results {
        out.push('\n');
        out.push_str(&render_engine(result));
    }
    out
}

fn render_engine(result: &EngineAnalysis) -> String {
    let mut out = format!(
        "{} ({}, {} nodes, depth {}, {} ms)\n",
        result.engine, result.status, result.total_nodes, result.depth, result.time_ms
    );

    if let Some(error) = &result.error {
        out.push_str(&format!("  error: {error}\n"));
    }

    for candidate in &result.candidates {
        let [win, draw, loss] = candidate.score_wdl;
        out.push_str(&format!(
            "  {:>2}. {:<7} {:>7}  W{:>5.1} D{:>5.1} L{:>5.1}  {}\n",
            candidate.rank,
            candidate.move_san,
            format_score(candidate.score_cp, candidate.mate),
            f64::from(win) / 10.0,
            f64::from(draw) / 10.0,
            f64::from(loss) / 10.0,
            candidate.pv.join(" "),
        ));
    }
    out
}

/// `+0.35`, `-1.20`, `#3`, `#-2`
pub fn format_score(cp: i32, mate: Option<i32>) -> String {
    match mate {
        Some(n) => format!("#{n}"),
        None => format!("{:+.2}", f64::from(cp) / 100.0),
    }
}
