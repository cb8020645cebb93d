// ABOUTME: CLI health command - start the engines, run one probe cycle, report readiness
//
// Exits non-zero when no enabled engine is serving, so the command can back a
// container readiness check.

use anyhow::{bail, Context, Result};

use super::OutputFormat;
use crate::api::{HealthResponse, ServiceHandle};
use crate::config::ServiceConfig;
use crate::engine_pool::Readiness;

/// Execute the health command
pub async fn execute(config: ServiceConfig, format: OutputFormat) -> Result<()> {
    let service = ServiceHandle::start(config).await?;
    let report = service.probe().await;
    service.shutdown().await;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize health report")?
            );
        }
        OutputFormat::Text => print!("{}", render(&report)),
    }

    if report.status == Readiness::Down {
        bail!("No engine is serving");
    }
    Ok(())
}

fn status_icon(ready: bool, enabled: bool) -> &'static str {
    match (enabled, ready) {
        (false, _) => "\u{25cb}", // empty circle
        (true, true) => "\x1b[32m\u{25cf}\x1b[0m",
        (true, false) => "\x1b[31m\u{25cf}\x1b[0m",
    }
}

/// Human-readable rendering of a health report
pub fn render(report: &HealthResponse) -> String {
    let mut out = format!("Status: {}\n", report.status);
    out.push_str(&format!("{}\n", "━".repeat(44)));

    for engine in &report.engines {
        out.push_str(&format!(
            "{} {:<12} {:<11} {:<10} restarts {}\n",
            status_icon(engine.ready, engine.enabled),
            engine.name,
            engine.kind.as_str(),
            engine.state,
            engine.restarts,
        ));
        if let Some(error) = &engine.error {
            out.push_str(&format!("    {error}\n"));
        }
    }

    let metrics = &report.metrics;
    out.push_str(&format!(
        "\nRequests: {} submitted, {} completed, {} failed, {} timed out, {} cancelled, {} rejected\n",
        metrics.submitted,
        metrics.completed,
        metrics.failed,
        metrics.timed_out,
        metrics.cancelled,
        metrics.rejected,
    ));
    out
}
