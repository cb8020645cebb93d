// ABOUTME: CLI engines command - list configured engines and whether they launched

use anyhow::{Context, Result};

use super::OutputFormat;
use crate::api::{EnginesResponse, ServiceHandle};
use crate::config::ServiceConfig;

/// Execute the engines command
pub async fn execute(config: ServiceConfig, format: OutputFormat) -> Result<()> {
    let service = ServiceHandle::start(config).await?;
    let listing = service.engines();
    service.shutdown().await;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&listing).context("Failed to serialize engines")?
            );
        }
        OutputFormat::Text => print!("{}", render(&listing)),
    }
    Ok(())
}

/// Human-readable rendering of the engine listing
pub fn render(listing: &EnginesResponse) -> String {
    if listing.engines.is_empty() {
        return "No engines configured.\n".to_string();
    }

    let mut out = String::new();
    for engine in &listing.engines {
        let availability = match (engine.enabled, engine.available) {
            (false, _) => "disabled",
            (true, true) => "available",
            (true, false) => "unavailable",
        };
        out.push_str(&format!(
            "{:<12} {:<18} {:<11} {:<12} x{}\n    {}\n",
            engine.id,
            engine.name,
            engine.kind.as_str(),
            availability,
            engine.concurrency_limit,
            engine.description,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EngineInfo;
    use crate::engine_pool::EngineKind;

    #[test]
    fn test_render_empty_listing() {
        let listing = EnginesResponse { engines: Vec::new() };
        assert_eq!(render(&listing), "No engines configured.\n");
    }

    #[test]
    fn test_render_marks_disabled_engines() {
        let listing = EnginesResponse {
            engines: vec![
                EngineInfo {
                    id: "lc0".to_string(),
                    name: "Leela Chess Zero".to_string(),
                    description: "Neural network engine".to_string(),
                    kind: EngineKind::GpuNeural,
                    enabled: true,
                    available: true,
                    concurrency_limit: 1,
                },
                EngineInfo {
                    id: "maia".to_string(),
                    name: "Maia Chess".to_string(),
                    description: "Human-like play".to_string(),
                    kind: EngineKind::HumanLike,
                    enabled: false,
                    available: false,
                    concurrency_limit: 1,
                },
            ],
        };

        let text = render(&listing);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("lc0 "));
        assert!(lines[0].contains("available"));
        assert!(lines[2].contains("disabled"));
        assert_eq!(lines[3], "    Human-like play");
    }
}
