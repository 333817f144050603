use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use precip_risk::utils::init_tracing;
use precip_risk::{AssessmentRequest, Config, FloodRiskEngine, HttpTransport, Station};

const USAGE: &str = "usage: precip-risk <stations.json> [RFC3339 time] [--risk-only] [--forecast]";

struct Args {
    stations_path: PathBuf,
    request: AssessmentRequest,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Args> {
    let mut stations_path = None;
    let mut request = AssessmentRequest::default();
    for arg in args {
        match arg.as_str() {
            "--risk-only" => request.risk_only = true,
            "--forecast" => request.with_forecast = true,
            "-h" | "--help" => bail!(USAGE),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            value if stations_path.is_none() => stations_path = Some(PathBuf::from(value)),
            value if request.at.is_none() => {
                let at = DateTime::parse_from_rfc3339(value)
                    .with_context(|| format!("Invalid report time {value}"))?;
                request.at = Some(at.with_timezone(&Utc));
            }
            value => bail!("unexpected argument {value}\n{USAGE}"),
        }
    }

    let Some(stations_path) = stations_path else {
        bail!(USAGE);
    };
    Ok(Args {
        stations_path,
        request,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = parse_args(std::env::args().skip(1))?;
    let cfg = Config::from_env()?;

    let raw = fs::read_to_string(&args.stations_path)
        .await
        .with_context(|| format!("Failed to read {}", args.stations_path.display()))?;
    let stations: Vec<Station> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse stations from {}", args.stations_path.display()))?;
    info!("Loaded {} stations", stations.len());

    let transport = Arc::new(HttpTransport::new(&cfg)?);
    let engine = FloodRiskEngine::new(&cfg, transport);
    if args.request.at.is_none() && !engine.is_available().await {
        warn!("MRMS near-real-time feed did not answer the availability check");
    }

    let report = engine
        .assess(&stations, &args.request)
        .await
        .context("Failed to build risk report")?;
    info!(
        "{} stations reported: {} HIGH, {} AT_RISK",
        report.station_count, report.high_risk_count, report.at_risk_count
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}
