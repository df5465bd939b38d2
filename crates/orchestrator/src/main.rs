/// Classify one scan from the command line and print the report as JSON
use anyhow::Context;
use cogniscan_common::ClinicalRecord;
use cogniscan_orchestrator::{PredictionRequest, PredictionService, ServiceConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: {} <scan-image> [age] [gender] [mmse] [cdr]",
            args[0]
        );
        std::process::exit(1);
    }

    let path = PathBuf::from(&args[1]);
    if !path.exists() {
        error!("File not found: {}", path.display());
        std::process::exit(1);
    }

    let field = |i: usize| args.get(i).map(String::as_str);
    let clinical = ClinicalRecord::from_form_fields(field(2), field(3), field(4), field(5));

    let config = ServiceConfig::load()?;
    let service = PredictionService::from_config(&config).await?;

    let image = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    info!("Classifying {} ({} bytes)", path.display(), image.len());

    match service
        .predict(PredictionRequest::new(image, clinical).for_subject("cli"))
        .await
    {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("Prediction failed: {}", e);
            eprintln!("{}: {}", e.kind(), e.public_message());
            std::process::exit(2);
        }
    }
}
