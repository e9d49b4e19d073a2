use anyhow::Result;
use consumption_emissions::{config, pipeline, telemetry};
use config::Config;
use telemetry::init_tracing;
use tracing::{error, info};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    info!(
        data_dir = %cfg.paths.data_dir.display(),
        raw = %cfg.pipeline.raw_stage,
        pollutants = ?cfg.attribution.pollutants,
        "starting consumption emissions pipeline"
    );

    if let Err(e) = pipeline::run(&cfg) {
        error!(error = ?e, "pipeline failed");
        return Err(e);
    }
    Ok(())
}
