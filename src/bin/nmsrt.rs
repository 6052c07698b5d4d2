use anyhow::Context;
use nmsrt::prelude::*;
use std::process::ExitCode;

fn run() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: nmsrt <config.toml>")?;

    let cfg = match SimulationConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            // the logger section lives in the file we failed to read
            let _guard = LoggerConfig::from_env().init();
            tracing::error!("[nmsrt] {:#}", e);
            return Err(e);
        }
    };

    let logger = cfg.logger.clone().unwrap_or_else(LoggerConfig::from_env);
    let _guard = logger.init()?;

    match Orchestrator::new(cfg).run() {
        Ok(report) => {
            tracing::info!(
                "[nmsrt] {} done: {} steps, {} sources, {} sinks in {:?}",
                report.mode,
                report.evaluator.steps,
                report.sources.len(),
                report.sinks.len(),
                report.elapsed
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("[nmsrt] run failed: {}", e);
            Err(e.into())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nmsrt: {e:#}");
            ExitCode::FAILURE
        }
    }
}
