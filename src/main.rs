//! guardshift CLI entry point.
//!
//! Parses arguments, loads configuration, sets up logging and hands off to
//! the control loop in [`guardshift::control`].

use clap::Parser;
use std::process::ExitCode;

use guardshift::{config, control, logger, CliArgs, Config};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> guardshift::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        std::fs::write(output_path, config.to_toml()?)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    tracing::info!("guardshift {} starting", control::VERSION);
    tracing::debug!("State file: {}", config.state_file.display());
    tracing::debug!(
        "Rotation targets: layer2={} layer3={}",
        config.rotation.num_layer2_guards,
        config.rotation.num_layer3_guards
    );

    control::run_main(config).await
}
