//! Constellation CLI entry point

use clap::Parser;
use tracing::info;

use constellation_cli::{
    app::ConstellationApp,
    cli::{Cli, Command},
    config::AppConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;
    let app = ConstellationApp::new(config);

    match cli.command {
        Command::Run => {
            app.connect_fleet().await?;
            app.run_until_shutdown().await?;
        }
        Command::Send {
            device,
            task,
            request,
            timeout,
        } => {
            app.connect_fleet().await?;
            let payload: serde_json::Value = serde_json::from_str(&request)
                .map_err(constellation_cli::error::CliError::Json)?;
            let result = app
                .send_task(
                    &device,
                    &task,
                    payload,
                    timeout.map(std::time::Duration::from_secs),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Devices { connected } => {
            app.connect_fleet().await?;
            let devices = app.manager().list_devices(connected).await;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
    }

    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<AppConfig> {
    if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        AppConfig::load_from_file(config_path)
    } else {
        info!("Using default configuration");
        Ok(AppConfig::default())
    }
}
