use clap::Parser;
use pixl::cli::{self, Cli, CliError};
use pixl::config::AppConfig;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{debug, error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

fn init_logger(level: &str) -> Result<(), anyhow::Error> {
	let log_level = tracing::Level::from_str(level)?;

	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(log_level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let config = match AppConfig::new() {
		Ok(config) => config,
		Err(err) => {
			eprintln!("Invalid configuration: {err}");
			return ExitCode::from(1);
		}
	};

	if let Err(err) = init_logger(&config.telemetry.level) {
		eprintln!("Failed to initialise logging: {err}");
		return ExitCode::from(1);
	}
	debug!("Config: {config:?}");

	match cli::run(cli, config).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err @ CliError::Config(_)) => {
			error!("{err}");
			ExitCode::from(1)
		}
		Err(err @ CliError::Runtime(_)) => {
			error!("{err}");
			ExitCode::from(2)
		}
	}
}
