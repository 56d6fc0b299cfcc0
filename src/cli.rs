//! Command-line surface: seed the queues, run the pipeline, drain, and
//! trigger tabular exports.

use crate::config::AppConfig;
use crate::export::{ExportRouter, StudyExporter, TabularExport, TabularFile};
use crate::ledger::{ExportLedger, PostgresLedger};
use crate::limiter::RateLimiter;
use crate::message::ExtractRequest;
use crate::project::ProjectRegistry;
use crate::queue::{QueueAdapter, QueueName};
use crate::scheduler::ImagingScheduler;
use crate::secrets::{InMemorySecretStore, LocalFileSecretStore, SecretResolver};
use crate::source::SourceClient;
use crate::types::{QueuePriority, SourceKind};
use crate::{cache::RawCache, dimse::cstore::StoreScp, Runtime};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pixl", version, about = "Imaging anonymisation and export pipeline")]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
	/// Enqueue extract requests from a CSV file or an extract directory.
	Populate {
		path: PathBuf,
		/// Queue priority for the enqueued messages (1 lowest, 5 highest).
		#[arg(long, default_value_t = 1)]
		priority: u8,
	},
	/// Consume the queues and run the pipeline until interrupted.
	Start,
	/// Report queue depths and stop consumption; optionally purge queues.
	Stop {
		#[arg(long)]
		purge: bool,
	},
	/// Upload the tabular (parquet) extract found at the given path.
	ExportPatientData { path: PathBuf },
}

/// Maps to process exit codes: configuration errors exit 1, runtime errors
/// exit 2.
#[derive(Debug, Error)]
pub enum CliError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Runtime error: {0}")]
	Runtime(String),
}

/// `extract_summary.json` written next to an extract.
#[derive(Debug, Deserialize)]
struct ExtractSummary {
	settings: ExtractSettings,
	datetime: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ExtractSettings {
	cdm_source_name: String,
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<(), CliError> {
	match cli.command {
		Command::Populate { path, priority } => populate(&config, &path, priority).await,
		Command::Start => start(config).await,
		Command::Stop { purge } => stop(&config, purge).await,
		Command::ExportPatientData { path } => export_patient_data(&config, &path).await,
	}
}

async fn populate(config: &AppConfig, path: &Path, priority: u8) -> Result<(), CliError> {
	let priority = QueuePriority::new(priority)
		.ok_or_else(|| CliError::Config(format!("priority {priority} out of range 1-5")))?;

	let requests = if path.is_dir() {
		requests_from_extract_dir(path, priority)?
	} else {
		requests_from_csv(path, priority)?
	};

	if requests.is_empty() {
		return Err(CliError::Config(format!(
			"no extract requests found in {}",
			path.display()
		)));
	}

	let adapter = QueueAdapter::connect(&config.queue)
		.await
		.map_err(|err| CliError::Runtime(err.to_string()))?;

	for request in &requests {
		adapter
			.publish(QueueName::Primary, request)
			.await
			.map_err(|err| CliError::Runtime(err.to_string()))?;
	}
	info!(count = requests.len(), "Enqueued extract requests");
	println!("Enqueued {} message(s)", requests.len());
	Ok(())
}

/// CSV row layout: `project-slug,MRN,accession,study-UID?,study-datetime`.
fn requests_from_csv(path: &Path, priority: QueuePriority) -> Result<Vec<ExtractRequest>, CliError> {
	let mut reader = csv::ReaderBuilder::new()
		.has_headers(false)
		.flexible(true)
		.trim(csv::Trim::All)
		.from_path(path)
		.map_err(|err| CliError::Config(format!("{}: {err}", path.display())))?;

	let mut requests = Vec::new();
	for (line, record) in reader.records().enumerate() {
		let record = record.map_err(|err| CliError::Config(format!("row {line}: {err}")))?;
		if record.len() < 5 {
			return Err(CliError::Config(format!(
				"row {line}: expected 5 columns, got {}",
				record.len()
			)));
		}

		let study_uid = match record.get(3) {
			Some("") | None => None,
			Some(uid) => Some(String::from(uid)),
		};
		let study_datetime = parse_datetime(record.get(4).unwrap_or_default())
			.ok_or_else(|| CliError::Config(format!("row {line}: bad study datetime")))?;

		requests.push(ExtractRequest {
			project_name: String::from(record.get(0).unwrap_or_default()),
			mrn: String::from(record.get(1).unwrap_or_default()),
			accession_number: String::from(record.get(2).unwrap_or_default()),
			study_uid,
			study_datetime,
			extract_datetime: Utc::now(),
			priority,
			procedure_occurrence_id: None,
		});
	}
	Ok(requests)
}

/// An extract directory carries `extract_summary.json` (project and extract
/// datetime) plus a `messages.csv` with `MRN,accession,study-UID?,datetime`
/// rows. The parquet payloads themselves are produced upstream.
fn requests_from_extract_dir(
	path: &Path,
	priority: QueuePriority,
) -> Result<Vec<ExtractRequest>, CliError> {
	let summary = read_summary(path)?;
	let messages = path.join("messages.csv");
	if !messages.is_file() {
		return Err(CliError::Config(format!(
			"{} has no messages.csv",
			path.display()
		)));
	}

	let mut reader = csv::ReaderBuilder::new()
		.has_headers(false)
		.flexible(true)
		.trim(csv::Trim::All)
		.from_path(&messages)
		.map_err(|err| CliError::Config(format!("{}: {err}", messages.display())))?;

	let mut requests = Vec::new();
	for (line, record) in reader.records().enumerate() {
		let record = record.map_err(|err| CliError::Config(format!("row {line}: {err}")))?;
		let study_uid = match record.get(2) {
			Some("") | None => None,
			Some(uid) => Some(String::from(uid)),
		};
		let study_datetime = record
			.get(3)
			.and_then(parse_datetime)
			.ok_or_else(|| CliError::Config(format!("row {line}: bad study datetime")))?;

		requests.push(ExtractRequest {
			project_name: summary.settings.cdm_source_name.clone(),
			mrn: String::from(record.get(0).unwrap_or_default()),
			accession_number: String::from(record.get(1).unwrap_or_default()),
			study_uid,
			study_datetime,
			extract_datetime: summary.datetime,
			priority,
			procedure_occurrence_id: None,
		});
	}
	Ok(requests)
}

fn read_summary(path: &Path) -> Result<ExtractSummary, CliError> {
	let summary_path = path.join("extract_summary.json");
	let contents = std::fs::read_to_string(&summary_path)
		.map_err(|err| CliError::Config(format!("{}: {err}", summary_path.display())))?;
	serde_json::from_str(&contents)
		.map_err(|err| CliError::Config(format!("{}: {err}", summary_path.display())))
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
	if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
		return Some(parsed.with_timezone(&Utc));
	}
	for format in ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
		if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
			return Some(Utc.from_utc_datetime(&parsed));
		}
	}
	None
}

fn build_secrets(config: &AppConfig) -> Result<Arc<dyn SecretResolver>, CliError> {
	match &config.secrets.local_dir {
		Some(dir) => Ok(Arc::new(
			LocalFileSecretStore::new(dir.clone())
				.map_err(|err| CliError::Config(err.to_string()))?,
		)),
		None => {
			warn!("No secret store configured; using process-local secrets");
			Ok(Arc::new(InMemorySecretStore::new()))
		}
	}
}

async fn start(config: AppConfig) -> Result<(), CliError> {
	let registry = Arc::new(
		ProjectRegistry::load(&config.projects.config_dir)
			.map_err(|err| CliError::Config(err.to_string()))?,
	);
	#[cfg(unix)]
	Arc::clone(&registry).reload_on_sighup();

	let ledger: Arc<dyn ExportLedger> = Arc::new(
		PostgresLedger::connect(&config.database.url, config.database.skip_migrations)
			.await
			.map_err(|err| CliError::Runtime(err.to_string()))?,
	);

	let adapter = Arc::new(
		QueueAdapter::connect(&config.queue)
			.await
			.map_err(|err| CliError::Runtime(err.to_string()))?,
	);

	let primary = SourceClient::new(
		SourceKind::Primary,
		&config.sources.primary,
		&config.sources,
		&config.store_scp.aet,
		&config.store_scp.aet,
	)
	.map_err(|err| CliError::Config(err.to_string()))?;
	let secondary = SourceClient::new(
		SourceKind::Secondary,
		&config.sources.secondary,
		&config.sources,
		&config.store_scp.aet,
		&config.store_scp.aet,
	)
	.map_err(|err| CliError::Config(err.to_string()))?;

	let limiter = Arc::new(RateLimiter::new(
		usize::from(config.queue.max_messages_in_flight),
		&[
			(SourceKind::Primary, config.sources.primary.rate),
			(SourceKind::Secondary, config.sources.secondary.rate),
		],
	));

	let cache = Arc::new(RawCache::new(config.cache));
	let secrets = build_secrets(&config)?;
	let exporter: Arc<dyn StudyExporter> = Arc::new(ExportRouter::new(
		Arc::clone(&secrets),
		config.export.clone(),
	));
	let anonymiser = crate::anon::Anonymiser::new(
		&config.anonymisation.uid_root,
		config.anonymisation.study_time_offset,
	);

	let cancel = CancellationToken::new();

	// Background services: C-STORE SCP and the stability monitor.
	let scp = StoreScp::new(
		Arc::new(crate::cache::CacheIngest::new(Arc::clone(&cache))),
		config.store_scp.clone(),
	);
	let scp_cancel = cancel.clone();
	let scp_task = tokio::spawn(async move { scp.run(scp_cancel).await });

	let monitor_cache = Arc::clone(&cache);
	let monitor_cancel = cancel.clone();
	tokio::spawn(async move { monitor_cache.run_stability_monitor(monitor_cancel).await });

	report_status(&adapter, &registry, ledger.as_ref()).await;

	let runtime = Arc::new(Runtime {
		config,
		registry,
		limiter,
		cache,
		primary: Arc::new(primary),
		secondary: Arc::new(secondary),
		ledger,
		secrets,
		exporter,
		anonymiser,
	});

	// Shutdown on SIGINT/SIGTERM: stop accepting, drain, nack the rest.
	let shutdown_cancel = cancel.clone();
	tokio::spawn(async move {
		let interrupted = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			let mut terminate = tokio::signal::unix::signal(
				tokio::signal::unix::SignalKind::terminate(),
			)
			.expect("SIGTERM handler");
			tokio::select! {
				_ = interrupted => {}
				_ = terminate.recv() => {}
			}
		}
		#[cfg(not(unix))]
		{
			let _ = interrupted.await;
		}
		info!("Shutdown requested, draining");
		shutdown_cancel.cancel();
	});

	let scheduler = ImagingScheduler::new(runtime);
	scheduler
		.run(adapter, cancel)
		.await
		.map_err(|err| CliError::Runtime(err.to_string()))?;

	scp_task.abort();
	Ok(())
}

async fn stop(config: &AppConfig, purge: bool) -> Result<(), CliError> {
	let adapter = QueueAdapter::connect(&config.queue)
		.await
		.map_err(|err| CliError::Runtime(err.to_string()))?;

	for queue in [QueueName::Primary, QueueName::Secondary, QueueName::DeadLetter] {
		let depth = adapter
			.depth(queue)
			.await
			.map_err(|err| CliError::Runtime(err.to_string()))?;
		println!("{queue:?}: {depth} message(s) waiting");
		if purge && depth > 0 {
			let purged = adapter
				.purge(queue)
				.await
				.map_err(|err| CliError::Runtime(err.to_string()))?;
			println!("{queue:?}: purged {purged} message(s)");
		}
	}
	Ok(())
}

async fn report_status(
	adapter: &QueueAdapter,
	registry: &ProjectRegistry,
	ledger: &dyn ExportLedger,
) {
	for queue in [QueueName::Primary, QueueName::Secondary] {
		match adapter.depth(queue).await {
			Ok(depth) => println!("{queue:?}: {depth} message(s) waiting"),
			Err(err) => warn!("Failed to read queue depth: {err}"),
		}
	}
	for slug in registry.slugs() {
		match ledger.counts(&slug).await {
			Ok(counts) => println!(
				"{slug}: pending={} anonymised={} exported={} failed={}",
				counts.pending, counts.anonymised, counts.exported, counts.failed
			),
			Err(err) => warn!("Failed to read ledger counts for {slug}: {err}"),
		}
	}
}

async fn export_patient_data(config: &AppConfig, path: &Path) -> Result<(), CliError> {
	let summary = read_summary(path)?;
	let registry = ProjectRegistry::load(&config.projects.config_dir)
		.map_err(|err| CliError::Config(err.to_string()))?;
	let project = registry
		.get(&summary.settings.cdm_source_name)
		.map_err(|err| CliError::Config(err.to_string()))?;

	let secrets = build_secrets(config)?;
	let router = ExportRouter::new(secrets, config.export.clone());
	let Some(uploader) = router
		.tabular_uploader(&project)
		.await
		.map_err(|err| CliError::Runtime(err.to_string()))?
	else {
		println!(
			"Project {} has no tabular destination; nothing to do",
			project.slug
		);
		return Ok(());
	};

	let files = collect_files(path, path).map_err(|err| CliError::Runtime(err.to_string()))?;
	let export = TabularExport {
		project_slug: project.slug.clone(),
		extract_time_slug: extract_time_slug(summary.datetime),
		files,
	};

	let receipt = uploader
		.upload_tabular(&export)
		.await
		.map_err(|err| CliError::Runtime(err.to_string()))?;
	println!("Uploaded tabular extract to {}", receipt.location);
	Ok(())
}

/// Filesystem-safe slug of the extract timestamp, e.g.
/// `2023-06-01t12-00-00`.
fn extract_time_slug(datetime: DateTime<Utc>) -> String {
	datetime.format("%Y-%m-%dt%H-%M-%S").to_string()
}

fn collect_files(root: &Path, dir: &Path) -> std::io::Result<Vec<TabularFile>> {
	let mut files = Vec::new();
	for entry in std::fs::read_dir(dir)? {
		let path = entry?.path();
		if path.is_dir() {
			files.extend(collect_files(root, &path)?);
		} else {
			let relative_path = path
				.strip_prefix(root)
				.unwrap_or(&path)
				.to_string_lossy()
				.replace('\\', "/");
			files.push(TabularFile {
				relative_path,
				bytes: std::fs::read(&path)?,
			});
		}
	}
	Ok(files)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn csv_rows_become_requests() {
		let dir = std::env::temp_dir().join(format!("pixl-cli-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		let csv = dir.join("messages.csv");
		std::fs::write(
			&csv,
			"p1,M1,A1,1.2.3,2023-05-17 09:30:00\np1,M2,A2,,17/05/2023 10:00:00\n",
		)
		.unwrap();

		let requests = requests_from_csv(&csv, QueuePriority::new(3).unwrap()).unwrap();
		assert_eq!(requests.len(), 2);
		assert_eq!(requests[0].study_uid.as_deref(), Some("1.2.3"));
		assert_eq!(requests[0].project_name, "p1");
		assert!(requests[1].study_uid.is_none());
		assert_eq!(requests[1].priority.get(), 3);

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn extract_dir_uses_summary_defaults() {
		let dir = std::env::temp_dir().join(format!("pixl-cli-dir-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(
			dir.join("extract_summary.json"),
			r#"{"settings": {"cdm_source_name": "p1"}, "datetime": "2023-06-01T12:00:00Z"}"#,
		)
		.unwrap();
		std::fs::write(dir.join("messages.csv"), "M1,A1,,2023-05-17 09:30:00\n").unwrap();

		let requests =
			requests_from_extract_dir(&dir, QueuePriority::default()).unwrap();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].project_name, "p1");
		assert_eq!(
			extract_time_slug(requests[0].extract_datetime),
			"2023-06-01t12-00-00"
		);

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn malformed_datetime_is_a_config_error() {
		let dir = std::env::temp_dir().join(format!("pixl-cli-bad-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		let csv = dir.join("messages.csv");
		std::fs::write(&csv, "p1,M1,A1,,never\n").unwrap();

		assert!(matches!(
			requests_from_csv(&csv, QueuePriority::default()),
			Err(CliError::Config(_))
		));
		std::fs::remove_dir_all(&dir).unwrap();
	}
}
