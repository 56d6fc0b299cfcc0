//! Imaging extraction, anonymisation and export pipeline.
//!
//! Extract requests arrive as messages on a priority queue. The scheduler
//! rate-limits and deduplicates query/retrieve against two DICOM sources,
//! caches identifiable studies until stable, rewrites them under the
//! project's tag scheme and routes the anonymised output to the configured
//! destination, with at-most-once export per (project, study) pair.

pub mod anon;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dimse;
pub mod export;
pub mod hashing;
pub mod ledger;
pub mod limiter;
pub mod message;
pub mod project;
pub mod queue;
pub mod scheduler;
pub mod secrets;
pub mod source;
pub mod types;

use anon::Anonymiser;
use cache::RawCache;
use config::AppConfig;
use export::StudyExporter;
use ledger::ExportLedger;
use limiter::RateLimiter;
use project::ProjectRegistry;
use secrets::SecretResolver;
use source::DicomSource;
use std::sync::Arc;

/// Default application entity title of the raw-cache store SCP.
pub const DEFAULT_AET: &str = "PIXL-RAW";

/// Everything a worker needs, threaded explicitly instead of living in
/// process globals. Tests construct it with in-memory collaborators.
pub struct Runtime {
	pub config: AppConfig,
	pub registry: Arc<ProjectRegistry>,
	pub limiter: Arc<RateLimiter>,
	pub cache: Arc<RawCache>,
	pub primary: Arc<dyn DicomSource>,
	pub secondary: Arc<dyn DicomSource>,
	pub ledger: Arc<dyn ExportLedger>,
	pub secrets: Arc<dyn SecretResolver>,
	pub exporter: Arc<dyn StudyExporter>,
	pub anonymiser: Anonymiser,
}
