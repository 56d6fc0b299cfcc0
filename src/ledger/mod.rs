//! Relational persistence of per-(project, study) export state.
//!
//! Transitions are optimistic compare-and-set: a writer names the state it
//! expects and loses with [`LedgerError::Conflict`] if another writer got
//! there first. Once a pair is `exported` no further work is scheduled for
//! it.

mod postgres;

pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
	Pending,
	Anonymised,
	Exported,
	Failed,
}

impl Display for ExportState {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Pending => write!(f, "pending"),
			Self::Anonymised => write!(f, "anonymised"),
			Self::Exported => write!(f, "exported"),
			Self::Failed => write!(f, "failed"),
		}
	}
}

impl FromStr for ExportState {
	type Err = LedgerError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"pending" => Ok(Self::Pending),
			"anonymised" => Ok(Self::Anonymised),
			"exported" => Ok(Self::Exported),
			"failed" => Ok(Self::Failed),
			other => Err(LedgerError::Corrupt(format!("unknown state '{other}'"))),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ExportRecord {
	pub project_slug: String,
	pub source_study_uid: String,
	pub anon_study_uid: Option<String>,
	pub pseudo_patient_id: Option<String>,
	pub state: ExportState,
	pub error: Option<String>,
	pub created: DateTime<Utc>,
	pub updated: DateTime<Utc>,
}

/// Values written together with a state transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionDetail {
	pub anon_study_uid: Option<String>,
	pub pseudo_patient_id: Option<String>,
	pub error: Option<String>,
}

impl TransitionDetail {
	pub fn error(message: impl Into<String>) -> Self {
		Self {
			error: Some(message.into()),
			..Self::default()
		}
	}
}

/// Per-project counters surfaced by the CLI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateCounts {
	pub pending: u64,
	pub anonymised: u64,
	pub exported: u64,
	pub failed: u64,
}

#[async_trait]
pub trait ExportLedger: Send + Sync {
	/// Current state for the pair, if any work was ever recorded.
	async fn get_state(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportState>, LedgerError>;

	/// Creates the pair in `pending` if it does not exist. Existing rows
	/// are left untouched.
	async fn begin(&self, project_slug: &str, source_study_uid: &str)
		-> Result<(), LedgerError>;

	/// Compare-and-set transition.
	async fn transition(
		&self,
		project_slug: &str,
		source_study_uid: &str,
		from: ExportState,
		to: ExportState,
		detail: TransitionDetail,
	) -> Result<(), LedgerError>;

	async fn record(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportRecord>, LedgerError>;

	async fn counts(&self, project_slug: &str) -> Result<StateCounts, LedgerError>;
}

#[derive(Debug, Error)]
pub enum LedgerError {
	#[error("Ledger state changed concurrently")]
	Conflict,
	#[error("Database error: {0}")]
	Database(String),
	#[error("Ledger row is corrupt: {0}")]
	Corrupt(String),
}

/// Ledger backed by process memory, for tests and dry runs.
#[derive(Default)]
pub struct InMemoryLedger {
	rows: Mutex<HashMap<(String, String), ExportRecord>>,
}

impl InMemoryLedger {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ExportLedger for InMemoryLedger {
	async fn get_state(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportState>, LedgerError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.get(&(String::from(project_slug), String::from(source_study_uid)))
			.map(|row| row.state))
	}

	async fn begin(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<(), LedgerError> {
		let mut rows = self.rows.lock().unwrap();
		let key = (String::from(project_slug), String::from(source_study_uid));
		rows.entry(key).or_insert_with(|| ExportRecord {
			project_slug: String::from(project_slug),
			source_study_uid: String::from(source_study_uid),
			anon_study_uid: None,
			pseudo_patient_id: None,
			state: ExportState::Pending,
			error: None,
			created: Utc::now(),
			updated: Utc::now(),
		});
		Ok(())
	}

	async fn transition(
		&self,
		project_slug: &str,
		source_study_uid: &str,
		from: ExportState,
		to: ExportState,
		detail: TransitionDetail,
	) -> Result<(), LedgerError> {
		let mut rows = self.rows.lock().unwrap();
		let key = (String::from(project_slug), String::from(source_study_uid));
		let row = rows.get_mut(&key).ok_or(LedgerError::Conflict)?;
		if row.state != from {
			return Err(LedgerError::Conflict);
		}
		row.state = to;
		row.updated = Utc::now();
		if let Some(anon_study_uid) = detail.anon_study_uid {
			row.anon_study_uid = Some(anon_study_uid);
		}
		if let Some(pseudo_patient_id) = detail.pseudo_patient_id {
			row.pseudo_patient_id = Some(pseudo_patient_id);
		}
		row.error = detail.error;
		Ok(())
	}

	async fn record(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportRecord>, LedgerError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.get(&(String::from(project_slug), String::from(source_study_uid)))
			.cloned())
	}

	async fn counts(&self, project_slug: &str) -> Result<StateCounts, LedgerError> {
		let rows = self.rows.lock().unwrap();
		let mut counts = StateCounts::default();
		for row in rows.values().filter(|row| row.project_slug == project_slug) {
			match row.state {
				ExportState::Pending => counts.pending += 1,
				ExportState::Anonymised => counts.anonymised += 1,
				ExportState::Exported => counts.exported += 1,
				ExportState::Failed => counts.failed += 1,
			}
		}
		Ok(counts)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn begin_is_idempotent() {
		let ledger = InMemoryLedger::new();
		ledger.begin("p1", "1.2.3").await.unwrap();
		ledger
			.transition(
				"p1",
				"1.2.3",
				ExportState::Pending,
				ExportState::Anonymised,
				TransitionDetail::default(),
			)
			.await
			.unwrap();
		ledger.begin("p1", "1.2.3").await.unwrap();

		assert_eq!(
			ledger.get_state("p1", "1.2.3").await.unwrap(),
			Some(ExportState::Anonymised)
		);
	}

	#[tokio::test]
	async fn transition_enforces_compare_and_set() {
		let ledger = InMemoryLedger::new();
		ledger.begin("p1", "1.2.3").await.unwrap();

		let wrong = ledger
			.transition(
				"p1",
				"1.2.3",
				ExportState::Anonymised,
				ExportState::Exported,
				TransitionDetail::default(),
			)
			.await;
		assert!(matches!(wrong, Err(LedgerError::Conflict)));

		ledger
			.transition(
				"p1",
				"1.2.3",
				ExportState::Pending,
				ExportState::Failed,
				TransitionDetail::error("NotFound"),
			)
			.await
			.unwrap();

		let record = ledger.record("p1", "1.2.3").await.unwrap().unwrap();
		assert_eq!(record.state, ExportState::Failed);
		assert_eq!(record.error.as_deref(), Some("NotFound"));
	}

	#[tokio::test]
	async fn counts_are_per_project() {
		let ledger = InMemoryLedger::new();
		ledger.begin("p1", "1").await.unwrap();
		ledger.begin("p1", "2").await.unwrap();
		ledger.begin("p2", "3").await.unwrap();
		ledger
			.transition(
				"p1",
				"1",
				ExportState::Pending,
				ExportState::Exported,
				TransitionDetail::default(),
			)
			.await
			.unwrap();

		let counts = ledger.counts("p1").await.unwrap();
		assert_eq!(counts.exported, 1);
		assert_eq!(counts.pending, 1);
		assert_eq!(ledger.counts("p2").await.unwrap().pending, 1);
	}
}
