//! Postgres-backed export ledger.

use super::{
	ExportLedger, ExportRecord, ExportState, LedgerError, StateCounts, TransitionDetail,
};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Forward-only schema migrations, applied in order at startup.
const MIGRATIONS: &[(i32, &str)] = &[(
	1,
	r"
	CREATE TABLE IF NOT EXISTS export (
		project_slug text NOT NULL,
		source_study_uid text NOT NULL,
		anon_study_uid text,
		pseudo_patient_id text,
		state text NOT NULL DEFAULT 'pending',
		error text,
		created timestamptz NOT NULL DEFAULT now(),
		updated timestamptz NOT NULL DEFAULT now(),
		PRIMARY KEY (project_slug, source_study_uid)
	)
	",
)];

pub struct PostgresLedger {
	pool: PgPool,
}

impl PostgresLedger {
	/// Connects and optionally applies pending migrations.
	/// # Errors
	/// Returns a [`LedgerError`] if the pool cannot connect or a migration
	/// fails.
	pub async fn connect(url: &str, skip_migrations: bool) -> Result<Self, LedgerError> {
		let pool = PgPoolOptions::new()
			.max_connections(8)
			.acquire_timeout(Duration::from_secs(30))
			.connect(url)
			.await
			.map_err(|err| LedgerError::Database(err.to_string()))?;

		let ledger = Self { pool };
		if skip_migrations {
			info!("Skipping ledger migrations");
		} else {
			ledger.migrate().await?;
		}
		Ok(ledger)
	}

	async fn migrate(&self) -> Result<(), LedgerError> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS schema_version (version integer PRIMARY KEY, applied timestamptz NOT NULL DEFAULT now())",
		)
		.execute(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;

		for &(version, sql) in MIGRATIONS {
			let already_applied: Option<i32> =
				sqlx::query_scalar("SELECT version FROM schema_version WHERE version = $1")
					.bind(version)
					.fetch_optional(&self.pool)
					.await
					.map_err(|err| LedgerError::Database(err.to_string()))?;
			if already_applied.is_some() {
				continue;
			}

			debug!(version, "Applying ledger migration");
			sqlx::query(sql)
				.execute(&self.pool)
				.await
				.map_err(|err| LedgerError::Database(err.to_string()))?;
			sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
				.bind(version)
				.execute(&self.pool)
				.await
				.map_err(|err| LedgerError::Database(err.to_string()))?;
		}
		Ok(())
	}
}

#[async_trait]
impl ExportLedger for PostgresLedger {
	async fn get_state(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportState>, LedgerError> {
		let state: Option<String> = sqlx::query_scalar(
			"SELECT state FROM export WHERE project_slug = $1 AND source_study_uid = $2",
		)
		.bind(project_slug)
		.bind(source_study_uid)
		.fetch_optional(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;

		state.map(|value| ExportState::from_str(&value)).transpose()
	}

	async fn begin(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<(), LedgerError> {
		sqlx::query(
			"INSERT INTO export (project_slug, source_study_uid, state)
			 VALUES ($1, $2, 'pending')
			 ON CONFLICT (project_slug, source_study_uid) DO NOTHING",
		)
		.bind(project_slug)
		.bind(source_study_uid)
		.execute(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;
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
		let result = sqlx::query(
			"UPDATE export
			 SET state = $1,
			     anon_study_uid = COALESCE($2, anon_study_uid),
			     pseudo_patient_id = COALESCE($3, pseudo_patient_id),
			     error = $4,
			     updated = now()
			 WHERE project_slug = $5 AND source_study_uid = $6 AND state = $7",
		)
		.bind(to.to_string())
		.bind(detail.anon_study_uid)
		.bind(detail.pseudo_patient_id)
		.bind(detail.error)
		.bind(project_slug)
		.bind(source_study_uid)
		.bind(from.to_string())
		.execute(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;

		if result.rows_affected() == 0 {
			return Err(LedgerError::Conflict);
		}
		Ok(())
	}

	async fn record(
		&self,
		project_slug: &str,
		source_study_uid: &str,
	) -> Result<Option<ExportRecord>, LedgerError> {
		let row = sqlx::query(
			"SELECT project_slug, source_study_uid, anon_study_uid, pseudo_patient_id,
			        state, error, created, updated
			 FROM export WHERE project_slug = $1 AND source_study_uid = $2",
		)
		.bind(project_slug)
		.bind(source_study_uid)
		.fetch_optional(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;

		row.map(|row| {
			Ok(ExportRecord {
				project_slug: row
					.try_get("project_slug")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				source_study_uid: row
					.try_get("source_study_uid")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				anon_study_uid: row
					.try_get("anon_study_uid")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				pseudo_patient_id: row
					.try_get("pseudo_patient_id")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				state: ExportState::from_str(
					row.try_get::<String, _>("state")
						.map_err(|err| LedgerError::Corrupt(err.to_string()))?
						.as_str(),
				)?,
				error: row
					.try_get("error")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				created: row
					.try_get("created")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
				updated: row
					.try_get("updated")
					.map_err(|err| LedgerError::Corrupt(err.to_string()))?,
			})
		})
		.transpose()
	}

	async fn counts(&self, project_slug: &str) -> Result<StateCounts, LedgerError> {
		let rows = sqlx::query(
			"SELECT state, count(*) AS n FROM export WHERE project_slug = $1 GROUP BY state",
		)
		.bind(project_slug)
		.fetch_all(&self.pool)
		.await
		.map_err(|err| LedgerError::Database(err.to_string()))?;

		let mut counts = StateCounts::default();
		for row in rows {
			let state: String = row
				.try_get("state")
				.map_err(|err| LedgerError::Corrupt(err.to_string()))?;
			let n: i64 = row
				.try_get("n")
				.map_err(|err| LedgerError::Corrupt(err.to_string()))?;
			let n = u64::try_from(n).unwrap_or(0);
			match ExportState::from_str(&state)? {
				ExportState::Pending => counts.pending = n,
				ExportState::Anonymised => counts.anonymised = n,
				ExportState::Exported => counts.exported = n,
				ExportState::Failed => counts.failed = n,
			}
		}
		Ok(counts)
	}
}
