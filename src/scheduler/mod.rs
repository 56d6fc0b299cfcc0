//! The imaging scheduler: consumes extract requests and drives each one
//! end-to-end through retrieval, anonymisation and export.
//!
//! Delivery is at-least-once; idempotence comes from the export ledger.
//! Each message runs on its own worker task under the global in-flight
//! ceiling, and cancellation propagates top-down into transfers and waits.

use crate::export::StudyExporter;
use crate::ledger::{ExportState, LedgerError, TransitionDetail};
use crate::limiter::LimiterError;
use crate::message::ExtractRequest;
use crate::project::ProjectError;
use crate::queue::{ExtractDelivery, QueueAdapter, QueueError, QueueName};
use crate::secrets::resolve_project_salt;
use crate::source::{DicomSource, SourceError, StudyQuery};
use crate::types::{DimsePriority, SourceKind, UI};
use crate::Runtime;
use crate::anon::AnonError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Rounds of image-level C-MOVE repair before giving up on a transfer.
const MAX_REPAIR_ROUNDS: usize = 2;
/// Attempts for a transient upload failure.
const MAX_UPLOAD_ATTEMPTS: u32 = 3;
/// Grace window for in-flight messages during shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// What should happen to the delivery after processing.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
	/// Work finished (exported, duplicate, or terminally failed): ack.
	Ack,
	/// Study absent from this source: republish on the secondary queue.
	FallbackToSecondary,
	/// Message cannot be handled by any consumer: dead-letter.
	DeadLetter(String),
	/// Transient condition: redeliver.
	Requeue,
}

pub struct ImagingScheduler {
	runtime: Arc<Runtime>,
}

impl ImagingScheduler {
	pub const fn new(runtime: Arc<Runtime>) -> Self {
		Self { runtime }
	}

	/// Consumes both queues until cancelled, then drains in-flight work
	/// within a grace window.
	/// # Errors
	/// Returns a [`SchedulerError`] if consumption cannot start.
	pub async fn run(
		&self,
		adapter: Arc<QueueAdapter>,
		cancel: CancellationToken,
	) -> Result<(), SchedulerError> {
		let mut primary = adapter.consume(QueueName::Primary, "pixl-primary").await?;
		let mut secondary = adapter
			.consume(QueueName::Secondary, "pixl-secondary")
			.await?;

		let mut workers: JoinSet<()> = JoinSet::new();

		loop {
			// Reap finished workers so the set does not grow unbounded.
			while workers.try_join_next().is_some() {}

			tokio::select! {
				delivery = primary.next() => {
					let Some(delivery) = delivery else { break };
					self.spawn_worker(&mut workers, &adapter, delivery, SourceKind::Primary, &cancel);
				}
				delivery = secondary.next() => {
					let Some(delivery) = delivery else { break };
					self.spawn_worker(&mut workers, &adapter, delivery, SourceKind::Secondary, &cancel);
				}
				() = cancel.cancelled() => break,
			}
		}

		info!("Draining in-flight messages");
		let drain = async {
			while workers.join_next().await.is_some() {}
		};
		if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
			warn!("Grace window elapsed, aborting remaining workers");
			workers.abort_all();
		}
		Ok(())
	}

	fn spawn_worker(
		&self,
		workers: &mut JoinSet<()>,
		adapter: &Arc<QueueAdapter>,
		delivery: Result<ExtractDelivery, QueueError>,
		source_kind: SourceKind,
		cancel: &CancellationToken,
	) {
		let delivery = match delivery {
			Ok(delivery) => delivery,
			Err(err) => {
				error!("Failed to receive delivery: {err}");
				return;
			}
		};

		let runtime = Arc::clone(&self.runtime);
		let adapter = Arc::clone(adapter);
		let cancel = cancel.child_token();

		workers.spawn(async move {
			let scheduler = Self { runtime };
			scheduler
				.handle_delivery(adapter, delivery, source_kind, cancel)
				.await;
		});
	}

	async fn handle_delivery(
		&self,
		adapter: Arc<QueueAdapter>,
		delivery: ExtractDelivery,
		source_kind: SourceKind,
		cancel: CancellationToken,
	) {
		let permit = match self.runtime.limiter.message_permit(&cancel).await {
			Ok(permit) => permit,
			Err(_) => {
				// Shutting down before work started: hand the message back.
				if let Err(err) = delivery.requeue().await {
					error!("Failed to requeue delivery: {err}");
				}
				return;
			}
		};

		let request = delivery.request.clone();
		let outcome = self
			.process_request(&request, source_kind, &cancel)
			.await;
		drop(permit);

		let settle = match outcome {
			Outcome::Ack => delivery.ack().await,
			Outcome::Requeue => delivery.requeue().await,
			Outcome::FallbackToSecondary => {
				match adapter.publish(QueueName::Secondary, &request).await {
					Ok(()) => delivery.ack().await,
					Err(err) => {
						error!("Failed to republish to secondary: {err}");
						delivery.requeue().await
					}
				}
			}
			Outcome::DeadLetter(reason) => {
				warn!(
					identifier = request.identifier(),
					"Dead-lettering message: {reason}"
				);
				let published = match request.to_bytes() {
					Ok(payload) => adapter.dead_letter(&payload).await,
					Err(err) => Err(QueueError::from(err)),
				};
				match published {
					Ok(()) => delivery.ack().await,
					Err(err) => {
						error!("Failed to dead-letter: {err}");
						delivery.reject().await
					}
				}
			}
		};
		if let Err(err) = settle {
			error!("Failed to settle delivery: {err}");
		}
	}

	/// The per-message state machine (steps 1-7 of the pipeline).
	#[instrument(skip_all, fields(
		project = request.project_name,
		identifier = request.identifier(),
		source = %source_kind,
	))]
	pub async fn process_request(
		&self,
		request: &ExtractRequest,
		source_kind: SourceKind,
		cancel: &CancellationToken,
	) -> Outcome {
		let runtime = &self.runtime;
		let ledger_key = request.ledger_key();

		// 1. Deduplicate against the ledger.
		match runtime
			.ledger
			.get_state(&request.project_name, &ledger_key)
			.await
		{
			Ok(Some(ExportState::Exported | ExportState::Anonymised)) => {
				info!("Study already processed, dropping duplicate message");
				return Outcome::Ack;
			}
			Ok(_) => {}
			Err(err) => {
				error!("Ledger lookup failed: {err}");
				return Outcome::Requeue;
			}
		}

		// 2. Resolve the project.
		let project = match runtime.registry.get(&request.project_name) {
			Ok(project) => project,
			Err(ProjectError::UnknownProject(slug)) => {
				return Outcome::DeadLetter(format!("unknown project '{slug}'"));
			}
			Err(err) => {
				error!("Project resolution failed: {err}");
				return Outcome::Requeue;
			}
		};

		if let Err(err) = runtime.ledger.begin(&request.project_name, &ledger_key).await {
			error!("Failed to create ledger row: {err}");
			return Outcome::Requeue;
		}

		// 3/4. Query and retrieve from the source this queue serves.
		let source = match source_kind {
			SourceKind::Primary => Arc::clone(&runtime.primary),
			SourceKind::Secondary => Arc::clone(&runtime.secondary),
		};

		let retrieved = match self
			.query_and_retrieve(request, source.as_ref(), cancel)
			.await
		{
			Ok(studies) if studies.is_empty() => {
				return match source_kind {
					SourceKind::Primary => {
						info!("Study not in primary source, falling back to secondary");
						Outcome::FallbackToSecondary
					}
					SourceKind::Secondary => {
						self.mark_failed(request, &ledger_key, "NotFound").await
					}
				};
			}
			Ok(studies) => studies,
			Err(SourceError::CircuitOpen) => {
				return match source_kind {
					SourceKind::Primary => {
						warn!("Primary circuit open, routing to secondary");
						Outcome::FallbackToSecondary
					}
					SourceKind::Secondary => Outcome::Requeue,
				};
			}
			Err(SourceError::Cancelled) => return Outcome::Requeue,
			Err(err) => {
				warn!("Retrieval failed: {err}");
				return self
					.mark_failed(request, &ledger_key, &format!("TransferFailed: {err}"))
					.await;
			}
		};

		// 5. Wait for every retrieved study to be stable in the cache.
		let stability_timeout = runtime.config.sources.transfer_timeout();
		for study_uid in &retrieved {
			let wait = runtime.cache.wait_stable(study_uid, cancel);
			match tokio::time::timeout(stability_timeout, wait).await {
				Ok(Ok(())) => {}
				Ok(Err(_)) => return Outcome::Requeue,
				Err(_) => {
					warn!(study_uid, "Study never stabilised");
					return self
						.mark_failed(request, &ledger_key, "CacheUnstable")
						.await;
				}
			}
		}

		// 6. Anonymise.
		let salt = match resolve_project_salt(
			runtime.secrets.as_ref(),
			project.keyvault_prefix(),
			runtime.config.secrets.salt_value.as_deref(),
		)
		.await
		{
			Ok(salt) => salt,
			Err(err) if err.is_transient() => {
				warn!("Secret store unavailable: {err}");
				return Outcome::Requeue;
			}
			Err(err) => {
				error!("Failed to resolve project salt: {err}");
				return self
					.mark_failed(request, &ledger_key, &format!("SecretUnavailable: {err}"))
					.await;
			}
		};

		let pins: Vec<_> = retrieved
			.iter()
			.map(|study_uid| runtime.cache.pin(study_uid))
			.collect();

		let mut instances = Vec::new();
		for study_uid in &retrieved {
			instances.extend(runtime.cache.instances_of(study_uid));
		}

		let anonymised = match runtime.anonymiser.anonymise_study(
			&project,
			&salt,
			&request.mrn,
			&request.accession_number,
			&retrieved,
			&instances,
		) {
			Ok(anonymised) => anonymised,
			Err(AnonError::AllInstancesSkipped(reasons)) => {
				let detail = reasons
					.first()
					.map_or_else(String::new, ToString::to_string);
				drop(pins);
				return self
					.mark_failed(request, &ledger_key, &format!("SkippedStudy: {detail}"))
					.await;
			}
			Err(err) => {
				drop(pins);
				return self
					.mark_failed(
						request,
						&ledger_key,
						&format!("AnonymisationFailure: {err}"),
					)
					.await;
			}
		};

		if let Err(err) = runtime
			.ledger
			.transition(
				&request.project_name,
				&ledger_key,
				ExportState::Pending,
				ExportState::Anonymised,
				TransitionDetail {
					anon_study_uid: Some(anonymised.anon_study_uid.clone()),
					pseudo_patient_id: Some(anonymised.pseudo_patient_id.clone()),
					error: None,
				},
			)
			.await
		{
			return self.on_ledger_conflict(err);
		}

		// 7. Export and finish.
		let mut upload_error = None;
		for attempt in 0..MAX_UPLOAD_ATTEMPTS {
			if attempt > 0 {
				tokio::select! {
					() = tokio::time::sleep(Duration::from_millis(500) * 2_u32.pow(attempt - 1)) => {}
					() = cancel.cancelled() => return Outcome::Requeue,
				}
			}
			match runtime.exporter.export_study(&project, &anonymised).await {
				Ok(receipt) => {
					if let Some(receipt) = receipt {
						info!(
							destination = receipt.destination,
							location = receipt.location,
							"Uploaded anonymised study"
						);
					}
					upload_error = None;
					break;
				}
				Err(err) if err.is_transient() => {
					warn!(attempt, "Transient upload failure: {err}");
					upload_error = Some(err);
				}
				Err(err) => {
					upload_error = Some(err);
					break;
				}
			}
		}

		drop(pins);

		if let Some(err) = upload_error {
			let transition = runtime
				.ledger
				.transition(
					&request.project_name,
					&ledger_key,
					ExportState::Anonymised,
					ExportState::Failed,
					TransitionDetail::error(format!("UploadFailure: {err}")),
				)
				.await;
			if let Err(err) = transition {
				return self.on_ledger_conflict(err);
			}
			warn!("Upload failed permanently: {err}");
			return Outcome::Ack;
		}

		if let Err(err) = runtime
			.ledger
			.transition(
				&request.project_name,
				&ledger_key,
				ExportState::Anonymised,
				ExportState::Exported,
				TransitionDetail::default(),
			)
			.await
		{
			return self.on_ledger_conflict(err);
		}

		// Recycle the raw copies now that the export is durable.
		for study_uid in &retrieved {
			runtime.cache.remove(study_uid);
		}

		info!("Finished message");
		Outcome::Ack
	}

	/// Queries one source and pulls every matching study into the raw
	/// cache, repairing missing instances with image-level retrieves.
	async fn query_and_retrieve(
		&self,
		request: &ExtractRequest,
		source: &dyn DicomSource,
		cancel: &CancellationToken,
	) -> Result<Vec<UI>, SourceError> {
		let runtime = &self.runtime;
		let query = request.study_uid.as_ref().map_or_else(
			|| StudyQuery::ByMrnAccession {
				mrn: request.mrn.clone(),
				accession: request.accession_number.clone(),
			},
			|uid| StudyQuery::ByUid(uid.clone()),
		);

		// The token governs initiation; it is not held over the transfer.
		let permit = runtime.limiter.initiate(source.kind(), cancel).await;
		let manifests = match permit {
			Ok(_permit) => source.query_study(&query, cancel).await?,
			Err(LimiterError::Cancelled | LimiterError::Closed) => {
				return Err(SourceError::Cancelled)
			}
			Err(LimiterError::UnknownSource(_)) => return Ok(Vec::new()),
		};

		if manifests.is_empty() {
			return Ok(Vec::new());
		}

		let priority = DimsePriority::from(request.priority);
		let mut retrieved = Vec::with_capacity(manifests.len());

		for manifest in manifests {
			let study_uid = manifest.study_uid.clone();
			debug!(study_uid, "Retrieving study");

			let expected = {
				let _permit = runtime.limiter.initiate(source.kind(), cancel).await
					.map_err(|_| SourceError::Cancelled)?;
				source.list_instances(&study_uid, cancel).await?
			};
			if !expected.is_empty() {
				runtime.cache.set_expected(&study_uid, expected);
			}

			{
				let _permit = runtime.limiter.initiate(source.kind(), cancel).await
					.map_err(|_| SourceError::Cancelled)?;
				source.retrieve_study(&study_uid, priority, cancel).await?;
			}

			// Missing-instance repair: image-level C-MOVE for stragglers.
			for round in 0..MAX_REPAIR_ROUNDS {
				let missing = runtime.cache.missing_instances(&study_uid);
				if missing.is_empty() {
					break;
				}
				warn!(
					study_uid,
					missing = missing.len(),
					round,
					"Repairing incomplete transfer"
				);
				let _permit = runtime.limiter.initiate(source.kind(), cancel).await
					.map_err(|_| SourceError::Cancelled)?;
				source
					.retrieve_instances(&study_uid, &missing, priority, cancel)
					.await?;
			}

			retrieved.push(study_uid);
		}

		Ok(retrieved)
	}

	async fn mark_failed(
		&self,
		request: &ExtractRequest,
		ledger_key: &str,
		reason: &str,
	) -> Outcome {
		warn!(reason, "Marking message as failed");
		let result = self
			.runtime
			.ledger
			.transition(
				&request.project_name,
				ledger_key,
				ExportState::Pending,
				ExportState::Failed,
				TransitionDetail::error(reason),
			)
			.await;
		match result {
			Ok(()) | Err(LedgerError::Conflict) => Outcome::Ack,
			Err(err) => {
				error!("Failed to record failure: {err}");
				Outcome::Requeue
			}
		}
	}

	fn on_ledger_conflict(&self, err: LedgerError) -> Outcome {
		match err {
			LedgerError::Conflict => {
				info!("Another worker advanced this study, dropping message");
				Outcome::Ack
			}
			err => {
				error!("Ledger write failed: {err}");
				Outcome::Requeue
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error(transparent)]
	Queue(#[from] QueueError),
}
