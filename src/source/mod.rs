//! Query/retrieve client for one upstream DICOM node.
//!
//! Wraps the C-FIND and C-MOVE service class users with per-request
//! timeouts, bounded retries with jittered backoff, and a circuit breaker
//! that fails fast while the node is struggling.

mod breaker;

pub use breaker::{CircuitBreaker, CircuitState};

use crate::config::{DicomNodeConfig, SourcesConfig};
use crate::dimse::association::pool::{AssociationManager, AssociationPool, Pool};
use crate::dimse::cfind::{FindScu, FindScuOptions};
use crate::dimse::cmove::{MoveOutcome, MoveScu, MoveScuOptions};
use crate::dimse::next_message_id;
use crate::types::{DimsePriority, QueryRetrieveLevel, SourceKind, AE, UI};
use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::TryStreamExt;
use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_JITTER_MS: u64 = 250;

/// How a study is looked up in a source. The study UID takes precedence
/// when known.
#[derive(Debug, Clone)]
pub enum StudyQuery {
	ByUid(UI),
	ByMrnAccession { mrn: String, accession: String },
}

/// One study-level C-FIND match.
#[derive(Debug, Clone)]
pub struct StudyManifest {
	pub study_uid: UI,
	/// NumberOfStudyRelatedInstances, when the peer reports it.
	pub instance_count: Option<usize>,
}

/// The operations the scheduler needs from a DICOM source. Implemented by
/// [`SourceClient`] and by in-memory fakes in tests.
#[async_trait]
pub trait DicomSource: Send + Sync {
	fn kind(&self) -> SourceKind;

	/// Study-level C-FIND. An empty result is a miss, not an error.
	async fn query_study(
		&self,
		query: &StudyQuery,
		cancel: &CancellationToken,
	) -> Result<Vec<StudyManifest>, SourceError>;

	/// Image-level C-FIND listing the SOPInstanceUIDs of a study.
	async fn list_instances(
		&self,
		study_uid: &str,
		cancel: &CancellationToken,
	) -> Result<Vec<UI>, SourceError>;

	/// Study-level C-MOVE into the raw cache.
	async fn retrieve_study(
		&self,
		study_uid: &str,
		priority: DimsePriority,
		cancel: &CancellationToken,
	) -> Result<MoveOutcome, SourceError>;

	/// Image-level C-MOVE for a subset of instances (missing-instance
	/// repair).
	async fn retrieve_instances(
		&self,
		study_uid: &str,
		sop_instance_uids: &[UI],
		priority: DimsePriority,
		cancel: &CancellationToken,
	) -> Result<MoveOutcome, SourceError>;
}

pub struct SourceClient {
	kind: SourceKind,
	find: FindScu,
	mover: MoveScu,
	breaker: CircuitBreaker,
	/// AE title of the raw-cache store SCP that receives transfers.
	destination_aet: AE,
}

impl SourceClient {
	/// # Errors
	/// Returns a [`SourceError`] if the node address does not resolve.
	pub fn new(
		kind: SourceKind,
		node: &DicomNodeConfig,
		sources: &SourcesConfig,
		calling_aet: &str,
		destination_aet: &str,
	) -> Result<Self, SourceError> {
		let address: SocketAddr = (node.host.as_str(), node.port)
			.to_socket_addrs()
			.map_err(|err| SourceError::Address(err.to_string()))?
			.next()
			.ok_or_else(|| {
				SourceError::Address(format!("{}:{} does not resolve", node.host, node.port))
			})?;

		let manager = AssociationManager {
			address,
			calling_aet: AE::from(calling_aet),
			called_aet: node.aet.clone(),
		};
		let pool = Pool::new(
			manager,
			node.pool.size,
			Duration::from_secs(node.pool.timeout),
		);

		Ok(Self {
			kind,
			find: FindScu::new(AssociationPool::clone(&pool), sources.query_timeout()),
			mover: MoveScu::new(pool, sources.transfer_timeout()),
			breaker: CircuitBreaker::new(
				node.circuit_breaker.failure_threshold,
				Duration::from_secs(node.circuit_breaker.reset_seconds),
			),
			destination_aet: AE::from(destination_aet),
		})
	}

	pub const fn breaker(&self) -> &CircuitBreaker {
		&self.breaker
	}

	/// Runs one attempt of an idempotent operation under the circuit
	/// breaker, retrying transient failures with jittered backoff.
	async fn with_retries<T, F, Fut>(
		&self,
		operation: &str,
		cancel: &CancellationToken,
		mut attempt: F,
	) -> Result<T, SourceError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, SourceError>>,
	{
		let mut last_error = None;
		for round in 0..MAX_ATTEMPTS {
			self.breaker.check()?;

			if round > 0 {
				let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
				let backoff = BACKOFF_BASE * 2_u32.pow(round - 1) + Duration::from_millis(jitter);
				debug!(operation, round, "Backing off for {backoff:?} before retry");
				tokio::select! {
					() = tokio::time::sleep(backoff) => {}
					() = cancel.cancelled() => return Err(SourceError::Cancelled),
				}
			}

			let result = tokio::select! {
				result = attempt() => result,
				() = cancel.cancelled() => return Err(SourceError::Cancelled),
			};

			match result {
				Ok(value) => {
					self.breaker.record_success();
					return Ok(value);
				}
				Err(err) => {
					self.breaker.record_failure();
					warn!(
						source = %self.kind,
						operation,
						round,
						"Source operation failed: {err}"
					);
					if !err.is_transient() {
						return Err(err);
					}
					last_error = Some(err);
				}
			}
		}
		Err(last_error.unwrap_or(SourceError::CircuitOpen))
	}

	fn study_identifier(query: &StudyQuery) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::QUERY_RETRIEVE_LEVEL,
				VR::CS,
				PrimitiveValue::from(QueryRetrieveLevel::Study),
			),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
			DataElement::new(
				tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
				VR::IS,
				PrimitiveValue::Empty,
			),
		]);

		match query {
			StudyQuery::ByUid(study_uid) => {
				identifier.put(DataElement::new(
					tags::STUDY_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, study_uid.clone()),
				));
			}
			StudyQuery::ByMrnAccession { mrn, accession } => {
				identifier.put(DataElement::new(
					tags::PATIENT_ID,
					VR::LO,
					dicom_value!(Str, mrn.clone()),
				));
				identifier.put(DataElement::new(
					tags::ACCESSION_NUMBER,
					VR::SH,
					dicom_value!(Str, accession.clone()),
				));
			}
		}
		identifier
	}
}

#[async_trait]
impl DicomSource for SourceClient {
	fn kind(&self) -> SourceKind {
		self.kind
	}

	#[instrument(skip_all, fields(source = %self.kind))]
	async fn query_study(
		&self,
		query: &StudyQuery,
		cancel: &CancellationToken,
	) -> Result<Vec<StudyManifest>, SourceError> {
		self.with_retries("C-FIND", cancel, || async move {
			let options = FindScuOptions {
				identifier: Self::study_identifier(query),
				message_id: next_message_id(),
				priority: DimsePriority::default(),
			};

			let matches: Vec<InMemDicomObject> = self
				.find
				.invoke(options)
				.try_collect()
				.await
				.map_err(SourceError::from)?;

			let manifests = matches
				.iter()
				.filter_map(|identifier| {
					let study_uid = identifier
						.get(tags::STUDY_INSTANCE_UID)
						.map(InMemElement::to_str)
						.and_then(Result::ok)?;
					let instance_count = identifier
						.get(tags::NUMBER_OF_STUDY_RELATED_INSTANCES)
						.map(InMemElement::to_int::<i64>)
						.and_then(Result::ok)
						.and_then(|count| usize::try_from(count).ok());
					Some(StudyManifest {
						study_uid: UI::from(study_uid.trim_end_matches('\0')),
						instance_count,
					})
				})
				.collect::<Vec<_>>();

			info!(matches = manifests.len(), "Study query completed");
			Ok(manifests)
		})
		.await
	}

	#[instrument(skip_all, fields(source = %self.kind, study_uid = study_uid))]
	async fn list_instances(
		&self,
		study_uid: &str,
		cancel: &CancellationToken,
	) -> Result<Vec<UI>, SourceError> {
		self.with_retries("C-FIND(IMAGE)", cancel, || async move {
			let identifier = InMemDicomObject::from_element_iter([
				DataElement::new(
					tags::QUERY_RETRIEVE_LEVEL,
					VR::CS,
					PrimitiveValue::from(QueryRetrieveLevel::Image),
				),
				DataElement::new(
					tags::STUDY_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, UI::from(study_uid)),
				),
				DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
			]);

			let options = FindScuOptions {
				identifier,
				message_id: next_message_id(),
				priority: DimsePriority::default(),
			};

			let matches: Vec<InMemDicomObject> = self
				.find
				.invoke(options)
				.try_collect()
				.await
				.map_err(SourceError::from)?;

			Ok(matches
				.iter()
				.filter_map(|identifier| {
					identifier
						.get(tags::SOP_INSTANCE_UID)
						.map(InMemElement::to_str)
						.and_then(Result::ok)
						.map(|uid| UI::from(uid.trim_end_matches('\0')))
				})
				.collect())
		})
		.await
	}

	#[instrument(skip_all, fields(source = %self.kind, study_uid = study_uid))]
	async fn retrieve_study(
		&self,
		study_uid: &str,
		priority: DimsePriority,
		cancel: &CancellationToken,
	) -> Result<MoveOutcome, SourceError> {
		// The raw cache overwrites duplicate SOPInstanceUIDs, so replaying
		// a partially completed transfer is safe.
		self.with_retries("C-MOVE", cancel, || async move {
			let identifier = InMemDicomObject::from_element_iter([
				DataElement::new(
					tags::QUERY_RETRIEVE_LEVEL,
					VR::CS,
					PrimitiveValue::from(QueryRetrieveLevel::Study),
				),
				DataElement::new(
					tags::STUDY_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, UI::from(study_uid)),
				),
			]);

			let outcome = self
				.mover
				.invoke(MoveScuOptions {
					identifier,
					message_id: next_message_id(),
					priority,
					destination: self.destination_aet.clone(),
				})
				.await?;
			Ok(outcome)
		})
		.await
	}

	#[instrument(skip_all, fields(source = %self.kind, study_uid = study_uid))]
	async fn retrieve_instances(
		&self,
		study_uid: &str,
		sop_instance_uids: &[UI],
		priority: DimsePriority,
		cancel: &CancellationToken,
	) -> Result<MoveOutcome, SourceError> {
		let uid_list = sop_instance_uids.to_vec();
		self.with_retries("C-MOVE(IMAGE)", cancel, || {
			let uid_list = uid_list.clone();
			async move {
				let identifier = InMemDicomObject::from_element_iter([
					DataElement::new(
						tags::QUERY_RETRIEVE_LEVEL,
						VR::CS,
						PrimitiveValue::from(QueryRetrieveLevel::Image),
					),
					DataElement::new(
						tags::STUDY_INSTANCE_UID,
						VR::UI,
						dicom_value!(Str, UI::from(study_uid)),
					),
					DataElement::new(
						tags::SOP_INSTANCE_UID,
						VR::UI,
						PrimitiveValue::Strs(uid_list.into()),
					),
				]);

				let outcome = self
					.mover
					.invoke(MoveScuOptions {
						identifier,
						message_id: next_message_id(),
						priority,
						destination: self.destination_aet.clone(),
					})
					.await?;
				Ok(outcome)
			}
		})
		.await
	}
}

#[derive(Debug, Error)]
pub enum SourceError {
	#[error("Invalid source address: {0}")]
	Address(String),
	#[error("Query failed: {0}")]
	Find(#[from] crate::dimse::cfind::FindError),
	#[error("Transfer failed: {0}")]
	Move(#[from] crate::dimse::cmove::MoveError),
	#[error("Transfer timed out")]
	TransferTimeout,
	#[error("Circuit breaker is open")]
	CircuitOpen,
	#[error("Operation was cancelled")]
	Cancelled,
}

impl SourceError {
	/// Whether another attempt may succeed.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::TransferTimeout => true,
			Self::Find(err) => err.is_timeout(),
			Self::Move(err) => err.is_timeout(),
			Self::Address(_) | Self::CircuitOpen | Self::Cancelled => false,
		}
	}
}
