//! Move service class user. Transfers are directed at the raw-cache store
//! SCP via its application entity title.

use crate::dimse::association::pool::{AssociationPool, PoolError, PresentationParameter};
use crate::dimse::association::AssociationError;
use crate::dimse::{
	status_type, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, DATA_SET_EXISTS,
};
use crate::types::{AE, DimsePriority, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, trace};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// Sub-operation counters reported by the final C-MOVE-RSP.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveOutcome {
	pub completed: u16,
	pub failed: u16,
	pub warnings: u16,
}

pub struct MoveScuOptions {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: DimsePriority,
	pub destination: AE,
}

pub struct MoveScu {
	pool: AssociationPool,
	timeout: Duration,
}

impl MoveScu {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Issues the C-MOVE and waits until the peer reports completion,
	/// collecting the sub-operation counters along the way.
	/// # Errors
	/// Returns a [`MoveError`] on wire failures, cancellation, or a
	/// non-successful final status.
	#[instrument(skip_all, name = "MOVE-SCU")]
	pub async fn invoke(&self, options: MoveScuOptions) -> Result<MoveOutcome, MoveError> {
		let association = self
			.pool
			.get(PresentationParameter {
				abstract_syntax_uid: UI::from(
					uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
				),
				transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			})
			.await?;

		let request = CompositeMoveRequest {
			identifier: options.identifier,
			message_id: options.message_id,
			priority: options.priority as US,
			destination: options.destination,
		};
		association.write_message(request, self.timeout).await?;
		trace!("Sent C-MOVE-RQ");

		let mut outcome = MoveOutcome::default();
		loop {
			let response = association.read_message(self.timeout).await?;
			trace!("Received C-MOVE-RSP");

			outcome = Self::read_counters(&response.command).unwrap_or(outcome);

			match status_type(&response.command) {
				StatusType::Success => {
					info!(
						completed = outcome.completed,
						failed = outcome.failed,
						"C-MOVE completed"
					);
					break;
				}
				StatusType::Pending => {
					trace!(completed = outcome.completed, "C-MOVE is pending");
				}
				StatusType::Cancel => return Err(MoveError::Cancelled),
				StatusType::Warning => {
					// Some sub-operations failed but the peer kept going.
					info!(
						completed = outcome.completed,
						failed = outcome.failed,
						"C-MOVE completed with warnings"
					);
					break;
				}
				StatusType::Failure => {
					error!("C-MOVE sub-operation failed");
					return Err(MoveError::OperationFailed);
				}
			}
		}
		Ok(outcome)
	}

	fn read_counters(command: &InMemDicomObject) -> Option<MoveOutcome> {
		let read = |tag| {
			command
				.get(tag)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok)
		};
		Some(MoveOutcome {
			completed: read(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
			failed: read(tags::NUMBER_OF_FAILED_SUBOPERATIONS).unwrap_or(0),
			warnings: read(tags::NUMBER_OF_WARNING_SUBOPERATIONS).unwrap_or(0),
		})
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
	#[error("Sub-operation failed")]
	OperationFailed,
	#[error("C-MOVE operation was canceled")]
	Cancelled,
}

impl MoveError {
	pub fn is_timeout(&self) -> bool {
		use crate::dimse::association::ChannelError;
		matches!(
			self,
			Self::Read(ReadError::Association(AssociationError::Channel(
				ChannelError::Timeout
			))) | Self::Write(WriteError::Association(AssociationError::Channel(
				ChannelError::Timeout
			))) | Self::Association(PoolError::Timeout)
		)
	}
}
