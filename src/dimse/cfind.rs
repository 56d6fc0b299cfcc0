//! Find service class user against the study root information model.

use crate::dimse::association::pool::{AssociationPool, PoolError, PresentationParameter};
use crate::dimse::association::AssociationError;
use crate::dimse::{
	status_type, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, DATA_SET_EXISTS,
};
use crate::types::{DimsePriority, UI, US};
use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

pub struct FindScuOptions {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: DimsePriority,
}

pub struct FindScu {
	pool: AssociationPool,
	timeout: Duration,
}

impl FindScu {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Streams matching identifiers until the final (non-pending) response
	/// arrives.
	pub fn invoke(
		&self,
		options: FindScuOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		let presentation = PresentationParameter {
			abstract_syntax_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};

		try_stream! {
			let association = self.pool.get(presentation).await?;
			let request = CompositeFindRequest {
				identifier: options.identifier,
				message_id: options.message_id,
				priority: options.priority as US,
				affected_sop_class_uid: UI::from(
					uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
				),
			};
			association.write_message(request, self.timeout).await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let status = status_type(&response.command);
				let response = CompositeFindResponse::try_from(response)?;
				trace!("Received C-FIND-RSP");

				if let Some(data) = response.data {
					yield data;
				}

				if status != StatusType::Pending {
					break;
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
}

impl FindError {
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
