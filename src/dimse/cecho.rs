//! Verification SOP class user, used to probe association health.

use crate::dimse::association::client::ClientAssociation;
use crate::dimse::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, DATA_SET_MISSING,
};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace};

const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;

/// C-ECHO-RQ
#[derive(Debug)]
struct CompositeEchoRequest {
	message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
struct CompositeEchoResponse {
	status: US,
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(Self::Error::MissingAttribute(tags::STATUS))?;

		Ok(Self { status })
	}
}

/// Sends a C-ECHO-RQ and waits for the C-ECHO-RSP whose Status attribute
/// indicates the connection state.
pub struct EchoScu<'a> {
	association: &'a ClientAssociation,
}

impl<'a> EchoScu<'a> {
	pub const fn new(association: &'a ClientAssociation) -> Self {
		Self { association }
	}

	/// # Errors
	/// Returns an [`EchoError`] if the request or response fails at the
	/// wire level.
	#[instrument(skip_all, name = "ECHO-SCU")]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		self.association.write_message(request, timeout).await?;

		let response = self.association.read_message(timeout).await?;
		let response = CompositeEchoResponse::try_from(response)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);
		debug!(
			status = response.status,
			"Received C-ECHO-RSP ({status_type:?})"
		);
		Ok(status_type == StatusType::Success)
	}
}

#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
