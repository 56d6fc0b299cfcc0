//! Store service class provider feeding the raw cache.
//!
//! Every C-STORE-RQ received from an upstream node is acknowledged and the
//! decoded instance is handed to the configured [`InstanceSink`]. The sink
//! owns the ingestion semantics; the SCP only speaks the protocol.

use crate::config::StoreScpConfig;
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::{DicomMessage, DicomMessageReader, DicomMessageWriter, DATA_SET_MISSING};
use crate::types::{UI, US};
use anyhow::Context;
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// A decoded instance as it arrived over the wire.
pub struct ReceivedInstance {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub file: FileDicomObject<InMemDicomObject>,
}

/// Receives every instance the SCP acknowledges. Implemented by the raw
/// cache coordinator.
#[async_trait]
pub trait InstanceSink: Send + Sync {
	async fn on_instance(&self, instance: ReceivedInstance) -> anyhow::Result<()>;
}

pub struct StoreScp {
	inner: Arc<InnerStoreScp>,
}

struct InnerStoreScp {
	sink: Arc<dyn InstanceSink>,
	config: StoreScpConfig,
}

impl StoreScp {
	pub fn new(sink: Arc<dyn InstanceSink>, config: StoreScpConfig) -> Self {
		Self {
			inner: Arc::new(InnerStoreScp { sink, config }),
		}
	}

	/// Accepts incoming associations until the cancellation signal fires.
	/// # Errors
	/// Returns an error if the listener cannot bind.
	#[instrument(skip_all, name = "STORE-SCP")]
	pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started store service class provider on {}", address);

		loop {
			tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						debug!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&self.inner);
						tokio::spawn(async move {
							if let Err(err) = Self::process(stream, inner).await {
								error!("Store association ended with error: {err}");
							}
						});
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				},
				() = cancel.cancelled() => {
					info!("Store service class provider shutting down");
					return Ok(());
				}
			}
		}
	}

	async fn process(stream: TcpStream, inner: Arc<InnerStoreScp>) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The dicom-ul transport uses blocking reads; the actual IO happens
		// on the ServerAssociation thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;

		// Duration::MAX to indefinitely wait for incoming messages.
		while let Ok(message) = association.read_message(Duration::MAX).await {
			let pctx_id = message.presentation_context_id;
			let pctx = association
				.presentation_contexts()
				.iter()
				.find(|pctx| Some(pctx.id) == pctx_id)
				.or_else(|| association.presentation_contexts().first())
				.context("No presentation context available")?;

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok)
				.context("Missing tag COMMAND_FIELD (0000,0100)")?;

			if command_field != COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
				anyhow::bail!("Unexpected Command Field. Only C-STORE-RQ is supported.");
			}

			let message_id = message
				.command
				.get(tags::MESSAGE_ID)
				.map(InMemElement::to_int)
				.and_then(Result::ok)
				.unwrap_or(0);

			let sop_class_uid = message
				.command
				.get(tags::AFFECTED_SOP_CLASS_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;

			let sop_instance_uid = message
				.command
				.get(tags::AFFECTED_SOP_INSTANCE_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

			debug!("Received instance {} ({})", sop_instance_uid, sop_class_uid);

			let data = message
				.data
				.as_ref()
				.context("C-STORE-RQ without a data set")?
				.clone();

			let file = data.with_exact_meta(
				FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(sop_class_uid.as_ref())
					.media_storage_sop_instance_uid(sop_instance_uid.as_ref())
					.transfer_syntax(&pctx.transfer_syntax)
					.build()
					.context("FileMetaTableBuilder should contain required data")?,
			);

			let response = CompositeStoreResponse {
				sop_instance_uid: UI::from(sop_instance_uid.clone()),
				sop_class_uid: UI::from(sop_class_uid.clone()),
				message_id,
			};
			association
				.write_message(response, Duration::from_secs(10))
				.await?;

			let received = ReceivedInstance {
				sop_class_uid: UI::from(sop_class_uid),
				sop_instance_uid: UI::from(sop_instance_uid),
				file,
			};
			if let Err(err) = inner.sink.on_instance(received).await {
				// Stop receiving from this peer; the transfer will be
				// repaired from the C-FIND manifest.
				error!("Instance sink rejected stored instance: {err}");
				break;
			}
		}
		Ok(())
	}
}
