//! DICOMweb destination: STOW-RS over HTTP.

use super::{secret_string, TabularExport, UploadError, UploadReceipt, Uploader};
use crate::anon::AnonymisedStudy;
use crate::secrets::{secret_name, SecretResolver};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

const BOUNDARY: &str = "pixl-stow-boundary";

pub struct DicomWebUploader {
	endpoint_url: String,
	username: String,
	password: String,
	http: reqwest::Client,
}

impl DicomWebUploader {
	/// Resolves `<prefix>--dicomweb--{url,username,password}` once for the
	/// batch.
	/// # Errors
	/// Returns an [`UploadError`] if a credential is missing.
	pub async fn from_secrets(
		secrets: &dyn SecretResolver,
		prefix: &str,
		http: reqwest::Client,
	) -> Result<Self, UploadError> {
		let fetch = |item: &'static str| {
			let name = secret_name(prefix, "dicomweb", item);
			async move { secrets.fetch(&name).await }
		};
		Ok(Self {
			endpoint_url: secret_string(fetch("url").await?)?
				.trim_end_matches('/')
				.to_owned(),
			username: secret_string(fetch("username").await?)?,
			password: secret_string(fetch("password").await?)?,
			http,
		})
	}

	/// Builds a `multipart/related` body with one `application/dicom` part
	/// per instance.
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.5.html>
	fn stow_body(study: &AnonymisedStudy) -> Result<Vec<u8>, UploadError> {
		let mut body = Vec::new();
		for instance in &study.instances {
			let mut encoded = Vec::new();
			instance
				.write_all(&mut encoded)
				.map_err(|err| UploadError::Permanent(format!("encode failed: {err}")))?;

			body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
			body.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
			body.extend_from_slice(&encoded);
			body.extend_from_slice(b"\r\n");
		}
		body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
		Ok(body)
	}
}

#[async_trait]
impl Uploader for DicomWebUploader {
	#[instrument(skip_all, fields(project = project_slug))]
	async fn upload_study(
		&self,
		project_slug: &str,
		study: &AnonymisedStudy,
	) -> Result<UploadReceipt, UploadError> {
		let url = format!("{}/studies", self.endpoint_url);
		info!(
			instances = study.instances.len(),
			"Sending study via STOW-RS"
		);

		let body = Self::stow_body(study)?;
		let response = self
			.http
			.post(&url)
			.basic_auth(&self.username, Some(&self.password))
			.header(
				reqwest::header::CONTENT_TYPE,
				format!("multipart/related; type=\"application/dicom\"; boundary={BOUNDARY}"),
			)
			.header(reqwest::header::ACCEPT, "application/dicom+json")
			.body(body)
			.send()
			.await
			.map_err(|err| UploadError::Transient(format!("STOW-RS request failed: {err}")))?;

		let status = response.status();
		if status.is_success() {
			debug!("STOW-RS accepted study");
			Ok(UploadReceipt {
				destination: String::from("dicomweb"),
				location: format!("{url} ({})", study.anon_study_uid),
			})
		} else if status.is_server_error() {
			Err(UploadError::Transient(format!(
				"STOW-RS returned {status}"
			)))
		} else {
			Err(UploadError::Permanent(format!(
				"STOW-RS returned {status}"
			)))
		}
	}

	async fn upload_tabular(&self, _export: &TabularExport) -> Result<UploadReceipt, UploadError> {
		Err(UploadError::Unsupported)
	}

	async fn close(&self) -> Result<(), UploadError> {
		// The endpoint is configured per batch; cached credentials die
		// with this value.
		debug!("Tearing down DICOMweb batch");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::UI;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::{tags, uids};
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

	#[test]
	fn stow_body_has_one_part_per_instance_and_final_boundary() {
		let instance = InMemDicomObject::from_element_iter([DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3.1"),
		)])
		.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
				.media_storage_sop_instance_uid("1.2.3.1")
				.transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
				.build()
				.unwrap(),
		);

		let study = AnonymisedStudy {
			anon_study_uid: UI::from("2.25.1"),
			pseudo_patient_id: String::from("pseudo"),
			instances: vec![instance.clone(), instance],
			skipped: Vec::new(),
		};

		let body = DicomWebUploader::stow_body(&study).unwrap();
		let text = String::from_utf8_lossy(&body);
		assert_eq!(text.matches("Content-Type: application/dicom").count(), 2);
		assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
	}
}
