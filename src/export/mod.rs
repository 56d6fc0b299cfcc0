//! Routing of anonymised studies to their configured destination.
//!
//! Every destination implements the same capability interface; the router
//! selects and configures one per export batch. Credentials are resolved
//! from the secret store when the batch starts and dropped when it closes.

pub mod archive;
mod dicomweb;
mod ftps;
mod xnat;

pub use dicomweb::DicomWebUploader;
pub use ftps::FtpsUploader;
pub use xnat::XnatUploader;

use crate::anon::AnonymisedStudy;
use crate::config::ExportConfig;
use crate::project::{DicomDestination, ParquetDestination, Project};
use crate::secrets::{SecretError, SecretResolver};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// One file of a tabular (parquet) extract, with its path relative to the
/// `parquet/` root on the destination.
pub struct TabularFile {
	pub relative_path: String,
	pub bytes: Vec<u8>,
}

/// A tabular extract upload: lands under
/// `<slug>/<extract-time>/parquet/...`.
pub struct TabularExport {
	pub project_slug: String,
	pub extract_time_slug: String,
	pub files: Vec<TabularFile>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
	pub destination: String,
	pub location: String,
}

/// Capability interface every destination implements.
#[async_trait]
pub trait Uploader: Send + Sync {
	async fn upload_study(
		&self,
		project_slug: &str,
		study: &AnonymisedStudy,
	) -> Result<UploadReceipt, UploadError>;

	async fn upload_tabular(&self, export: &TabularExport) -> Result<UploadReceipt, UploadError>;

	/// Tears down per-batch state (cached credentials, dynamically
	/// configured endpoints).
	async fn close(&self) -> Result<(), UploadError>;
}

pub struct ExportRouter {
	secrets: Arc<dyn SecretResolver>,
	http: reqwest::Client,
	export_config: ExportConfig,
}

impl ExportRouter {
	pub fn new(secrets: Arc<dyn SecretResolver>, export_config: ExportConfig) -> Self {
		Self {
			secrets,
			http: reqwest::Client::new(),
			export_config,
		}
	}

	/// Builds the uploader for one export batch of a project's DICOM
	/// destination. `None` destinations yield no uploader.
	/// # Errors
	/// Returns an [`UploadError`] if credentials cannot be resolved.
	pub async fn dicom_uploader(
		&self,
		project: &Project,
	) -> Result<Option<Box<dyn Uploader>>, UploadError> {
		let destination = project.destination();
		let prefix = project.keyvault_prefix();

		let uploader: Box<dyn Uploader> = match destination.dicom {
			DicomDestination::None => {
				info!(project = project.slug, "No DICOM destination configured");
				return Ok(None);
			}
			DicomDestination::Ftps => {
				Box::new(FtpsUploader::from_secrets(self.secrets.as_ref(), prefix).await?)
			}
			DicomDestination::Dicomweb => Box::new(
				DicomWebUploader::from_secrets(
					self.secrets.as_ref(),
					prefix,
					self.http.clone(),
				)
				.await?,
			),
			DicomDestination::Xnat => Box::new(
				XnatUploader::from_secrets(
					self.secrets.as_ref(),
					prefix,
					self.http.clone(),
					xnat::XnatOptions::resolve(&destination.xnat, &self.export_config),
				)
				.await?,
			),
		};
		Ok(Some(uploader))
	}

	/// Builds the uploader for a project's tabular destination.
	/// # Errors
	/// Returns an [`UploadError`] if credentials cannot be resolved.
	pub async fn tabular_uploader(
		&self,
		project: &Project,
	) -> Result<Option<Box<dyn Uploader>>, UploadError> {
		match project.destination().parquet {
			ParquetDestination::None => Ok(None),
			ParquetDestination::Ftps => {
				let prefix = project.keyvault_prefix();
				Ok(Some(Box::new(
					FtpsUploader::from_secrets(self.secrets.as_ref(), prefix).await?,
				)))
			}
		}
	}
}

/// What the scheduler needs from the export side: one call per export
/// batch. Implemented by [`ExportRouter`] and by recording fakes in tests.
#[async_trait]
pub trait StudyExporter: Send + Sync {
	/// Uploads one anonymised study to the project's DICOM destination.
	/// `Ok(None)` means the project has no DICOM destination.
	async fn export_study(
		&self,
		project: &Project,
		study: &AnonymisedStudy,
	) -> Result<Option<UploadReceipt>, UploadError>;
}

#[async_trait]
impl StudyExporter for ExportRouter {
	async fn export_study(
		&self,
		project: &Project,
		study: &AnonymisedStudy,
	) -> Result<Option<UploadReceipt>, UploadError> {
		match self.dicom_uploader(project).await? {
			None => Ok(None),
			Some(uploader) => upload_and_close(uploader, &project.slug, study)
				.await
				.map(Some),
		}
	}
}

/// Runs one upload through an uploader, always closing the batch.
/// # Errors
/// Propagates the upload error after teardown.
pub async fn upload_and_close(
	uploader: Box<dyn Uploader>,
	project_slug: &str,
	study: &AnonymisedStudy,
) -> Result<UploadReceipt, UploadError> {
	let result = uploader.upload_study(project_slug, study).await;
	if let Err(err) = uploader.close().await {
		warn!("Failed to tear down upload batch: {err}");
	}
	result
}

#[derive(Debug, Error)]
pub enum UploadError {
	#[error(transparent)]
	Secret(#[from] SecretError),
	#[error("Upload failed (transient): {0}")]
	Transient(String),
	#[error("Upload failed: {0}")]
	Permanent(String),
	#[error("Failed to package study: {0}")]
	Archive(#[from] archive::ArchiveError),
	#[error("Destination does not support this payload")]
	Unsupported,
}

impl UploadError {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_))
			|| matches!(self, Self::Secret(err) if err.is_transient())
	}
}

pub(crate) fn secret_string(value: Vec<u8>) -> Result<String, UploadError> {
	String::from_utf8(value)
		.map_err(|_| UploadError::Permanent(String::from("secret is not valid UTF-8")))
}
