//! XNAT destination: DICOM-zip import into the project with the same id as
//! the project slug.

use super::{archive, secret_string, TabularExport, UploadError, UploadReceipt, Uploader};
use crate::anon::AnonymisedStudy;
use crate::config::ExportConfig;
use crate::project::{XnatDestination, XnatDestinationOptions, XnatOverwrite};
use crate::secrets::{secret_name, SecretResolver};
use async_trait::async_trait;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy)]
pub struct XnatOptions {
	pub overwrite: XnatOverwrite,
	pub destination: XnatDestination,
}

impl XnatOptions {
	/// Project options win; the process-wide `XNAT_OVERWRITE` and
	/// `XNAT_DESTINATION` values fill the gaps.
	pub fn resolve(project: &XnatDestinationOptions, fallback: &ExportConfig) -> Self {
		let overwrite = match fallback.xnat_overwrite.as_deref() {
			Some("append") => XnatOverwrite::Append,
			Some("delete") => XnatOverwrite::Delete,
			_ => XnatOverwrite::None,
		};
		let destination = match fallback.xnat_destination.as_deref() {
			Some("prearchive") => XnatDestination::Prearchive,
			_ => XnatDestination::Archive,
		};
		Self {
			overwrite: if project.overwrite == XnatOverwrite::None {
				overwrite
			} else {
				project.overwrite
			},
			destination: if project.destination == XnatDestination::Archive {
				destination
			} else {
				project.destination
			},
		}
	}
}

pub struct XnatUploader {
	base_url: String,
	username: String,
	password: String,
	options: XnatOptions,
	http: reqwest::Client,
}

impl XnatUploader {
	/// Resolves `<prefix>--xnat--{host,port,username,password}` once for
	/// the batch.
	/// # Errors
	/// Returns an [`UploadError`] if a credential is missing.
	pub async fn from_secrets(
		secrets: &dyn SecretResolver,
		prefix: &str,
		http: reqwest::Client,
		options: XnatOptions,
	) -> Result<Self, UploadError> {
		let fetch = |item: &'static str| {
			let name = secret_name(prefix, "xnat", item);
			async move { secrets.fetch(&name).await }
		};
		let host = secret_string(fetch("host").await?)?;
		let port = secret_string(fetch("port").await?)?
			.trim()
			.parse::<u16>()
			.map_err(|_| UploadError::Permanent(String::from("xnat port is not a number")))?;

		Ok(Self {
			base_url: format!("https://{host}:{port}"),
			username: secret_string(fetch("username").await?)?,
			password: secret_string(fetch("password").await?)?,
			options,
			http,
		})
	}
}

#[async_trait]
impl Uploader for XnatUploader {
	#[instrument(skip_all, fields(project = project_slug))]
	async fn upload_study(
		&self,
		project_slug: &str,
		study: &AnonymisedStudy,
	) -> Result<UploadReceipt, UploadError> {
		let zip_bytes = archive::zip_study(&study.instances)?;
		info!(
			"Starting XNAT upload of '{}' to {}",
			study.pseudo_patient_id, self.options.destination
		);

		let mut url = format!(
			"{}/data/services/import?project={project_slug}&subject={}&session={}&dest={}&import-handler=DICOM-zip&inbody=true",
			self.base_url,
			study.pseudo_patient_id,
			study.anon_study_uid,
			self.options.destination,
		);
		if self.options.overwrite != XnatOverwrite::None {
			url.push_str(&format!("&overwrite={}", self.options.overwrite));
		}

		let response = self
			.http
			.post(&url)
			.basic_auth(&self.username, Some(&self.password))
			.header(reqwest::header::CONTENT_TYPE, "application/zip")
			.body(zip_bytes)
			.send()
			.await
			.map_err(|err| UploadError::Transient(format!("XNAT import failed: {err}")))?;

		let status = response.status();
		if status.is_success() {
			info!("Finished XNAT upload of '{}'", study.pseudo_patient_id);
			Ok(UploadReceipt {
				destination: String::from("xnat"),
				location: format!("{project_slug}{}", self.options.destination),
			})
		} else if status.is_server_error() {
			Err(UploadError::Transient(format!("XNAT returned {status}")))
		} else {
			Err(UploadError::Permanent(format!("XNAT returned {status}")))
		}
	}

	async fn upload_tabular(&self, _export: &TabularExport) -> Result<UploadReceipt, UploadError> {
		Err(UploadError::Unsupported)
	}

	async fn close(&self) -> Result<(), UploadError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn project_options_override_process_fallbacks() {
		let fallback = ExportConfig {
			xnat_overwrite: Some(String::from("delete")),
			xnat_destination: Some(String::from("prearchive")),
		};

		let project = XnatDestinationOptions {
			overwrite: XnatOverwrite::Append,
			destination: XnatDestination::Prearchive,
		};
		let options = XnatOptions::resolve(&project, &fallback);
		assert_eq!(options.overwrite, XnatOverwrite::Append);
		assert_eq!(options.destination, XnatDestination::Prearchive);

		let defaults = XnatDestinationOptions::default();
		let options = XnatOptions::resolve(&defaults, &fallback);
		assert_eq!(options.overwrite, XnatOverwrite::Delete);
		assert_eq!(options.destination, XnatDestination::Prearchive);
	}
}
