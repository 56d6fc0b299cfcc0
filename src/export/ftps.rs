//! FTPS destination (implicit TLS).
//!
//! Studies land as `<slug>/<pseudonymised-id>.zip`; tabular extracts under
//! `<slug>/<extract-datetime>/parquet/...`.

use super::{archive, secret_string, TabularExport, UploadError, UploadReceipt, Uploader};
use crate::anon::AnonymisedStudy;
use crate::secrets::{secret_name, SecretResolver};
use async_trait::async_trait;
use std::io::Cursor;
use suppaftp::native_tls::TlsConnector;
use suppaftp::{NativeTlsConnector, NativeTlsFtpStream};
use tracing::{debug, info, instrument};

pub struct FtpsUploader {
	host: String,
	port: u16,
	username: String,
	password: String,
}

impl FtpsUploader {
	/// Resolves `<prefix>--ftp--{host,port,username,password}` once for
	/// the batch.
	/// # Errors
	/// Returns an [`UploadError`] if a credential is missing.
	pub async fn from_secrets(
		secrets: &dyn SecretResolver,
		prefix: &str,
	) -> Result<Self, UploadError> {
		let fetch = |item: &'static str| {
			let name = secret_name(prefix, "ftp", item);
			async move { secrets.fetch(&name).await }
		};
		let host = secret_string(fetch("host").await?)?;
		let port = secret_string(fetch("port").await?)?
			.trim()
			.parse::<u16>()
			.map_err(|_| UploadError::Permanent(String::from("ftp port is not a number")))?;
		let username = secret_string(fetch("username").await?)?;
		let password = secret_string(fetch("password").await?)?;

		Ok(Self {
			host,
			port,
			username,
			password,
		})
	}

	/// Opens an implicit-TLS control connection and logs in. The blocking
	/// FTP client runs on the blocking thread pool.
	fn connect(&self) -> Result<NativeTlsFtpStream, UploadError> {
		let connector = TlsConnector::new()
			.map_err(|err| UploadError::Permanent(format!("TLS setup failed: {err}")))?;
		let mut ftp = NativeTlsFtpStream::connect_secure_implicit(
			format!("{}:{}", self.host, self.port),
			NativeTlsConnector::from(connector),
			&self.host,
		)
		.map_err(|err| UploadError::Transient(format!("FTPS connect failed: {err}")))?;

		ftp.login(&self.username, &self.password)
			.map_err(|err| UploadError::Permanent(format!("FTPS login failed: {err}")))?;
		Ok(ftp)
	}

	/// Changes into `directory`, creating it if needed.
	fn create_and_enter(
		ftp: &mut NativeTlsFtpStream,
		directory: &str,
	) -> Result<(), UploadError> {
		if ftp.cwd(directory).is_ok() {
			return Ok(());
		}
		ftp.mkdir(directory)
			.map_err(|err| UploadError::Transient(format!("mkdir {directory} failed: {err}")))?;
		ftp.cwd(directory)
			.map_err(|err| UploadError::Transient(format!("cwd {directory} failed: {err}")))?;
		Ok(())
	}

	fn store(
		ftp: &mut NativeTlsFtpStream,
		file_name: &str,
		bytes: &[u8],
	) -> Result<(), UploadError> {
		debug!("Running STOR {file_name}");
		ftp.put_file(file_name, &mut Cursor::new(bytes))
			.map_err(|err| UploadError::Transient(format!("STOR {file_name} failed: {err}")))?;
		Ok(())
	}
}

#[async_trait]
impl Uploader for FtpsUploader {
	#[instrument(skip_all, fields(project = project_slug))]
	async fn upload_study(
		&self,
		project_slug: &str,
		study: &AnonymisedStudy,
	) -> Result<UploadReceipt, UploadError> {
		let zip_bytes = archive::zip_study(&study.instances)?;
		let file_name = format!("{}.zip", study.pseudo_patient_id);
		let location = format!("{project_slug}/{file_name}");
		info!("Starting FTPS upload of '{}'", study.pseudo_patient_id);

		let this = self.clone_config();
		let slug = String::from(project_slug);
		tokio::task::spawn_blocking(move || {
			let mut ftp = this.connect()?;
			Self::create_and_enter(&mut ftp, &slug)?;
			Self::store(&mut ftp, &file_name, &zip_bytes)?;
			let _ = ftp.quit();
			Ok::<(), UploadError>(())
		})
		.await
		.map_err(|err| UploadError::Permanent(format!("upload task panicked: {err}")))??;

		info!("Finished FTPS upload of '{}'", study.pseudo_patient_id);
		Ok(UploadReceipt {
			destination: String::from("ftps"),
			location,
		})
	}

	#[instrument(skip_all, fields(project = export.project_slug))]
	async fn upload_tabular(&self, export: &TabularExport) -> Result<UploadReceipt, UploadError> {
		info!("Starting FTPS upload of tabular extract");
		let this = self.clone_config();
		let slug = export.project_slug.clone();
		let extract = export.extract_time_slug.clone();
		let files: Vec<(String, Vec<u8>)> = export
			.files
			.iter()
			.map(|file| (file.relative_path.clone(), file.bytes.clone()))
			.collect();

		let location = format!("{slug}/{extract}/parquet");
		tokio::task::spawn_blocking(move || {
			let mut ftp = this.connect()?;
			Self::create_and_enter(&mut ftp, &slug)?;
			Self::create_and_enter(&mut ftp, &extract)?;
			Self::create_and_enter(&mut ftp, "parquet")?;

			for (relative_path, bytes) in files {
				// Recreate intermediate directories below parquet/.
				let mut depth = 0;
				let mut parts = relative_path.split('/').peekable();
				while let Some(part) = parts.next() {
					if parts.peek().is_some() {
						Self::create_and_enter(&mut ftp, part)?;
						depth += 1;
					} else {
						Self::store(&mut ftp, part, &bytes)?;
					}
				}
				for _ in 0..depth {
					ftp.cdup().map_err(|err| {
						UploadError::Transient(format!("cdup failed: {err}"))
					})?;
				}
			}
			let _ = ftp.quit();
			Ok::<(), UploadError>(())
		})
		.await
		.map_err(|err| UploadError::Permanent(format!("upload task panicked: {err}")))??;

		info!("Finished FTPS upload of tabular extract");
		Ok(UploadReceipt {
			destination: String::from("ftps"),
			location,
		})
	}

	async fn close(&self) -> Result<(), UploadError> {
		// Connections are per-call; nothing outlives the batch.
		Ok(())
	}
}

impl FtpsUploader {
	fn clone_config(&self) -> Self {
		Self {
			host: self.host.clone(),
			port: self.port,
			username: self.username.clone(),
			password: self.password.clone(),
		}
	}
}
