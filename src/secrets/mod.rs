//! Resolution of project salts and destination credentials.
//!
//! Secret names follow the `<alias>--<service>--<item>` convention, e.g.
//! `myproject--dicomweb--password` or `myproject--salt`. Salts are created
//! on first use.

use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Length of a generated project salt in bytes. Matches the maximum BLAKE2b
/// key length.
pub const SALT_LENGTH: usize = 64;

pub fn secret_name(prefix: &str, service: &str, item: &str) -> String {
	format!("{prefix}--{service}--{item}")
}

pub fn salt_name(prefix: &str) -> String {
	format!("{prefix}--salt")
}

#[async_trait]
pub trait SecretResolver: Send + Sync {
	/// Fetches a named secret.
	async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError>;

	/// Stores a named secret, overwriting any previous value.
	async fn store(&self, name: &str, value: &[u8]) -> Result<(), SecretError>;
}

/// Returns the project salt, generating and persisting a fresh 64-byte key
/// if none exists yet. `fixed` short-circuits both (single-project
/// deployments configured via `SALT_VALUE`).
/// # Errors
/// Returns a [`SecretError`] if the underlying store fails for a reason
/// other than the salt not existing yet.
pub async fn resolve_project_salt(
	resolver: &dyn SecretResolver,
	prefix: &str,
	fixed: Option<&str>,
) -> Result<Vec<u8>, SecretError> {
	if let Some(fixed) = fixed {
		return Ok(fixed.as_bytes().to_vec());
	}

	let name = salt_name(prefix);
	match resolver.fetch(&name).await {
		Ok(salt) => Ok(salt),
		Err(SecretError::NotFound(_)) => {
			info!(name, "Creating project salt on first use");
			let mut salt = vec![0_u8; SALT_LENGTH];
			rand::thread_rng().fill_bytes(&mut salt);
			resolver.store(&name, &salt).await?;
			Ok(salt)
		}
		Err(err) => Err(err),
	}
}

/// In-memory store for tests and single-shot runs.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
	secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemorySecretStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(secrets: &[(&str, &[u8])]) -> Self {
		let store = Self::new();
		{
			let mut guard = store.secrets.lock().unwrap();
			for (name, value) in secrets {
				guard.insert(String::from(*name), value.to_vec());
			}
		}
		store
	}
}

#[async_trait]
impl SecretResolver for InMemorySecretStore {
	async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError> {
		self.secrets
			.lock()
			.unwrap()
			.get(name)
			.cloned()
			.ok_or_else(|| SecretError::NotFound(String::from(name)))
	}

	async fn store(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
		self.secrets
			.lock()
			.unwrap()
			.insert(String::from(name), value.to_vec());
		Ok(())
	}
}

/// File-backed store: one file per secret under a directory with
/// owner-only permissions. Suitable for local deployments without a key
/// vault.
pub struct LocalFileSecretStore {
	dir: PathBuf,
}

impl LocalFileSecretStore {
	/// # Errors
	/// Returns a [`SecretError`] if the directory cannot be created.
	pub fn new(dir: PathBuf) -> Result<Self, SecretError> {
		std::fs::create_dir_all(&dir).map_err(|err| SecretError::Backend(err.to_string()))?;
		Ok(Self { dir })
	}

	fn path(&self, name: &str) -> Result<PathBuf, SecretError> {
		// Secret names are broker/vault identifiers, never paths.
		if name.contains(['/', '\\']) || name.contains("..") {
			return Err(SecretError::Backend(format!("invalid secret name {name}")));
		}
		Ok(self.dir.join(name))
	}
}

#[async_trait]
impl SecretResolver for LocalFileSecretStore {
	async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError> {
		let path = self.path(name)?;
		match tokio::fs::read(&path).await {
			Ok(value) => {
				debug!(name, "Fetched secret from local store");
				Ok(value)
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				Err(SecretError::NotFound(String::from(name)))
			}
			Err(err) => Err(SecretError::Backend(err.to_string())),
		}
	}

	async fn store(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
		let path = self.path(name)?;
		tokio::fs::write(&path, value)
			.await
			.map_err(|err| SecretError::Backend(err.to_string()))?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let permissions = std::fs::Permissions::from_mode(0o600);
			tokio::fs::set_permissions(&path, permissions)
				.await
				.map_err(|err| SecretError::Backend(err.to_string()))?;
		}
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum SecretError {
	#[error("Secret '{0}' does not exist")]
	NotFound(String),
	#[error("Secret backend unavailable: {0}")]
	Unavailable(String),
	#[error("Secret backend error: {0}")]
	Backend(String),
}

impl SecretError {
	/// Whether a retry with backoff may succeed.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Unavailable(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn salt_is_created_on_first_use_and_reused() {
		let store = InMemorySecretStore::new();

		let first = resolve_project_salt(&store, "p1", None).await.unwrap();
		assert_eq!(first.len(), SALT_LENGTH);

		let second = resolve_project_salt(&store, "p1", None).await.unwrap();
		assert_eq!(first, second);

		let other = resolve_project_salt(&store, "p2", None).await.unwrap();
		assert_ne!(first, other);
	}

	#[tokio::test]
	async fn fixed_salt_bypasses_the_store() {
		let store = InMemorySecretStore::new();
		let salt = resolve_project_salt(&store, "p1", Some("fixed-salt"))
			.await
			.unwrap();
		assert_eq!(salt, b"fixed-salt".to_vec());
		assert!(store.fetch(&salt_name("p1")).await.is_err());
	}

	#[tokio::test]
	async fn local_store_round_trips() {
		let dir = std::env::temp_dir().join(format!("pixl-secrets-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		let store = LocalFileSecretStore::new(dir.clone()).unwrap();

		store
			.store(&secret_name("p1", "ftp", "password"), b"hunter2")
			.await
			.unwrap();
		let value = store
			.fetch(&secret_name("p1", "ftp", "password"))
			.await
			.unwrap();
		assert_eq!(value, b"hunter2");

		assert!(matches!(
			store.fetch("p1--ftp--missing").await,
			Err(SecretError::NotFound(_))
		));
		assert!(store.fetch("../escape").await.is_err());

		std::fs::remove_dir_all(&dir).unwrap();
	}
}
