//! Deterministic UID regeneration.
//!
//! A regenerated UID is `<org-root>.<decimal digest>` where the digest is
//! the keyed BLAKE2 of the original UID under the project salt, so the same
//! original always maps to the same replacement within one project, across
//! instances and across runs.

use crate::hashing::{self, HashError};
use crate::types::UI;
use std::collections::HashMap;

/// DICOM UIDs are limited to 64 characters.
const UID_MAX_LENGTH: usize = 64;

/// Per-study UID rewrite map. Confined to one worker; lookups are memoised
/// so every occurrence of an original UID rewrites identically.
pub struct UidMap {
	org_root: String,
	salt: Vec<u8>,
	map: HashMap<UI, UI>,
}

impl UidMap {
	pub fn new(org_root: &str, salt: &[u8]) -> Self {
		Self {
			org_root: org_root.trim_end_matches('.').to_owned(),
			salt: salt.to_vec(),
			map: HashMap::new(),
		}
	}

	/// Returns the replacement for an original UID, computing and caching
	/// it on first sight.
	/// # Errors
	/// Returns a [`HashError`] if the salt is unusable as a key.
	pub fn regenerate(&mut self, original: &str) -> Result<UI, HashError> {
		if let Some(mapped) = self.map.get(original) {
			return Ok(mapped.clone());
		}
		let mapped = derive_uid(&self.org_root, &self.salt, original)?;
		self.map.insert(UI::from(original), mapped.clone());
		Ok(mapped)
	}

	/// Pre-seeds `original` to rewrite to the same replacement as
	/// `canonical`. Used when several source studies merge into one
	/// anonymised study.
	/// # Errors
	/// Returns a [`HashError`] if the salt is unusable as a key.
	pub fn alias(&mut self, original: &str, canonical: &str) -> Result<(), HashError> {
		let mapped = self.regenerate(canonical)?;
		self.map.insert(UI::from(original), mapped);
		Ok(())
	}

	pub fn lookup(&self, original: &str) -> Option<&UI> {
		self.map.get(original)
	}
}

/// Computes `<org-root>.<digest>` truncated to the DICOM UID limit. The
/// digest is rendered in decimal so the result stays a valid UID.
fn derive_uid(org_root: &str, salt: &[u8], original: &str) -> Result<UI, HashError> {
	let digest = hashing::keyed_digest(salt, original.as_bytes())?;

	// First 16 digest bytes as one decimal number.
	let mut word = [0_u8; 16];
	word.copy_from_slice(&hex::decode(&digest[..32]).expect("digest is hex")[..16]);
	let numeric = u128::from_be_bytes(word).to_string();

	let mut uid = format!("{org_root}.{numeric}");
	uid.truncate(UID_MAX_LENGTH);
	// A trailing dot after truncation would be malformed.
	let uid = uid.trim_end_matches('.').to_owned();
	Ok(uid)
}
