//! Keyed BLAKE2 digests for pseudonymisation.
//!
//! Every digest is keyed with the project salt so values are not linkable
//! across projects.

use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::Blake2bMac;
use thiserror::Error;

/// DICOM identifiers are limited to 64 characters and the digest is emitted
/// hex-encoded (two characters per byte), so the digest size must not grow.
const DIGEST_SIZE: usize = 32;

type Mac = Blake2bMac<U32>;

/// Keyed BLAKE2b-256 digest, raw bytes.
/// # Errors
/// Returns [`HashError::InvalidKey`] if the key exceeds the BLAKE2b key
/// length limit of 64 bytes.
pub fn keyed_digest_raw(key: &[u8], message: &[u8]) -> Result<Vec<u8>, HashError> {
	let mut mac = Mac::new_from_slice(key).map_err(|_| HashError::InvalidKey)?;
	mac.update(message);
	let digest = mac.finalize_fixed();
	debug_assert_eq!(digest.len(), DIGEST_SIZE);
	Ok(digest.to_vec())
}

/// Keyed BLAKE2b-256 digest, hex encoded (64 characters).
/// # Errors
/// See [`keyed_digest_raw`].
pub fn keyed_digest(key: &[u8], message: &[u8]) -> Result<String, HashError> {
	Ok(hex::encode(keyed_digest_raw(key, message)?))
}

/// Keyed digest truncated to `length` characters. A zero length keeps the
/// full digest.
/// # Errors
/// See [`keyed_digest`].
pub fn keyed_digest_truncated(
	key: &[u8],
	message: &[u8],
	length: usize,
) -> Result<String, HashError> {
	let mut digest = keyed_digest(key, message)?;
	if length > 0 {
		digest.truncate(length);
	}
	Ok(digest)
}

/// The pseudonymised patient identifier recorded in the export ledger and
/// written into every anonymised instance: a project-salted digest of the
/// MRN and accession number.
/// # Errors
/// See [`keyed_digest`].
pub fn pseudo_patient_id(
	project_salt: &[u8],
	mrn: &str,
	accession_number: &str,
) -> Result<String, HashError> {
	let mut message = Vec::with_capacity(mrn.len() + accession_number.len());
	message.extend_from_slice(mrn.as_bytes());
	message.extend_from_slice(accession_number.as_bytes());
	keyed_digest(project_salt, &message)
}

/// Combines the project salt with an element-local salt so two elements
/// carrying the same value do not hash identically.
pub fn combine_salts(project_salt: &[u8], local_salt: &[u8]) -> Vec<u8> {
	if local_salt.is_empty() {
		return project_salt.to_vec();
	}
	project_salt
		.iter()
		.zip(local_salt.iter().cycle())
		.map(|(a, b)| a ^ b)
		.collect()
}

/// Deterministic per-study day offset in [-30, 0], derived from the keyed
/// digest of the StudyInstanceUID. The same (salt, study) pair always
/// yields the same offset.
/// # Errors
/// See [`keyed_digest`].
pub fn study_day_offset(project_salt: &[u8], study_uid: &str) -> Result<i64, HashError> {
	let mut mac = Mac::new_from_slice(project_salt).map_err(|_| HashError::InvalidKey)?;
	mac.update(study_uid.as_bytes());
	let digest = mac.finalize_fixed();

	let mut word = [0_u8; 8];
	word.copy_from_slice(&digest[..8]);
	let value = u64::from_be_bytes(word);

	// 31 possible offsets: 0 through -30 days.
	Ok(-i64::try_from(value % 31).unwrap_or(0))
}

#[derive(Debug, Error)]
pub enum HashError {
	#[error("Hash key must be at most 64 bytes")]
	InvalidKey,
}

#[cfg(test)]
mod tests {
	use super::*;

	const SALT: &[u8] = b"0123456789abcdef0123456789abcdef";

	#[test]
	fn digest_is_deterministic_and_hex() {
		let a = keyed_digest(SALT, b"message").unwrap();
		let b = keyed_digest(SALT, b"message").unwrap();
		assert_eq!(a, b);
		assert_eq!(a.len(), DIGEST_SIZE * 2);
		assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn different_keys_give_unlinkable_digests() {
		let a = keyed_digest(b"project-a", b"M1").unwrap();
		let b = keyed_digest(b"project-b", b"M1").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn truncation_respects_length() {
		let digest = keyed_digest_truncated(SALT, b"value", 16).unwrap();
		assert_eq!(digest.len(), 16);

		let full = keyed_digest_truncated(SALT, b"value", 0).unwrap();
		assert_eq!(full.len(), DIGEST_SIZE * 2);
	}

	#[test]
	fn pseudo_patient_id_covers_mrn_and_accession() {
		let a = pseudo_patient_id(SALT, "M1", "A1").unwrap();
		let b = pseudo_patient_id(SALT, "M1", "A2").unwrap();
		assert_ne!(a, b);
		assert_eq!(a, pseudo_patient_id(SALT, "M1", "A1").unwrap());
	}

	#[test]
	fn day_offset_is_deterministic_and_in_range() {
		for study in ["1.2.3", "1.2.4", "9.9.9.1", "2.25.4242"] {
			let offset = study_day_offset(SALT, study).unwrap();
			assert_eq!(offset, study_day_offset(SALT, study).unwrap());
			assert!((-30..=0).contains(&offset), "offset {offset} out of range");
		}
	}

	#[test]
	fn day_offset_varies_with_study() {
		let offsets: Vec<i64> = (0..64)
			.map(|i| study_day_offset(SALT, &format!("1.2.3.{i}")).unwrap())
			.collect();
		let distinct = offsets
			.iter()
			.collect::<std::collections::HashSet<_>>()
			.len();
		assert!(distinct > 1, "all offsets collapsed to one value");
	}

	#[test]
	fn combine_salts_xors_cyclically() {
		let combined = combine_salts(&[0xff, 0x0f, 0xf0], &[0x0f]);
		assert_eq!(combined, vec![0xf0, 0x00, 0xff]);
		assert_eq!(combine_salts(SALT, &[]), SALT.to_vec());
	}
}
