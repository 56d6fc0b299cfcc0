//! The typed extract request that travels through the broker.

use crate::types::QueuePriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// One request to extract, anonymise and export a single imaging study.
///
/// (MRN, accession number) uniquely identifies a study/report pair. If a
/// study UID is present it takes precedence for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
	pub mrn: String,
	pub accession_number: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub study_uid: Option<String>,
	pub study_datetime: DateTime<Utc>,
	pub project_name: String,
	pub extract_datetime: DateTime<Utc>,
	#[serde(
		serialize_with = "serialize_priority",
		deserialize_with = "deserialize_priority"
	)]
	pub priority: QueuePriority,
	/// Opaque linkage id carried through for tabular extracts.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub procedure_occurrence_id: Option<String>,
}

impl ExtractRequest {
	/// Stable identifier used in logs and for ledger lookups when no
	/// study UID is known yet.
	pub fn identifier(&self) -> String {
		format!("{}/{}", self.mrn, self.accession_number)
	}

	/// The ledger key for this request: the study UID when present,
	/// otherwise the (MRN, accession) pair.
	pub fn ledger_key(&self) -> String {
		self.study_uid
			.clone()
			.unwrap_or_else(|| self.identifier())
	}

	/// # Errors
	/// Returns a [`MessageError`] if the payload is not valid JSON or the
	/// priority is out of range.
	pub fn from_bytes(body: &[u8]) -> Result<Self, MessageError> {
		serde_json::from_slice(body).map_err(MessageError::Malformed)
	}

	/// # Errors
	/// Returns a [`MessageError`] if serialization fails.
	pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
		serde_json::to_vec(self).map_err(MessageError::Malformed)
	}
}

fn serialize_priority<S: Serializer>(
	priority: &QueuePriority,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	serializer.serialize_u8(priority.get())
}

fn deserialize_priority<'de, D: Deserializer<'de>>(
	deserializer: D,
) -> Result<QueuePriority, D::Error> {
	let value = u8::deserialize(deserializer)?;
	QueuePriority::new(value).ok_or_else(|| {
		serde::de::Error::custom(format!(
			"priority must be between {} and {}, got {value}",
			QueuePriority::MIN,
			QueuePriority::MAX,
		))
	})
}

#[derive(Debug, Error)]
pub enum MessageError {
	#[error("Malformed extract request: {0}")]
	Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn request() -> ExtractRequest {
		ExtractRequest {
			mrn: String::from("M1"),
			accession_number: String::from("A1"),
			study_uid: Some(String::from("1.2.840.1.1")),
			study_datetime: Utc.with_ymd_and_hms(2023, 5, 17, 9, 30, 0).unwrap(),
			project_name: String::from("p1"),
			extract_datetime: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
			priority: QueuePriority::new(3).unwrap(),
			procedure_occurrence_id: Some(String::from("42")),
		}
	}

	#[test]
	fn round_trip_is_identity() {
		let original = request();
		let bytes = original.to_bytes().unwrap();
		let decoded = ExtractRequest::from_bytes(&bytes).unwrap();
		assert_eq!(original, decoded);
	}

	#[test]
	fn round_trip_without_optional_fields() {
		let original = ExtractRequest {
			study_uid: None,
			procedure_occurrence_id: None,
			..request()
		};
		let bytes = original.to_bytes().unwrap();
		let decoded = ExtractRequest::from_bytes(&bytes).unwrap();
		assert_eq!(original, decoded);
		assert!(!String::from_utf8(original.to_bytes().unwrap())
			.unwrap()
			.contains("study_uid"));
	}

	#[test]
	fn priority_out_of_range_is_rejected() {
		let raw = br#"{
			"mrn": "M1",
			"accession_number": "A1",
			"study_datetime": "2023-05-17T09:30:00Z",
			"project_name": "p1",
			"extract_datetime": "2023-06-01T12:00:00Z",
			"priority": 9
		}"#;
		assert!(ExtractRequest::from_bytes(raw).is_err());
	}

	#[test]
	fn ledger_key_prefers_study_uid() {
		let with_uid = request();
		assert_eq!(with_uid.ledger_key(), "1.2.840.1.1");

		let without_uid = ExtractRequest {
			study_uid: None,
			..request()
		};
		assert_eq!(without_uid.ledger_key(), "M1/A1");
	}
}
