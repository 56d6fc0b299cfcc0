//! Tag operation files and their resolution into one scheme per
//! (project, manufacturer) pair.
//!
//! Operations are a closed set of variants with typed payloads; VR
//! compatibility is checked once at configuration load, not per element.

use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::{Tag, VR};
use dicom::object::StandardDataDictionary;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// One directive bound to a DICOM element.
#[derive(Debug, Clone, PartialEq)]
pub enum TagOperation {
	Keep,
	Delete,
	Replace { value: String },
	ReplaceUid,
	SecureHash { length: Option<usize> },
	DateShift,
	DateFloor,
	NumRange { min: f64, max: f64 },
}

impl Display for TagOperation {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Keep => write!(f, "keep"),
			Self::Delete => write!(f, "delete"),
			Self::Replace { .. } => write!(f, "replace"),
			Self::ReplaceUid => write!(f, "replace_UID"),
			Self::SecureHash { .. } => write!(f, "secure-hash"),
			Self::DateShift => write!(f, "date-shift"),
			Self::DateFloor => write!(f, "date-floor"),
			Self::NumRange { .. } => write!(f, "num-range"),
		}
	}
}

/// Raw shape of one entry in a tag operation file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTagOperation {
	#[serde(default)]
	pub name: Option<String>,
	pub group: u16,
	pub element: u16,
	pub op: OpKind,
	#[serde(default)]
	pub value: Option<serde_yaml::Value>,
	#[serde(default)]
	pub min: Option<f64>,
	#[serde(default)]
	pub max: Option<f64>,
	#[serde(default)]
	pub length: Option<usize>,
}

impl RawTagOperation {
	pub const fn tag(&self) -> Tag {
		Tag(self.group, self.element)
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub enum OpKind {
	#[serde(rename = "keep")]
	Keep,
	#[serde(rename = "delete")]
	Delete,
	#[serde(rename = "replace")]
	Replace,
	#[serde(rename = "replace_UID")]
	ReplaceUid,
	#[serde(rename = "secure-hash")]
	SecureHash,
	#[serde(rename = "date-shift")]
	DateShift,
	#[serde(rename = "date-floor")]
	DateFloor,
	#[serde(rename = "num-range")]
	NumRange,
}

/// Raw shape of a manufacturer override file: per-manufacturer lists that
/// supersede the base scheme.
#[derive(Debug, Clone, Deserialize)]
pub struct RawManufacturerOverride {
	#[serde(with = "serde_manufacturer_regex")]
	pub manufacturer: Regex,
	pub tags: Vec<RawTagOperation>,
}

mod serde_manufacturer_regex {
	use super::{Regex, RegexBuilder};
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
		let pattern = String::deserialize(deserializer)?;
		RegexBuilder::new(&pattern)
			.case_insensitive(true)
			.build()
			.map_err(serde::de::Error::custom)
	}
}

/// A validated manufacturer override block.
#[derive(Debug, Clone)]
pub struct ManufacturerOverride {
	pub manufacturer: Regex,
	pub operations: BTreeMap<Tag, TagOperation>,
}

/// The resolved, ordered set of operations for one instance. Defaults for
/// unlisted elements (delete) are applied by the anonymisation engine, not
/// stored here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagScheme(BTreeMap<Tag, TagOperation>);

impl TagScheme {
	pub fn resolve(&self, tag: Tag) -> Option<&TagOperation> {
		self.0.get(&tag)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Tag, &TagOperation)> {
		self.0.iter()
	}
}

/// Parses the entries of one tag operation file.
/// # Errors
/// Returns a [`SchemeError`] on YAML or VR-compatibility failures.
pub fn parse_operations(yaml: &str) -> Result<Vec<(Tag, TagOperation)>, SchemeError> {
	let raw: Vec<RawTagOperation> = serde_yaml::from_str(yaml)?;
	raw.into_iter()
		.map(|entry| {
			let tag = entry.tag();
			let operation = validate(&entry)?;
			Ok((tag, operation))
		})
		.collect()
}

/// Parses a manufacturer override file.
/// # Errors
/// Returns a [`SchemeError`] on YAML or VR-compatibility failures.
pub fn parse_overrides(yaml: &str) -> Result<Vec<ManufacturerOverride>, SchemeError> {
	let raw: Vec<RawManufacturerOverride> = serde_yaml::from_str(yaml)?;
	raw.into_iter()
		.map(|block| {
			let operations = block
				.tags
				.into_iter()
				.map(|entry| {
					let tag = entry.tag();
					let operation = validate(&entry)?;
					Ok((tag, operation))
				})
				.collect::<Result<BTreeMap<_, _>, SchemeError>>()?;
			Ok(ManufacturerOverride {
				manufacturer: block.manufacturer,
				operations,
			})
		})
		.collect()
}

/// Merges base operations (later entries win) with the overrides whose
/// manufacturer pattern matches. Overrides always win over the base.
pub fn merge_schemes(
	base: &[Vec<(Tag, TagOperation)>],
	overrides: &[ManufacturerOverride],
	manufacturer: &str,
) -> TagScheme {
	let mut merged = BTreeMap::new();
	for file in base {
		for (tag, operation) in file {
			merged.insert(*tag, operation.clone());
		}
	}
	for block in overrides {
		if block.manufacturer.is_match(manufacturer) {
			for (tag, operation) in &block.operations {
				merged.insert(*tag, operation.clone());
			}
		}
	}
	TagScheme(merged)
}

fn dictionary_vr(tag: Tag) -> Option<VR> {
	StandardDataDictionary
		.by_tag(tag)
		.map(|entry| entry.vr().relaxed())
}

const fn is_numeric(vr: VR) -> bool {
	matches!(
		vr,
		VR::IS | VR::DS | VR::US | VR::UL | VR::SS | VR::SL | VR::FL | VR::FD | VR::UV | VR::SV
	)
}

const fn is_temporal(vr: VR) -> bool {
	matches!(vr, VR::DA | VR::DT | VR::TM)
}

/// Checks an operation against the dictionary VR of its element and
/// produces the typed variant. Private or retired tags without a
/// dictionary entry skip the VR check.
fn validate(entry: &RawTagOperation) -> Result<TagOperation, SchemeError> {
	let tag = entry.tag();
	let vr = dictionary_vr(tag);

	let operation = match entry.op {
		OpKind::Keep => TagOperation::Keep,
		OpKind::Delete => TagOperation::Delete,
		OpKind::ReplaceUid => {
			if let Some(vr) = vr {
				if vr != VR::UI {
					return Err(SchemeError::VrMismatch {
						tag,
						op: String::from("replace_UID"),
						vr,
					});
				}
			}
			TagOperation::ReplaceUid
		}
		OpKind::SecureHash => TagOperation::SecureHash {
			length: entry.length,
		},
		OpKind::DateShift => {
			if let Some(vr) = vr {
				if !is_temporal(vr) {
					return Err(SchemeError::VrMismatch {
						tag,
						op: String::from("date-shift"),
						vr,
					});
				}
			}
			TagOperation::DateShift
		}
		OpKind::DateFloor => {
			if let Some(vr) = vr {
				if !is_temporal(vr) {
					return Err(SchemeError::VrMismatch {
						tag,
						op: String::from("date-floor"),
						vr,
					});
				}
			}
			TagOperation::DateFloor
		}
		OpKind::NumRange => {
			if let Some(vr) = vr {
				if !is_numeric(vr) {
					return Err(SchemeError::VrMismatch {
						tag,
						op: String::from("num-range"),
						vr,
					});
				}
			}
			let (Some(min), Some(max)) = (entry.min, entry.max) else {
				return Err(SchemeError::MissingBounds(tag));
			};
			if min > max {
				return Err(SchemeError::InvertedBounds(tag));
			}
			TagOperation::NumRange { min, max }
		}
		OpKind::Replace => {
			let value = replacement_value(entry, vr)?;
			TagOperation::Replace { value }
		}
	};

	Ok(operation)
}

/// Resolves the replacement constant for a `replace` operation, falling
/// back to a VR-appropriate placeholder when none is configured.
fn replacement_value(entry: &RawTagOperation, vr: Option<VR>) -> Result<String, SchemeError> {
	let tag = entry.tag();
	match &entry.value {
		Some(serde_yaml::Value::String(value)) => {
			if vr.is_some_and(is_numeric) && value.trim().parse::<f64>().is_err() {
				return Err(SchemeError::ValueMismatch { tag, vr: vr.unwrap() });
			}
			Ok(value.clone())
		}
		Some(serde_yaml::Value::Number(value)) => Ok(value.to_string()),
		Some(other) => Err(SchemeError::UnsupportedValue {
			tag,
			kind: format!("{other:?}"),
		}),
		None => Ok(placeholder(vr)),
	}
}

fn placeholder(vr: Option<VR>) -> String {
	match vr {
		Some(VR::DA) => String::from("19000101"),
		Some(VR::DT) => String::from("19000101000000"),
		Some(VR::TM) => String::from("000000"),
		Some(vr) if is_numeric(vr) => String::from("0"),
		Some(VR::PN) => String::from("ANONYMOUS"),
		_ => String::from("ANON"),
	}
}

#[derive(Debug, Error)]
pub enum SchemeError {
	#[error("Failed to parse tag operation file: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("Operation {op} is not applicable to {tag} (VR {vr})")]
	VrMismatch { tag: Tag, op: String, vr: VR },
	#[error("Replacement value for {tag} is not compatible with VR {vr}")]
	ValueMismatch { tag: Tag, vr: VR },
	#[error("Replacement value for {tag} has unsupported type: {kind}")]
	UnsupportedValue { tag: Tag, kind: String },
	#[error("num-range for {0} requires both min and max")]
	MissingBounds(Tag),
	#[error("num-range for {0} has min greater than max")]
	InvertedBounds(Tag),
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	const BASE: &str = r#"
- name: Patient ID
  group: 0x0010
  element: 0x0020
  op: secure-hash
- name: Study Instance UID
  group: 0x0020
  element: 0x000D
  op: replace_UID
- name: Study Date
  group: 0x0008
  element: 0x0020
  op: date-shift
- name: Modality
  group: 0x0008
  element: 0x0060
  op: keep
"#;

	const OVERRIDES: &str = r#"
- manufacturer: "philips"
  tags:
    - name: Study Date
      group: 0x0008
      element: 0x0020
      op: date-floor
"#;

	#[test]
	fn base_scheme_parses() {
		let operations = parse_operations(BASE).unwrap();
		assert_eq!(operations.len(), 4);
		let scheme = merge_schemes(&[operations], &[], "SIEMENS");
		assert_eq!(
			scheme.resolve(tags::STUDY_DATE),
			Some(&TagOperation::DateShift)
		);
		assert_eq!(scheme.resolve(tags::MODALITY), Some(&TagOperation::Keep));
		assert_eq!(scheme.resolve(tags::PATIENT_NAME), None);
	}

	#[test]
	fn manufacturer_override_wins() {
		let base = parse_operations(BASE).unwrap();
		let overrides = parse_overrides(OVERRIDES).unwrap();

		let scheme = merge_schemes(&[base.clone()], &overrides, "Philips Healthcare");
		assert_eq!(
			scheme.resolve(tags::STUDY_DATE),
			Some(&TagOperation::DateFloor)
		);

		let scheme = merge_schemes(&[base], &overrides, "SIEMENS");
		assert_eq!(
			scheme.resolve(tags::STUDY_DATE),
			Some(&TagOperation::DateShift)
		);
	}

	#[test]
	fn later_base_file_wins() {
		let first = parse_operations(BASE).unwrap();
		let second = parse_operations(
			r#"
- group: 0x0008
  element: 0x0060
  op: delete
"#,
		)
		.unwrap();

		let scheme = merge_schemes(&[first, second], &[], "SIEMENS");
		assert_eq!(scheme.resolve(tags::MODALITY), Some(&TagOperation::Delete));
	}

	#[test]
	fn date_shift_on_non_temporal_vr_is_rejected() {
		let yaml = r#"
- name: Patient Name
  group: 0x0010
  element: 0x0010
  op: date-shift
"#;
		assert!(matches!(
			parse_operations(yaml),
			Err(SchemeError::VrMismatch { .. })
		));
	}

	#[test]
	fn replace_uid_on_non_ui_vr_is_rejected() {
		let yaml = r#"
- group: 0x0010
  element: 0x0010
  op: replace_UID
"#;
		assert!(parse_operations(yaml).is_err());
	}

	#[test]
	fn num_range_requires_bounds() {
		let yaml = r#"
- name: Series Number
  group: 0x0020
  element: 0x0011
  op: num-range
"#;
		assert!(matches!(
			parse_operations(yaml),
			Err(SchemeError::MissingBounds(_))
		));

		let yaml = r#"
- name: Series Number
  group: 0x0020
  element: 0x0011
  op: num-range
  min: 0
  max: 100
"#;
		let operations = parse_operations(yaml).unwrap();
		assert_eq!(
			operations[0].1,
			TagOperation::NumRange {
				min: 0.0,
				max: 100.0
			}
		);
	}

	#[test]
	fn replace_placeholder_follows_vr() {
		let yaml = r#"
- name: Patient Name
  group: 0x0010
  element: 0x0010
  op: replace
- name: Study Date
  group: 0x0008
  element: 0x0020
  op: replace
"#;
		let operations = parse_operations(yaml).unwrap();
		assert_eq!(
			operations[0].1,
			TagOperation::Replace {
				value: String::from("ANONYMOUS")
			}
		);
		assert_eq!(
			operations[1].1,
			TagOperation::Replace {
				value: String::from("19000101")
			}
		);
	}

	#[test]
	fn replace_with_incompatible_numeric_value_is_rejected() {
		let yaml = r#"
- name: Series Number
  group: 0x0020
  element: 0x0011
  op: replace
  value: not-a-number
"#;
		assert!(matches!(
			parse_operations(yaml),
			Err(SchemeError::ValueMismatch { .. })
		));
	}

	#[test]
	fn private_tags_skip_vr_checks() {
		let yaml = r#"
- name: Private creator block
  group: 0x000b
  element: 0x0010
  op: keep
- name: Private payload
  group: 0x000b
  element: 0x1001
  op: secure-hash
"#;
		assert!(parse_operations(yaml).is_ok());
	}
}
