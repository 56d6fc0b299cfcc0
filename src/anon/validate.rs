//! Dictionary-based structural validation of data sets.
//!
//! Both the incoming and the rewritten instance are checked; only issues
//! *introduced* by the rewrite count against the study, so pre-existing
//! quirks of the source data do not fail an export.

use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
	Warning,
	Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Issue {
	pub severity: Severity,
	pub tag: Tag,
	pub message: String,
}

impl Display for Issue {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{:?}] {}: {}", self.severity, self.tag, self.message)
	}
}

/// Attributes every composite instance must carry with a value.
const REQUIRED_UIDS: [Tag; 3] = [
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::SOP_INSTANCE_UID,
];

const UID_MAX_LENGTH: usize = 64;

/// Runs every check against one data set.
pub fn check(object: &InMemDicomObject) -> Vec<Issue> {
	let mut issues = Vec::new();

	for required in REQUIRED_UIDS {
		let value = object
			.get(required)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			.unwrap_or_default();
		if value.is_empty() {
			issues.push(Issue {
				severity: Severity::Error,
				tag: required,
				message: String::from("required identifier is missing or empty"),
			});
		}
	}

	for element in object.iter() {
		let tag = element.header().tag;
		let vr = element.vr();

		if let Some(entry) = StandardDataDictionary.by_tag(tag) {
			let expected = entry.vr().relaxed();
			if expected != VR::UN && vr != VR::UN && vr != VR::SQ && expected != vr {
				issues.push(Issue {
					severity: Severity::Error,
					tag,
					message: format!("VR {vr} does not match dictionary VR {expected}"),
				});
			}
		} else if tag.group() % 2 == 0 && tag.element() != 0 {
			issues.push(Issue {
				severity: Severity::Warning,
				tag,
				message: String::from("element is not in the data dictionary"),
			});
		}

		if vr == VR::UI {
			if let Ok(value) = element.to_str() {
				for uid in value.split('\\') {
					let uid = uid.trim_end_matches(['\0', ' ']);
					if uid.len() > UID_MAX_LENGTH {
						issues.push(Issue {
							severity: Severity::Error,
							tag,
							message: format!("UID exceeds {UID_MAX_LENGTH} characters"),
						});
					} else if !uid.is_empty()
						&& !uid.chars().all(|c| c.is_ascii_digit() || c == '.')
					{
						issues.push(Issue {
							severity: Severity::Error,
							tag,
							message: String::from("UID contains invalid characters"),
						});
					}
				}
			}
		}

		if let Some(items) = element.value().items() {
			for item in items {
				for issue in check(item) {
					issues.push(issue);
				}
			}
		}
	}

	issues
}

/// The issues present after the rewrite that were not present before.
pub fn new_issues(before: &[Issue], after: &[Issue]) -> Vec<Issue> {
	let known: HashSet<&Issue> = before.iter().collect();
	after
		.iter()
		.filter(|issue| !known.contains(issue))
		.cloned()
		.collect()
}

pub fn has_errors(issues: &[Issue]) -> bool {
	issues
		.iter()
		.any(|issue| issue.severity >= Severity::Error)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dicom_value;

	fn minimal() -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
			DataElement::new(
				tags::SERIES_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.1"),
			),
			DataElement::new(
				tags::SOP_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.1.1"),
			),
		])
	}

	#[test]
	fn minimal_instance_is_clean() {
		assert!(check(&minimal()).is_empty());
	}

	#[test]
	fn missing_study_uid_is_an_error() {
		let mut object = minimal();
		object.remove_element(tags::STUDY_INSTANCE_UID);
		let issues = check(&object);
		assert!(has_errors(&issues));
	}

	#[test]
	fn invalid_uid_characters_are_errors() {
		let mut object = minimal();
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "not-a-uid"),
		));
		assert!(has_errors(&check(&object)));
	}

	#[test]
	fn overlong_uid_is_an_error() {
		let mut object = minimal();
		let long = format!("1.{}", "2".repeat(70));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(long),
		));
		assert!(has_errors(&check(&object)));
	}

	#[test]
	fn vr_mismatch_is_detected() {
		let mut object = minimal();
		object.put(DataElement::new(
			tags::PATIENT_NAME,
			VR::DA,
			dicom_value!(Str, "20230101"),
		));
		assert!(has_errors(&check(&object)));
	}

	#[test]
	fn new_issues_ignores_pre_existing_ones() {
		let mut dirty = minimal();
		dirty.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "not-a-uid"),
		));

		let before = check(&dirty);
		let after = check(&dirty);
		assert!(new_issues(&before, &after).is_empty());

		let clean_before = check(&minimal());
		let introduced = new_issues(&clean_before, &before);
		assert!(has_errors(&introduced));
	}
}
