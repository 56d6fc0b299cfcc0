//! Application of tag operations to data elements.
//!
//! The rewriter builds a fresh data set containing only elements the
//! scheme admits: anything unlisted is absent from the output, and private
//! elements are absent unless explicitly listed.

use crate::anon::dates::{self, DateError};
use crate::anon::uid::UidMap;
use crate::hashing::{self, HashError};
use crate::project::{TagOperation, TagScheme};
use base64::Engine;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use thiserror::Error;
use tracing::trace;

/// State shared by every element rewrite of one study.
pub struct RewriteContext<'a> {
	pub scheme: &'a TagScheme,
	pub uid_map: &'a mut UidMap,
	pub day_offset: i64,
	pub project_salt: &'a [u8],
	/// Written into Patient ID (0010,0020) instead of hashing the raw
	/// value, so the instance matches the export ledger entry.
	pub pseudo_patient_id: &'a str,
}

/// Rewrites one data set according to the scheme, recursing into sequence
/// items with the same rules.
/// # Errors
/// Returns an [`OpError`] if an admitted element cannot be transformed;
/// the caller fails the whole study.
pub fn rewrite_object(
	object: &InMemDicomObject,
	ctx: &mut RewriteContext<'_>,
) -> Result<InMemDicomObject, OpError> {
	let mut output = Vec::new();

	for element in object.iter() {
		let tag = element.header().tag;
		let operation = ctx.scheme.resolve(tag);

		let Some(operation) = operation else {
			// Unlisted (including unlisted private creators): delete.
			trace!("Deleting unlisted element {tag}");
			continue;
		};

		match operation {
			TagOperation::Delete => {}
			TagOperation::Keep => {
				if let Some(items) = element.value().items() {
					let rewritten = items
						.iter()
						.map(|item| rewrite_object(item, ctx))
						.collect::<Result<Vec<_>, _>>()?;
					output.push(InMemElement::new(
						tag,
						VR::SQ,
						Value::Sequence(DataSetSequence::from(rewritten)),
					));
				} else {
					output.push(element.clone());
				}
			}
			TagOperation::Replace { value } => {
				output.push(InMemElement::new(
					tag,
					element.vr(),
					typed_primitive(tag, element.vr(), value)?,
				));
			}
			TagOperation::ReplaceUid => {
				output.push(rewrite_uids(element, ctx)?);
			}
			TagOperation::SecureHash { length } => {
				output.push(secure_hash(element, ctx, *length)?);
			}
			TagOperation::DateShift => {
				output.push(shift_dates(element, ctx.day_offset)?);
			}
			TagOperation::DateFloor => {
				output.push(floor_dates(element)?);
			}
			TagOperation::NumRange { min, max } => {
				output.push(clamp_numbers(element, *min, *max)?);
			}
		}
	}

	Ok(InMemDicomObject::from_element_iter(output))
}

fn string_values(element: &InMemElement) -> Result<Vec<String>, OpError> {
	let tag = element.header().tag;
	let primitive = element
		.value()
		.primitive()
		.ok_or(OpError::NotPrimitive(tag))?;
	Ok(match primitive {
		PrimitiveValue::Str(value) => vec![value.trim_end_matches(['\0', ' ']).to_owned()],
		PrimitiveValue::Strs(values) => values
			.iter()
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			.collect(),
		PrimitiveValue::Empty => Vec::new(),
		other => vec![other.to_string()],
	})
}

fn strs_primitive(values: Vec<String>) -> PrimitiveValue {
	match values.len() {
		0 => PrimitiveValue::Empty,
		1 => PrimitiveValue::from(values.into_iter().next().unwrap()),
		_ => PrimitiveValue::Strs(values.into()),
	}
}

fn rewrite_uids(
	element: &InMemElement,
	ctx: &mut RewriteContext<'_>,
) -> Result<InMemElement, OpError> {
	let tag = element.header().tag;
	let mapped = string_values(element)?
		.into_iter()
		.map(|uid| ctx.uid_map.regenerate(&uid))
		.collect::<Result<Vec<_>, _>>()?;
	Ok(InMemElement::new(tag, VR::UI, strs_primitive(mapped)))
}

fn secure_hash(
	element: &InMemElement,
	ctx: &RewriteContext<'_>,
	length: Option<usize>,
) -> Result<InMemElement, OpError> {
	let tag = element.header().tag;
	let vr = element.vr();

	if tag == tags::PATIENT_ID {
		return Ok(InMemElement::new(
			tag,
			vr,
			PrimitiveValue::from(ctx.pseudo_patient_id),
		));
	}

	// Element-local salt keeps identical values in different elements from
	// hashing identically.
	let local_salt = [
		(tag.group() >> 8) as u8,
		(tag.group() & 0xff) as u8,
		(tag.element() >> 8) as u8,
		(tag.element() & 0xff) as u8,
	];
	let key = hashing::combine_salts(ctx.project_salt, &local_salt);
	let clamp = length.or_else(|| vr_max_length(vr));

	let hashed = string_values(element)?
		.into_iter()
		.map(|value| {
			let digest = hashing::keyed_digest_raw(&key, value.as_bytes())?;
			let mut encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
			if let Some(clamp) = clamp {
				encoded.truncate(clamp);
			}
			Ok(encoded)
		})
		.collect::<Result<Vec<_>, HashError>>()?;

	Ok(InMemElement::new(tag, vr, strs_primitive(hashed)))
}

fn shift_dates(element: &InMemElement, day_offset: i64) -> Result<InMemElement, OpError> {
	let tag = element.header().tag;
	let vr = element.vr();
	let shifted = string_values(element)?
		.into_iter()
		.map(|value| match vr {
			VR::DA => dates::shift_da(&value, day_offset),
			VR::DT => dates::shift_dt(&value, day_offset),
			_ => Ok(dates::shift_tm(&value)),
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(InMemElement::new(tag, vr, strs_primitive(shifted)))
}

fn floor_dates(element: &InMemElement) -> Result<InMemElement, OpError> {
	let tag = element.header().tag;
	let vr = element.vr();
	let floored = string_values(element)?
		.into_iter()
		.map(|value| match vr {
			VR::DT => dates::floor_dt(&value),
			VR::TM => Ok(dates::floor_tm(&value)),
			// Flooring a plain date is the identity.
			_ => Ok(value),
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(InMemElement::new(tag, vr, strs_primitive(floored)))
}

fn clamp_numbers(element: &InMemElement, min: f64, max: f64) -> Result<InMemElement, OpError> {
	let tag = element.header().tag;
	let vr = element.vr();
	let primitive = element
		.value()
		.primitive()
		.ok_or(OpError::NotPrimitive(tag))?;

	let clamped: Vec<f64> = primitive
		.to_multi_float64()
		.map_err(|err| OpError::BadValue {
			tag,
			reason: err.to_string(),
		})?
		.into_iter()
		.map(|value| value.clamp(min, max))
		.collect();

	Ok(InMemElement::new(tag, vr, numeric_primitive(vr, &clamped)))
}

/// Builds a primitive of the correct binary representation for the VR.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn numeric_primitive(vr: VR, values: &[f64]) -> PrimitiveValue {
	match vr {
		VR::US => PrimitiveValue::U16(values.iter().map(|v| *v as u16).collect()),
		VR::SS => PrimitiveValue::I16(values.iter().map(|v| *v as i16).collect()),
		VR::UL => PrimitiveValue::U32(values.iter().map(|v| *v as u32).collect()),
		VR::SL => PrimitiveValue::I32(values.iter().map(|v| *v as i32).collect()),
		VR::UV => PrimitiveValue::U64(values.iter().map(|v| *v as u64).collect()),
		VR::SV => PrimitiveValue::I64(values.iter().map(|v| *v as i64).collect()),
		VR::FL => PrimitiveValue::F32(values.iter().map(|v| *v as f32).collect()),
		VR::FD => PrimitiveValue::F64(values.iter().copied().collect()),
		VR::IS => strs_primitive(values.iter().map(|v| format!("{}", *v as i64)).collect()),
		_ => strs_primitive(values.iter().map(ToString::to_string).collect()),
	}
}

/// Builds the replacement primitive, honouring binary numeric VRs.
fn typed_primitive(tag: Tag, vr: VR, value: &str) -> Result<PrimitiveValue, OpError> {
	let parse = |value: &str| {
		value.trim().parse::<f64>().map_err(|_| OpError::BadValue {
			tag,
			reason: format!("'{value}' is not numeric"),
		})
	};
	Ok(match vr {
		VR::US | VR::SS | VR::UL | VR::SL | VR::UV | VR::SV | VR::FL | VR::FD => {
			numeric_primitive(vr, &[parse(value)?])
		}
		_ => PrimitiveValue::from(value),
	})
}

/// Maximum value length per VR, where the standard defines one.
const fn vr_max_length(vr: VR) -> Option<usize> {
	match vr {
		VR::AE | VR::CS | VR::SH => Some(16),
		VR::AS => Some(4),
		VR::DA => Some(8),
		VR::DS => Some(16),
		VR::DT => Some(26),
		VR::IS => Some(12),
		VR::LO | VR::UI | VR::PN => Some(64),
		VR::TM => Some(16),
		VR::ST => Some(1024),
		VR::LT => Some(10240),
		_ => None,
	}
}

#[derive(Debug, Error)]
pub enum OpError {
	#[error("Element {0} has no primitive value")]
	NotPrimitive(Tag),
	#[error("Element {tag} could not be transformed: {reason}")]
	BadValue { tag: Tag, reason: String },
	#[error(transparent)]
	Date(#[from] DateError),
	#[error(transparent)]
	Hash(#[from] HashError),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::project::tags::{merge_schemes, parse_operations};
	use dicom::dicom_value;

	const SALT: &[u8] = b"unit-test-salt";

	fn scheme(yaml: &str) -> TagScheme {
		merge_schemes(&[parse_operations(yaml).unwrap()], &[], "ANY")
	}

	fn rewrite(object: &InMemDicomObject, scheme: &TagScheme) -> InMemDicomObject {
		let mut uid_map = UidMap::new("2.25", SALT);
		let mut ctx = RewriteContext {
			scheme,
			uid_map: &mut uid_map,
			day_offset: -7,
			project_salt: SALT,
			pseudo_patient_id: "pseudo-id",
		};
		rewrite_object(object, &mut ctx).unwrap()
	}

	#[test]
	fn unlisted_elements_are_deleted() {
		let scheme = scheme(
			r#"
- {group: 0x0008, element: 0x0060, op: keep}
"#,
		);
		let object = InMemDicomObject::from_element_iter([
			InMemElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
			InMemElement::new(tags::STATION_NAME, VR::SH, dicom_value!(Str, "CT99")),
			InMemElement::new(Tag(0x000b, 0x0010), VR::LO, dicom_value!(Str, "VENDOR")),
		]);

		let output = rewrite(&object, &scheme);
		assert!(output.get(tags::MODALITY).is_some());
		assert!(output.get(tags::STATION_NAME).is_none());
		assert!(output.get(Tag(0x000b, 0x0010)).is_none());
	}

	#[test]
	fn date_shift_applies_offset() {
		let scheme = scheme(
			r#"
- {group: 0x0008, element: 0x0020, op: date-shift}
- {group: 0x0008, element: 0x002A, op: date-shift}
- {group: 0x0008, element: 0x0030, op: date-shift}
"#,
		);
		let object = InMemDicomObject::from_element_iter([
			InMemElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20230517")),
			InMemElement::new(
				tags::ACQUISITION_DATE_TIME,
				VR::DT,
				dicom_value!(Str, "20230517093000"),
			),
			InMemElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, "093000")),
		]);

		let output = rewrite(&object, &scheme);
		assert_eq!(
			output.get(tags::STUDY_DATE).unwrap().to_str().unwrap(),
			"20230510"
		);
		assert_eq!(
			output
				.get(tags::ACQUISITION_DATE_TIME)
				.unwrap()
				.to_str()
				.unwrap(),
			"20230510093000"
		);
		assert_eq!(
			output.get(tags::STUDY_TIME).unwrap().to_str().unwrap(),
			"093000"
		);
	}

	#[test]
	fn replace_uid_is_consistent_within_context() {
		let scheme = scheme(
			r#"
- {group: 0x0020, element: 0x000D, op: replace_UID}
- {group: 0x0008, element: 0x1155, op: replace_UID}
"#,
		);
		let object = InMemDicomObject::from_element_iter([
			InMemElement::new(
				tags::STUDY_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.4"),
			),
			InMemElement::new(
				tags::REFERENCED_SOP_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.4"),
			),
		]);

		let output = rewrite(&object, &scheme);
		let study = output
			.get(tags::STUDY_INSTANCE_UID)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		let referenced = output
			.get(tags::REFERENCED_SOP_INSTANCE_UID)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		assert_eq!(study, referenced);
		assert_ne!(study, "1.2.3.4");
	}

	#[test]
	fn secure_hash_replaces_patient_id_with_pseudo_id() {
		let scheme = scheme(
			r#"
- {group: 0x0010, element: 0x0020, op: secure-hash}
"#,
		);
		let object = InMemDicomObject::from_element_iter([InMemElement::new(
			tags::PATIENT_ID,
			VR::LO,
			dicom_value!(Str, "M12345"),
		)]);

		let output = rewrite(&object, &scheme);
		assert_eq!(
			output.get(tags::PATIENT_ID).unwrap().to_str().unwrap(),
			"pseudo-id"
		);
	}

	#[test]
	fn secure_hash_clamps_to_vr_length() {
		let scheme = scheme(
			r#"
- {group: 0x0008, element: 0x0050, op: secure-hash}
"#,
		);
		let object = InMemDicomObject::from_element_iter([InMemElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			dicom_value!(Str, "A1"),
		)]);

		let output = rewrite(&object, &scheme);
		let hashed = output
			.get(tags::ACCESSION_NUMBER)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		assert!(hashed.len() <= 16);
		assert_ne!(hashed, "A1");
	}

	#[test]
	fn num_range_clamps_binary_values() {
		let scheme = scheme(
			r#"
- {group: 0x0028, element: 0x0010, op: num-range, min: 0, max: 512}
"#,
		);
		let object = InMemDicomObject::from_element_iter([InMemElement::new(
			tags::ROWS,
			VR::US,
			dicom_value!(U16, [4096]),
		)]);

		let output = rewrite(&object, &scheme);
		let rows: u16 = output.get(tags::ROWS).unwrap().to_int().unwrap();
		assert_eq!(rows, 512);
	}

	#[test]
	fn kept_sequences_are_rewritten_recursively() {
		let scheme = scheme(
			r#"
- {group: 0x0008, element: 0x1115, op: keep}
- {group: 0x0020, element: 0x000E, op: replace_UID}
"#,
		);

		let item = InMemDicomObject::from_element_iter([
			InMemElement::new(
				tags::SERIES_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.4.5"),
			),
			InMemElement::new(tags::STATION_NAME, VR::SH, dicom_value!(Str, "CT99")),
		]);
		let object = InMemDicomObject::from_element_iter([InMemElement::new(
			tags::REFERENCED_SERIES_SEQUENCE,
			VR::SQ,
			Value::Sequence(DataSetSequence::from(vec![item])),
		)]);

		let output = rewrite(&object, &scheme);
		let sequence = output.get(tags::REFERENCED_SERIES_SEQUENCE).unwrap();
		let items = sequence.value().items().unwrap();
		assert_eq!(items.len(), 1);
		assert!(items[0].get(tags::SERIES_INSTANCE_UID).is_some());
		assert_ne!(
			items[0]
				.get(tags::SERIES_INSTANCE_UID)
				.unwrap()
				.to_str()
				.unwrap(),
			"1.2.3.4.5"
		);
		// Unlisted item elements are deleted inside sequences too.
		assert!(items[0].get(tags::STATION_NAME).is_none());
	}

	#[test]
	fn replace_produces_typed_values() {
		let scheme = scheme(
			r#"
- {group: 0x0010, element: 0x0010, op: replace, value: REDACTED}
- {group: 0x0028, element: 0x0011, op: replace, value: 256}
"#,
		);
		let object = InMemDicomObject::from_element_iter([
			InMemElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "DOE^JANE")),
			InMemElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [1024])),
		]);

		let output = rewrite(&object, &scheme);
		assert_eq!(
			output.get(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
			"REDACTED"
		);
		let columns: u16 = output.get(tags::COLUMNS).unwrap().to_int().unwrap();
		assert_eq!(columns, 256);
	}
}
