//! Per-study anonymisation.
//!
//! One engine call rewrites every instance of a study so the output is
//! internally consistent: one date-shift offset, one UID rewrite map, one
//! pseudonymised patient identifier. A single failing instance fails the
//! whole study; skipped instances are excluded without failing it.

pub mod dates;
pub mod ops;
pub mod uid;
pub mod validate;

use crate::hashing::{self, HashError};
use crate::project::Project;
use crate::types::UI;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject, Tag};
use ops::{OpError, RewriteContext};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uid::UidMap;
use validate::Issue;

/// Why an instance was left out of the anonymised study. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
	ModalityNotAllowed(String),
	SeriesFiltered(String),
	ManufacturerNotAllowed(String),
	SeriesNumberExcluded(i64),
	SeriesTooSmall { series_uid: UI, count: usize },
}

impl std::fmt::Display for SkipReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::ModalityNotAllowed(modality) => write!(f, "modality {modality} not allowed"),
			Self::SeriesFiltered(description) => {
				write!(f, "series description '{description}' is filtered")
			}
			Self::ManufacturerNotAllowed(manufacturer) => {
				write!(f, "manufacturer '{manufacturer}' not allowed")
			}
			Self::SeriesNumberExcluded(number) => write!(f, "series number {number} excluded"),
			Self::SeriesTooSmall { series_uid, count } => {
				write!(f, "series {series_uid} has only {count} usable instances")
			}
		}
	}
}

/// The result of anonymising one study.
pub struct AnonymisedStudy {
	pub anon_study_uid: UI,
	pub pseudo_patient_id: String,
	pub instances: Vec<FileDicomObject<InMemDicomObject>>,
	pub skipped: Vec<SkipReason>,
}

pub struct Anonymiser {
	uid_root: String,
	/// Whole-study extra offset on top of the per-study random shift.
	extra_day_offset: i64,
}

impl Anonymiser {
	pub fn new(uid_root: &str, extra_day_offset: i64) -> Self {
		Self {
			uid_root: String::from(uid_root),
			extra_day_offset,
		}
	}

	/// Rewrites every usable instance of a study.
	///
	/// `source_study_uids` lists every StudyInstanceUID retrieved for the
	/// request; the first is canonical and the rest are merged into the
	/// same regenerated study.
	/// # Errors
	/// Returns an [`AnonError`] if any admitted instance fails to rewrite
	/// or the rewrite introduces validation errors (atomicity), or if no
	/// instance survives the skip conditions.
	#[instrument(skip_all, fields(project = project.slug, study_uid = canonical_uid(source_study_uids)))]
	pub fn anonymise_study(
		&self,
		project: &Project,
		project_salt: &[u8],
		mrn: &str,
		accession_number: &str,
		source_study_uids: &[UI],
		instances: &[Arc<FileDicomObject<InMemDicomObject>>],
	) -> Result<AnonymisedStudy, AnonError> {
		let canonical = source_study_uids.first().ok_or(AnonError::NoStudy)?;

		let day_offset =
			hashing::study_day_offset(project_salt, canonical)? + self.extra_day_offset;
		let pseudo_patient_id =
			hashing::pseudo_patient_id(project_salt, mrn, accession_number)?;

		let mut uid_map = UidMap::new(&self.uid_root, project_salt);
		for merged in &source_study_uids[1..] {
			uid_map.alias(merged, canonical)?;
		}
		let anon_study_uid = uid_map.regenerate(canonical)?;

		// Study-level pre-pass: decide skips before any per-instance work
		// so small series are dropped as a whole.
		let verdicts = self.evaluate_skips(project, instances);

		let mut output = Vec::with_capacity(instances.len());
		let mut skipped = Vec::new();

		for (instance, verdict) in instances.iter().zip(verdicts) {
			if let Some(reason) = verdict {
				debug!("Skipping instance: {reason}");
				skipped.push(reason);
				continue;
			}

			let manufacturer =
				element_str(instance, tags::MANUFACTURER).unwrap_or_default();
			let scheme = project.scheme_for(&manufacturer);

			let before = validate::check(instance);

			let mut ctx = RewriteContext {
				scheme: &scheme,
				uid_map: &mut uid_map,
				day_offset,
				project_salt,
				pseudo_patient_id: &pseudo_patient_id,
			};
			let rewritten = ops::rewrite_object(instance, &mut ctx)?;

			let after = validate::check(&rewritten);
			let introduced = validate::new_issues(&before, &after);
			if validate::has_errors(&introduced) {
				warn!(
					"Anonymisation introduced {} validation issue(s)",
					introduced.len()
				);
				return Err(AnonError::Validation(introduced));
			}

			output.push(rebuild_file(instance, rewritten)?);
		}

		if output.is_empty() {
			return Err(AnonError::AllInstancesSkipped(skipped));
		}

		info!(
			instances = output.len(),
			skipped = skipped.len(),
			"Anonymised study"
		);

		Ok(AnonymisedStudy {
			anon_study_uid,
			pseudo_patient_id,
			instances: output,
			skipped,
		})
	}

	/// Applies the project skip conditions to each instance, then drops
	/// whole series that end up below the minimum usable instance count.
	fn evaluate_skips(
		&self,
		project: &Project,
		instances: &[Arc<FileDicomObject<InMemDicomObject>>],
	) -> Vec<Option<SkipReason>> {
		let mut verdicts: Vec<Option<SkipReason>> = instances
			.iter()
			.map(|instance| instance_skip_reason(project, instance))
			.collect();

		let mut usable_per_series: HashMap<UI, usize> = HashMap::new();
		for (instance, verdict) in instances.iter().zip(&verdicts) {
			if verdict.is_none() {
				let series = element_str(instance, tags::SERIES_INSTANCE_UID).unwrap_or_default();
				*usable_per_series.entry(series).or_default() += 1;
			}
		}

		let minimum = project.min_instances_per_series();
		for (instance, verdict) in instances.iter().zip(verdicts.iter_mut()) {
			if verdict.is_none() {
				let series = element_str(instance, tags::SERIES_INSTANCE_UID).unwrap_or_default();
				let count = usable_per_series.get(&series).copied().unwrap_or(0);
				if count < minimum {
					*verdict = Some(SkipReason::SeriesTooSmall {
						series_uid: series,
						count,
					});
				}
			}
		}

		verdicts
	}
}

fn canonical_uid(source_study_uids: &[UI]) -> &str {
	source_study_uids.first().map_or("", String::as_str)
}

fn element_str(object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
}

fn instance_skip_reason(
	project: &Project,
	instance: &FileDicomObject<InMemDicomObject>,
) -> Option<SkipReason> {
	let modality = element_str(instance, tags::MODALITY).unwrap_or_default();
	if !project.is_modality_allowed(&modality) {
		return Some(SkipReason::ModalityNotAllowed(modality));
	}

	if let Some(description) = element_str(instance, tags::SERIES_DESCRIPTION) {
		if project.is_series_excluded(&description) {
			return Some(SkipReason::SeriesFiltered(description));
		}
	}

	if project.restricts_manufacturers() {
		let manufacturer = element_str(instance, tags::MANUFACTURER).unwrap_or_default();
		let Some(policy) = project.manufacturer_policy(&manufacturer) else {
			return Some(SkipReason::ManufacturerNotAllowed(manufacturer));
		};
		let series_number = instance
			.get(tags::SERIES_NUMBER)
			.and_then(|element| element.to_int::<i64>().ok());
		if let Some(series_number) = series_number {
			if policy.excludes_series_number(series_number) {
				return Some(SkipReason::SeriesNumberExcluded(series_number));
			}
		}
	}

	None
}

/// Wraps a rewritten data set in file meta consistent with its new
/// identifiers, keeping the original transfer syntax.
fn rebuild_file(
	original: &FileDicomObject<InMemDicomObject>,
	rewritten: InMemDicomObject,
) -> Result<FileDicomObject<InMemDicomObject>, AnonError> {
	let sop_instance_uid = rewritten
		.get(tags::SOP_INSTANCE_UID)
		.and_then(|element| element.to_str().ok())
		.map(|uid| uid.trim_end_matches(['\0', ' ']).to_owned())
		.ok_or(AnonError::MissingRewrittenUid)?;

	let sop_class_uid = original.meta().media_storage_sop_class_uid.clone();
	let transfer_syntax = original.meta().transfer_syntax.clone();

	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(sop_class_uid.trim_end_matches('\0'))
		.media_storage_sop_instance_uid(&sop_instance_uid)
		.transfer_syntax(transfer_syntax.trim_end_matches('\0'))
		.build()
		.map_err(|err| AnonError::Meta(err.to_string()))?;

	Ok(rewritten.with_exact_meta(meta))
}

#[derive(Debug, Error)]
pub enum AnonError {
	#[error("No source study to anonymise")]
	NoStudy,
	#[error("Every instance was skipped by project policy")]
	AllInstancesSkipped(Vec<SkipReason>),
	#[error("Rewrite failed: {0}")]
	Rewrite(#[from] OpError),
	#[error(transparent)]
	Hash(#[from] HashError),
	#[error("Anonymisation introduced validation errors: {0:?}")]
	Validation(Vec<Issue>),
	#[error("Rewritten instance lost its SOPInstanceUID")]
	MissingRewrittenUid,
	#[error("Failed to rebuild file meta: {0}")]
	Meta(String),
}
