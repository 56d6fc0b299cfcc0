//! Zip packaging of anonymised studies.

use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom::dictionary_std::tags;
use std::io::{Cursor, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Packs every instance of a study into one zip, one `<SOPInstanceUID>.dcm`
/// entry per instance.
/// # Errors
/// Returns an [`ArchiveError`] if an instance cannot be encoded.
pub fn zip_study(
	instances: &[FileDicomObject<InMemDicomObject>],
) -> Result<Vec<u8>, ArchiveError> {
	let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
	let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

	for (index, instance) in instances.iter().enumerate() {
		let sop_uid = instance
			.get(tags::SOP_INSTANCE_UID)
			.and_then(|element| element.to_str().ok())
			.map_or_else(
				|| format!("instance-{index}"),
				|uid| uid.trim_end_matches(['\0', ' ']).to_owned(),
			);

		let mut encoded = Vec::new();
		instance
			.write_all(&mut encoded)
			.map_err(|err| ArchiveError::Encode(err.to_string()))?;

		writer.start_file(format!("{sop_uid}.dcm"), options)?;
		writer.write_all(&encoded)?;
	}

	let cursor = writer.finish()?;
	Ok(cursor.into_inner())
}

#[derive(Debug, Error)]
pub enum ArchiveError {
	#[error("Failed to encode instance: {0}")]
	Encode(String),
	#[error("Failed to write zip: {0}")]
	Zip(#[from] zip::result::ZipError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}
