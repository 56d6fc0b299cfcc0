//! Serde model for per-project YAML configuration files.

use regex::Regex;
use serde::Deserialize;
use std::fmt::{Display, Formatter};

/// Raw shape of `<config-dir>/<slug>.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectFile {
	pub project: ProjectSection,
	#[serde(default)]
	pub series_filters: Vec<String>,
	#[serde(default = "default_min_instances")]
	pub min_instances_per_series: usize,
	#[serde(default)]
	pub allowed_manufacturers: Vec<ManufacturerPolicy>,
	pub tag_operation_files: TagOperationFiles,
	pub destination: DestinationSection,
	#[serde(default)]
	pub xnat_destination_options: Option<XnatDestinationOptions>,
}

const fn default_min_instances() -> usize {
	1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSection {
	pub name: String,
	#[serde(default)]
	pub azure_kv_alias: Option<String>,
	pub modalities: Vec<String>,
}

/// Tag operation files referenced by a project. At least one base file is
/// required.
#[derive(Debug, Clone, Deserialize)]
pub struct TagOperationFiles {
	pub base: Vec<String>,
	#[serde(default)]
	pub manufacturer_overrides: Vec<String>,
}

/// A manufacturer admitted by the project, with optional per-series-number
/// exclusions.
#[derive(Debug, Clone, Deserialize)]
pub struct ManufacturerPolicy {
	#[serde(with = "serde_regex")]
	pub regex: Regex,
	#[serde(default)]
	pub exclude_series_numbers: Vec<i64>,
}

impl ManufacturerPolicy {
	pub fn matches(&self, manufacturer: &str) -> bool {
		self.regex.is_match(manufacturer)
	}

	pub fn excludes_series_number(&self, series_number: i64) -> bool {
		self.exclude_series_numbers.contains(&series_number)
	}
}

/// Case-insensitive regex (de)serialization helper.
mod serde_regex {
	use regex::{Regex, RegexBuilder};
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
		let pattern = String::deserialize(deserializer)?;
		RegexBuilder::new(&pattern)
			.case_insensitive(true)
			.build()
			.map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSection {
	pub dicom: DicomDestination,
	pub parquet: ParquetDestination,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DicomDestination {
	None,
	Ftps,
	Dicomweb,
	Xnat,
}

impl Display for DicomDestination {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::None => write!(f, "none"),
			Self::Ftps => write!(f, "ftps"),
			Self::Dicomweb => write!(f, "dicomweb"),
			Self::Xnat => write!(f, "xnat"),
		}
	}
}

/// Tabular extracts can only go to FTPS (or nowhere).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetDestination {
	None,
	Ftps,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct XnatDestinationOptions {
	#[serde(default)]
	pub overwrite: XnatOverwrite,
	#[serde(default)]
	pub destination: XnatDestination,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XnatOverwrite {
	#[default]
	None,
	Append,
	Delete,
}

impl Display for XnatOverwrite {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::None => write!(f, "none"),
			Self::Append => write!(f, "append"),
			Self::Delete => write!(f, "delete"),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XnatDestination {
	#[default]
	Archive,
	Prearchive,
}

impl Display for XnatDestination {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Archive => write!(f, "/archive"),
			Self::Prearchive => write!(f, "/prearchive"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PROJECT_YAML: &str = r#"
project:
  name: test-extract
  azure_kv_alias: test-alias
  modalities: ["DX", "CR"]
series_filters:
  - localizer
  - scout
min_instances_per_series: 2
allowed_manufacturers:
  - regex: "siemens"
    exclude_series_numbers: [99]
tag_operation_files:
  base:
    - base.yaml
  manufacturer_overrides:
    - mri-diffusion.yaml
destination:
  dicom: ftps
  parquet: none
xnat_destination_options:
  overwrite: append
  destination: prearchive
"#;

	#[test]
	fn full_project_file_parses() {
		let file: ProjectFile = serde_yaml::from_str(PROJECT_YAML).unwrap();
		assert_eq!(file.project.name, "test-extract");
		assert_eq!(file.project.modalities, vec!["DX", "CR"]);
		assert_eq!(file.min_instances_per_series, 2);
		assert_eq!(file.destination.dicom, DicomDestination::Ftps);
		assert_eq!(file.destination.parquet, ParquetDestination::None);

		let xnat = file.xnat_destination_options.unwrap();
		assert_eq!(xnat.overwrite, XnatOverwrite::Append);
		assert_eq!(xnat.destination, XnatDestination::Prearchive);

		let policy = &file.allowed_manufacturers[0];
		assert!(policy.matches("SIEMENS Healthineers"));
		assert!(policy.excludes_series_number(99));
		assert!(!policy.excludes_series_number(1));
	}

	#[test]
	fn minimal_project_file_parses_with_defaults() {
		let yaml = r#"
project:
  name: minimal
  modalities: ["CT"]
tag_operation_files:
  base: [base.yaml]
destination:
  dicom: none
  parquet: none
"#;
		let file: ProjectFile = serde_yaml::from_str(yaml).unwrap();
		assert!(file.series_filters.is_empty());
		assert_eq!(file.min_instances_per_series, 1);
		assert!(file.allowed_manufacturers.is_empty());
		assert!(file.xnat_destination_options.is_none());
	}

	#[test]
	fn parquet_destination_rejects_dicomweb() {
		let yaml = r#"
project:
  name: bad
  modalities: ["CT"]
tag_operation_files:
  base: [base.yaml]
destination:
  dicom: dicomweb
  parquet: dicomweb
"#;
		assert!(serde_yaml::from_str::<ProjectFile>(yaml).is_err());
	}
}
