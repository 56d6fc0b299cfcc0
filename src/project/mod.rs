//! Per-project anonymisation and destination policy.
//!
//! A directory of YAML files is read once at startup and again on SIGHUP.
//! The resolved projects are immutable; a reload swaps the whole index
//! atomically.

mod model;
pub mod tags;

pub use model::{
	DestinationSection, DicomDestination, ManufacturerPolicy, ParquetDestination, ProjectFile,
	XnatDestination, XnatDestinationOptions, XnatOverwrite,
};
pub use tags::{ManufacturerOverride, SchemeError, TagOperation, TagScheme};

use dicom::core::Tag;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Where a project's anonymised output goes.
#[derive(Debug, Clone, Copy)]
pub struct DestinationSpec {
	pub dicom: DicomDestination,
	pub parquet: ParquetDestination,
	pub xnat: XnatDestinationOptions,
}

/// One fully resolved project: validated configuration plus parsed tag
/// operation files.
pub struct Project {
	pub slug: String,
	config: ProjectFile,
	base: Vec<Vec<(Tag, TagOperation)>>,
	overrides: Vec<ManufacturerOverride>,
}

impl Project {
	/// The merged tag scheme applying to an instance of the given
	/// manufacturer.
	pub fn scheme_for(&self, manufacturer: &str) -> TagScheme {
		tags::merge_schemes(&self.base, &self.overrides, manufacturer)
	}

	/// Case-insensitive substring check against the project's series
	/// filters. This data is ultimately typed by a human, and different
	/// image sources use different case conventions.
	pub fn is_series_excluded(&self, series_description: &str) -> bool {
		let description = series_description.to_uppercase();
		self.config
			.series_filters
			.iter()
			.any(|filter| description.contains(&filter.to_uppercase()))
	}

	pub fn is_modality_allowed(&self, modality: &str) -> bool {
		self.config
			.project
			.modalities
			.iter()
			.any(|allowed| allowed == modality)
	}

	/// The first allowed-manufacturer policy matching, if the project
	/// restricts manufacturers at all.
	pub fn manufacturer_policy(&self, manufacturer: &str) -> Option<&ManufacturerPolicy> {
		self.config
			.allowed_manufacturers
			.iter()
			.find(|policy| policy.matches(manufacturer))
	}

	pub fn restricts_manufacturers(&self) -> bool {
		!self.config.allowed_manufacturers.is_empty()
	}

	pub fn min_instances_per_series(&self) -> usize {
		self.config.min_instances_per_series
	}

	pub fn destination(&self) -> DestinationSpec {
		DestinationSpec {
			dicom: self.config.destination.dicom,
			parquet: self.config.destination.parquet,
			xnat: self.config.xnat_destination_options.unwrap_or_default(),
		}
	}

	/// Prefix for key-vault secret names: the configured alias, falling
	/// back to the project slug.
	pub fn keyvault_prefix(&self) -> &str {
		self.config
			.project
			.azure_kv_alias
			.as_deref()
			.unwrap_or(&self.slug)
	}
}

pub struct ProjectRegistry {
	config_dir: PathBuf,
	projects: RwLock<Arc<HashMap<String, Arc<Project>>>>,
}

impl ProjectRegistry {
	/// Loads every `<slug>.yaml` under the configuration directory.
	/// # Errors
	/// Returns [`ProjectError::ConfigInvalid`] if any file fails to parse
	/// or validate; startup must not proceed with a partial index.
	pub fn load(config_dir: &Path) -> Result<Self, ProjectError> {
		let projects = Self::load_dir(config_dir)?;
		info!(
			count = projects.len(),
			dir = %config_dir.display(),
			"Loaded project configurations"
		);
		Ok(Self {
			config_dir: config_dir.to_path_buf(),
			projects: RwLock::new(Arc::new(projects)),
		})
	}

	/// Re-reads the configuration directory and swaps the index. On error
	/// the previous index stays in place.
	/// # Errors
	/// Returns [`ProjectError::ConfigInvalid`] if any file fails to load.
	pub fn reload(&self) -> Result<(), ProjectError> {
		let projects = Self::load_dir(&self.config_dir)?;
		info!(count = projects.len(), "Reloaded project configurations");
		*self.projects.write().unwrap() = Arc::new(projects);
		Ok(())
	}

	/// # Errors
	/// Returns [`ProjectError::UnknownProject`] for a slug without a
	/// configuration file; the scheduler dead-letters such messages.
	pub fn get(&self, slug: &str) -> Result<Arc<Project>, ProjectError> {
		self.projects
			.read()
			.unwrap()
			.get(slug)
			.cloned()
			.ok_or_else(|| ProjectError::UnknownProject(String::from(slug)))
	}

	pub fn slugs(&self) -> Vec<String> {
		let mut slugs: Vec<String> = self.projects.read().unwrap().keys().cloned().collect();
		slugs.sort();
		slugs
	}

	/// Re-reads project configuration whenever the process receives
	/// SIGHUP.
	#[cfg(unix)]
	pub fn reload_on_sighup(self: Arc<Self>) {
		let registry = self;
		tokio::spawn(async move {
			let Ok(mut hangup) =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
			else {
				warn!("Failed to install SIGHUP handler; reload disabled");
				return;
			};
			while hangup.recv().await.is_some() {
				if let Err(err) = registry.reload() {
					warn!("Configuration reload failed, keeping previous: {err}");
				}
			}
		});
	}

	fn load_dir(config_dir: &Path) -> Result<HashMap<String, Arc<Project>>, ProjectError> {
		let mut projects = HashMap::new();

		let entries = std::fs::read_dir(config_dir).map_err(|source| {
			ProjectError::ConfigInvalid {
				path: config_dir.to_path_buf(),
				reason: source.to_string(),
			}
		})?;

		for entry in entries {
			let path = entry
				.map_err(|source| ProjectError::ConfigInvalid {
					path: config_dir.to_path_buf(),
					reason: source.to_string(),
				})?
				.path();

			if path.extension().and_then(|ext| ext.to_str()) != Some("yaml") || !path.is_file() {
				continue;
			}

			let project = Self::load_project(config_dir, &path)?;
			projects.insert(project.slug.clone(), Arc::new(project));
		}

		Ok(projects)
	}

	fn load_project(config_dir: &Path, path: &Path) -> Result<Project, ProjectError> {
		let invalid = |reason: String| ProjectError::ConfigInvalid {
			path: path.to_path_buf(),
			reason,
		};

		let slug = path
			.file_stem()
			.and_then(|stem| stem.to_str())
			.ok_or_else(|| invalid(String::from("file name is not valid UTF-8")))?
			.to_owned();

		let contents = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
		let config: ProjectFile =
			serde_yaml::from_str(&contents).map_err(|err| invalid(err.to_string()))?;

		if config.project.name != slug {
			return Err(invalid(format!(
				"project name '{}' does not match file name '{slug}'",
				config.project.name
			)));
		}

		let tag_dir = config_dir.join("tag-operations");
		let base = config
			.tag_operation_files
			.base
			.iter()
			.map(|file| {
				let file_path = tag_dir.join(file);
				let yaml = std::fs::read_to_string(&file_path)
					.map_err(|err| invalid(format!("{}: {err}", file_path.display())))?;
				tags::parse_operations(&yaml)
					.map_err(|err| invalid(format!("{}: {err}", file_path.display())))
			})
			.collect::<Result<Vec<_>, _>>()?;

		if base.is_empty() {
			return Err(invalid(String::from(
				"at least one base tag operation file is required",
			)));
		}

		let override_dir = tag_dir.join("manufacturer-overrides");
		let overrides = config
			.tag_operation_files
			.manufacturer_overrides
			.iter()
			.map(|file| {
				let file_path = override_dir.join(file);
				let yaml = std::fs::read_to_string(&file_path)
					.map_err(|err| invalid(format!("{}: {err}", file_path.display())))?;
				tags::parse_overrides(&yaml)
					.map_err(|err| invalid(format!("{}: {err}", file_path.display())))
			})
			.collect::<Result<Vec<_>, _>>()?
			.into_iter()
			.flatten()
			.collect();

		Ok(Project {
			slug,
			config,
			base,
			overrides,
		})
	}
}

#[derive(Debug, Error)]
pub enum ProjectError {
	#[error("Invalid project configuration {path}: {reason}")]
	ConfigInvalid { path: PathBuf, reason: String },
	#[error("No configuration for project '{0}'")]
	UnknownProject(String),
}
