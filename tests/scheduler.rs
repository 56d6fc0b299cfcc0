//! End-to-end scheduler scenarios against in-memory collaborators: mock
//! DICOM sources feeding the raw cache, an in-memory ledger and secret
//! store, and a recording exporter.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use pixl::anon::{Anonymiser, AnonymisedStudy};
use pixl::cache::RawCache;
use pixl::config::AppConfig;
use pixl::export::{StudyExporter, UploadError, UploadReceipt};
use pixl::hashing;
use pixl::ledger::{ExportLedger, ExportState, InMemoryLedger};
use pixl::limiter::RateLimiter;
use pixl::message::ExtractRequest;
use pixl::project::{Project, ProjectRegistry};
use pixl::scheduler::{ImagingScheduler, Outcome};
use pixl::secrets::{salt_name, InMemorySecretStore, SecretResolver};
use pixl::source::{DicomSource, SourceError, StudyManifest, StudyQuery};
use pixl::types::{DimsePriority, QueuePriority, SourceKind, UI};
use pixl::Runtime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct MockStudy {
	study_uid: UI,
	instances: Vec<FileDicomObject<InMemDicomObject>>,
}

/// A source whose studies appear in the raw cache when retrieved, the way
/// a C-MOVE ends in C-STOREs against the store SCP.
struct MockSource {
	kind: SourceKind,
	cache: Arc<RawCache>,
	by_mrn_accession: HashMap<(String, String), Vec<MockStudy>>,
}

impl MockSource {
	fn empty(kind: SourceKind, cache: Arc<RawCache>) -> Self {
		Self {
			kind,
			cache,
			by_mrn_accession: HashMap::new(),
		}
	}

	fn with_study(
		kind: SourceKind,
		cache: Arc<RawCache>,
		mrn: &str,
		accession: &str,
		study: MockStudy,
	) -> Self {
		let mut by_mrn_accession = HashMap::new();
		by_mrn_accession.insert(
			(String::from(mrn), String::from(accession)),
			vec![study],
		);
		Self {
			kind,
			cache,
			by_mrn_accession,
		}
	}

	fn studies_for(&self, query: &StudyQuery) -> Vec<&MockStudy> {
		match query {
			StudyQuery::ByUid(uid) => self
				.by_mrn_accession
				.values()
				.flatten()
				.filter(|study| &study.study_uid == uid)
				.collect(),
			StudyQuery::ByMrnAccession { mrn, accession } => self
				.by_mrn_accession
				.get(&(mrn.clone(), accession.clone()))
				.map(|studies| studies.iter().collect())
				.unwrap_or_default(),
		}
	}
}

#[async_trait]
impl DicomSource for MockSource {
	fn kind(&self) -> SourceKind {
		self.kind
	}

	async fn query_study(
		&self,
		query: &StudyQuery,
		_cancel: &CancellationToken,
	) -> Result<Vec<StudyManifest>, SourceError> {
		Ok(self
			.studies_for(query)
			.into_iter()
			.map(|study| StudyManifest {
				study_uid: study.study_uid.clone(),
				instance_count: Some(study.instances.len()),
			})
			.collect())
	}

	async fn list_instances(
		&self,
		study_uid: &str,
		_cancel: &CancellationToken,
	) -> Result<Vec<UI>, SourceError> {
		Ok(self
			.by_mrn_accession
			.values()
			.flatten()
			.filter(|study| study.study_uid == study_uid)
			.flat_map(|study| {
				study.instances.iter().map(|instance| {
					instance
						.get(tags::SOP_INSTANCE_UID)
						.unwrap()
						.to_str()
						.unwrap()
						.to_string()
				})
			})
			.collect())
	}

	async fn retrieve_study(
		&self,
		study_uid: &str,
		_priority: DimsePriority,
		_cancel: &CancellationToken,
	) -> Result<pixl::dimse::cmove::MoveOutcome, SourceError> {
		let mut completed = 0;
		for study in self
			.by_mrn_accession
			.values()
			.flatten()
			.filter(|study| study.study_uid == study_uid)
		{
			for instance in &study.instances {
				let sop_uid = instance
					.get(tags::SOP_INSTANCE_UID)
					.unwrap()
					.to_str()
					.unwrap()
					.to_string();
				self.cache.store(instance.clone(), &sop_uid).unwrap();
				completed += 1;
			}
		}
		Ok(pixl::dimse::cmove::MoveOutcome {
			completed,
			failed: 0,
			warnings: 0,
		})
	}

	async fn retrieve_instances(
		&self,
		study_uid: &str,
		_sop_instance_uids: &[UI],
		priority: DimsePriority,
		cancel: &CancellationToken,
	) -> Result<pixl::dimse::cmove::MoveOutcome, SourceError> {
		self.retrieve_study(study_uid, priority, cancel).await
	}
}

#[derive(Default)]
struct RecordingExporter {
	uploads: Mutex<Vec<(String, String, String, usize)>>,
}

#[async_trait]
impl StudyExporter for RecordingExporter {
	async fn export_study(
		&self,
		project: &Project,
		study: &AnonymisedStudy,
	) -> Result<Option<UploadReceipt>, UploadError> {
		self.uploads.lock().unwrap().push((
			project.slug.clone(),
			study.anon_study_uid.clone(),
			study.pseudo_patient_id.clone(),
			study.instances.len(),
		));
		Ok(Some(UploadReceipt {
			destination: String::from("mock"),
			location: format!("{}/{}.zip", project.slug, study.pseudo_patient_id),
		}))
	}
}

fn project_fixture(name: &str) -> PathBuf {
	let dir = std::env::temp_dir().join(format!("pixl-sched-{name}-{}", std::process::id()));
	let _ = std::fs::remove_dir_all(&dir);
	let tag_dir = dir.join("tag-operations");
	std::fs::create_dir_all(&tag_dir).unwrap();

	std::fs::write(
		tag_dir.join("base.yaml"),
		r#"
- {name: Patient ID, group: 0x0010, element: 0x0020, op: secure-hash}
- {name: Study UID, group: 0x0020, element: 0x000D, op: replace_UID}
- {name: Series UID, group: 0x0020, element: 0x000E, op: replace_UID}
- {name: SOP UID, group: 0x0008, element: 0x0018, op: replace_UID}
- {name: Study Date, group: 0x0008, element: 0x0020, op: date-shift}
- {name: Modality, group: 0x0008, element: 0x0060, op: keep}
- {name: Series Description, group: 0x0008, element: 0x103E, op: keep}
"#,
	)
	.unwrap();

	std::fs::write(
		dir.join("p1.yaml"),
		r#"
project:
  name: p1
  modalities: ["DX", "CR"]
series_filters: [localizer]
tag_operation_files:
  base: [base.yaml]
destination:
  dicom: ftps
  parquet: none
"#,
	)
	.unwrap();
	dir
}

fn instance(
	study: &str,
	series: &str,
	sop: &str,
	description: &str,
) -> FileDicomObject<InMemDicomObject> {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "M1")),
		DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, UI::from(study))),
		DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, UI::from(series)),
		),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, UI::from(sop))),
		DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20230517")),
		DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "DX")),
		DataElement::new(
			tags::SERIES_DESCRIPTION,
			VR::LO,
			dicom_value!(Str, UI::from(description)),
		),
	])
	.with_exact_meta(
		FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop)
			.transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.unwrap(),
	)
}

fn request(mrn: &str, accession: &str) -> ExtractRequest {
	ExtractRequest {
		mrn: String::from(mrn),
		accession_number: String::from(accession),
		study_uid: None,
		study_datetime: Utc.with_ymd_and_hms(2023, 5, 17, 9, 30, 0).unwrap(),
		project_name: String::from("p1"),
		extract_datetime: Utc::now(),
		priority: QueuePriority::new(1).unwrap(),
		procedure_occurrence_id: None,
	}
}

struct Harness {
	scheduler: ImagingScheduler,
	ledger: Arc<InMemoryLedger>,
	secrets: Arc<InMemorySecretStore>,
	exporter: Arc<RecordingExporter>,
	project_dir: PathBuf,
}

fn harness(
	name: &str,
	build_sources: impl FnOnce(Arc<RawCache>) -> (MockSource, MockSource),
) -> Harness {
	let project_dir = project_fixture(name);
	let config = AppConfig::default();

	let cache = Arc::new(RawCache::new(config.cache));
	let (primary, secondary) = build_sources(Arc::clone(&cache));

	let ledger = Arc::new(InMemoryLedger::new());
	let secrets = Arc::new(InMemorySecretStore::new());
	let exporter = Arc::new(RecordingExporter::default());

	let runtime = Arc::new(Runtime {
		registry: Arc::new(ProjectRegistry::load(&project_dir).unwrap()),
		limiter: Arc::new(RateLimiter::new(
			usize::from(config.queue.max_messages_in_flight),
			&[
				(SourceKind::Primary, config.sources.primary.rate),
				(SourceKind::Secondary, config.sources.secondary.rate),
			],
		)),
		cache,
		primary: Arc::new(primary),
		secondary: Arc::new(secondary),
		ledger: Arc::clone(&ledger) as Arc<dyn ExportLedger>,
		secrets: Arc::clone(&secrets) as Arc<dyn SecretResolver>,
		exporter: Arc::clone(&exporter) as Arc<dyn StudyExporter>,
		anonymiser: Anonymiser::new("2.25", 0),
		config,
	});

	Harness {
		scheduler: ImagingScheduler::new(runtime),
		ledger,
		secrets,
		exporter,
		project_dir,
	}
}

fn cleanup(dir: &Path) {
	let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn primary_hit_exports_study() {
	let harness = harness("primary-hit", |cache| {
		let study = MockStudy {
			study_uid: UI::from("1.2.3"),
			instances: vec![
				instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "AP"),
				instance("1.2.3", "1.2.3.1", "1.2.3.1.2", "AP"),
				instance("1.2.3", "1.2.3.2", "1.2.3.2.1", "LAT"),
			],
		};
		(
			MockSource::with_study(SourceKind::Primary, Arc::clone(&cache), "M1", "A1", study),
			MockSource::empty(SourceKind::Secondary, cache),
		)
	});

	let outcome = harness
		.scheduler
		.process_request(&request("M1", "A1"), SourceKind::Primary, &CancellationToken::new())
		.await;
	assert_eq!(outcome, Outcome::Ack);

	let record = harness.ledger.record("p1", "M1/A1").await.unwrap().unwrap();
	assert_eq!(record.state, ExportState::Exported);
	let anon_uid = record.anon_study_uid.unwrap();
	assert_ne!(anon_uid, "1.2.3");

	// The pseudonymised id is the salted digest of MRN + accession.
	let salt = harness.secrets.fetch(&salt_name("p1")).await.unwrap();
	assert_eq!(
		record.pseudo_patient_id.unwrap(),
		hashing::pseudo_patient_id(&salt, "M1", "A1").unwrap()
	);

	let uploads = harness.exporter.uploads.lock().unwrap();
	assert_eq!(uploads.len(), 1);
	let (slug, uploaded_uid, _pseudo, count) = &uploads[0];
	assert_eq!(slug, "p1");
	assert_eq!(uploaded_uid, &anon_uid);
	assert_eq!(*count, 3);

	cleanup(&harness.project_dir);
}

#[tokio::test]
async fn miss_on_primary_falls_back_to_secondary() {
	let harness = harness("fallback", |cache| {
		let study = MockStudy {
			study_uid: UI::from("4.5.6"),
			instances: vec![instance("4.5.6", "4.5.6.1", "4.5.6.1.1", "AP")],
		};
		(
			MockSource::empty(SourceKind::Primary, Arc::clone(&cache)),
			MockSource::with_study(SourceKind::Secondary, cache, "M2", "A2", study),
		)
	});

	let cancel = CancellationToken::new();
	let outcome = harness
		.scheduler
		.process_request(&request("M2", "A2"), SourceKind::Primary, &cancel)
		.await;
	assert_eq!(outcome, Outcome::FallbackToSecondary);

	let outcome = harness
		.scheduler
		.process_request(&request("M2", "A2"), SourceKind::Secondary, &cancel)
		.await;
	assert_eq!(outcome, Outcome::Ack);

	let record = harness.ledger.record("p1", "M2/A2").await.unwrap().unwrap();
	assert_eq!(record.state, ExportState::Exported);

	cleanup(&harness.project_dir);
}

#[tokio::test]
async fn missing_everywhere_is_marked_not_found() {
	let harness = harness("notfound", |cache| {
		(
			MockSource::empty(SourceKind::Primary, Arc::clone(&cache)),
			MockSource::empty(SourceKind::Secondary, cache),
		)
	});

	let cancel = CancellationToken::new();
	assert_eq!(
		harness
			.scheduler
			.process_request(&request("M3", "A3"), SourceKind::Primary, &cancel)
			.await,
		Outcome::FallbackToSecondary
	);
	assert_eq!(
		harness
			.scheduler
			.process_request(&request("M3", "A3"), SourceKind::Secondary, &cancel)
			.await,
		Outcome::Ack
	);

	let record = harness.ledger.record("p1", "M3/A3").await.unwrap().unwrap();
	assert_eq!(record.state, ExportState::Failed);
	assert_eq!(record.error.as_deref(), Some("NotFound"));
	assert!(harness.exporter.uploads.lock().unwrap().is_empty());

	cleanup(&harness.project_dir);
}

#[tokio::test]
async fn duplicate_message_is_dropped_before_anonymisation() {
	let harness = harness("duplicate", |cache| {
		let study = MockStudy {
			study_uid: UI::from("1.2.3"),
			instances: vec![instance("1.2.3", "1.2.3.1", "1.2.3.1.1", "AP")],
		};
		(
			MockSource::with_study(SourceKind::Primary, Arc::clone(&cache), "M1", "A1", study),
			MockSource::empty(SourceKind::Secondary, cache),
		)
	});

	let cancel = CancellationToken::new();
	assert_eq!(
		harness
			.scheduler
			.process_request(&request("M1", "A1"), SourceKind::Primary, &cancel)
			.await,
		Outcome::Ack
	);
	assert_eq!(harness.exporter.uploads.lock().unwrap().len(), 1);

	// Republished duplicate: acked without a second upload.
	assert_eq!(
		harness
			.scheduler
			.process_request(&request("M1", "A1"), SourceKind::Primary, &cancel)
			.await,
		Outcome::Ack
	);
	assert_eq!(harness.exporter.uploads.lock().unwrap().len(), 1);

	cleanup(&harness.project_dir);
}

#[tokio::test]
async fn unknown_project_is_dead_lettered() {
	let harness = harness("unknown", |cache| {
		(
			MockSource::empty(SourceKind::Primary, Arc::clone(&cache)),
			MockSource::empty(SourceKind::Secondary, cache),
		)
	});

	let mut unknown = request("M1", "A1");
	unknown.project_name = String::from("does-not-exist");

	let outcome = harness
		.scheduler
		.process_request(&unknown, SourceKind::Primary, &CancellationToken::new())
		.await;
	assert!(matches!(outcome, Outcome::DeadLetter(_)));

	cleanup(&harness.project_dir);
}

#[tokio::test]
async fn filtered_series_is_absent_from_export() {
	let harness = harness("series-filter", |cache| {
		let study = MockStudy {
			study_uid: UI::from("7.7.7"),
			instances: vec![
				instance("7.7.7", "7.7.7.1", "7.7.7.1.1", "AP erect"),
				instance("7.7.7", "7.7.7.2", "7.7.7.2.1", "LOCALIZER sagittal"),
			],
		};
		(
			MockSource::with_study(SourceKind::Primary, Arc::clone(&cache), "M5", "A5", study),
			MockSource::empty(SourceKind::Secondary, cache),
		)
	});

	let outcome = harness
		.scheduler
		.process_request(&request("M5", "A5"), SourceKind::Primary, &CancellationToken::new())
		.await;
	assert_eq!(outcome, Outcome::Ack);

	let uploads = harness.exporter.uploads.lock().unwrap();
	assert_eq!(uploads.len(), 1);
	assert_eq!(uploads[0].3, 1, "localiser series must not be exported");

	cleanup(&harness.project_dir);
}
