//! Raw cache coordinator.
//!
//! Holds identifiable studies pulled from clinical systems until they are
//! stable, then hands them to anonymisation. Ingestion is idempotent: a
//! duplicate SOPInstanceUID overwrites and never errors. Eviction is
//! least-recently-used against a byte ceiling; in-progress studies are
//! pinned. Arrival and stability events are published to registered
//! observers.

use crate::config::CacheConfig;
use crate::dimse::cstore::{InstanceSink, ReceivedInstance};
use crate::types::UI;
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STABILITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Callbacks fired by the coordinator. The coordinator owns the lifecycle;
/// the store itself has no plugin hooks.
pub trait CacheObserver: Send + Sync {
	fn on_instance_stored(&self, study_uid: &str, sop_instance_uid: &str);
	fn on_study_stable(&self, study_uid: &str);
}

struct StoredInstance {
	file: Arc<FileDicomObject<InMemDicomObject>>,
	size: u64,
}

struct StudyEntry {
	instances: HashMap<UI, StoredInstance>,
	/// SOPInstanceUIDs advertised by the source, when known.
	expected: Option<HashSet<UI>>,
	last_arrival: Instant,
	last_touch: Instant,
	pinned: u32,
	stable_notified: bool,
}

impl StudyEntry {
	fn new(now: Instant) -> Self {
		Self {
			instances: HashMap::new(),
			expected: None,
			last_arrival: now,
			last_touch: now,
			pinned: 0,
			stable_notified: false,
		}
	}

	fn size(&self) -> u64 {
		self.instances.values().map(|instance| instance.size).sum()
	}

	fn is_complete(&self) -> bool {
		self.expected.as_ref().is_some_and(|expected| {
			expected
				.iter()
				.all(|sop_uid| self.instances.contains_key(sop_uid))
		})
	}

	fn is_stable(&self, stable_age: Duration) -> bool {
		self.is_complete() || self.last_arrival.elapsed() >= stable_age
	}
}

#[derive(Default)]
struct CacheState {
	studies: HashMap<UI, StudyEntry>,
}

impl CacheState {
	fn total_size(&self) -> u64 {
		self.studies.values().map(StudyEntry::size).sum()
	}
}

pub struct RawCache {
	config: CacheConfig,
	state: Mutex<CacheState>,
	observers: RwLock<Vec<Arc<dyn CacheObserver>>>,
}

impl RawCache {
	pub fn new(config: CacheConfig) -> Self {
		Self {
			config,
			state: Mutex::new(CacheState::default()),
			observers: RwLock::new(Vec::new()),
		}
	}

	pub fn subscribe(&self, observer: Arc<dyn CacheObserver>) {
		self.observers.write().unwrap().push(observer);
	}

	/// Stores one instance, overwriting any previous copy. Returns the
	/// study it belongs to.
	/// # Errors
	/// Returns [`CacheError::MissingAttribute`] if the instance carries no
	/// StudyInstanceUID.
	pub fn store(
		&self,
		file: FileDicomObject<InMemDicomObject>,
		sop_instance_uid: &str,
	) -> Result<UI, CacheError> {
		let study_uid = file
			.get(tags::STUDY_INSTANCE_UID)
			.and_then(|element| element.to_str().ok())
			.map(|uid| UI::from(uid.trim_end_matches('\0')))
			.ok_or(CacheError::MissingAttribute(tags::STUDY_INSTANCE_UID))?;

		let mut encoded = Vec::new();
		let size = match file.write_all(&mut encoded) {
			Ok(()) => encoded.len() as u64,
			// Size accounting only; fall back to a rough element count.
			Err(_) => 1024,
		};

		let now = Instant::now();
		{
			let mut state = self.state.lock().unwrap();
			let entry = state
				.studies
				.entry(study_uid.clone())
				.or_insert_with(|| StudyEntry::new(now));

			let overwritten = entry
				.instances
				.insert(
					UI::from(sop_instance_uid),
					StoredInstance {
						file: Arc::new(file),
						size,
					},
				)
				.is_some();
			entry.last_arrival = now;
			entry.last_touch = now;
			entry.stable_notified = false;

			if overwritten {
				debug!(study_uid, sop_instance_uid, "Overwrote duplicate instance");
			}
		}

		for observer in self.observers.read().unwrap().iter() {
			observer.on_instance_stored(&study_uid, sop_instance_uid);
		}

		self.evict_if_needed();
		Ok(study_uid)
	}

	/// Records the SOPInstanceUIDs the source advertised for a study so
	/// completeness can be checked before the quiescence window elapses.
	pub fn set_expected(&self, study_uid: &str, sop_instance_uids: Vec<UI>) {
		let now = Instant::now();
		let mut state = self.state.lock().unwrap();
		let entry = state
			.studies
			.entry(UI::from(study_uid))
			.or_insert_with(|| StudyEntry::new(now));
		entry.expected = Some(sop_instance_uids.into_iter().collect());
	}

	/// Pins a study against eviction while it is being processed. The pin
	/// is released when the returned guard drops.
	pub fn pin(&self, study_uid: &str) -> StudyPin<'_> {
		let now = Instant::now();
		{
			let mut state = self.state.lock().unwrap();
			let entry = state
				.studies
				.entry(UI::from(study_uid))
				.or_insert_with(|| StudyEntry::new(now));
			entry.pinned += 1;
		}
		StudyPin {
			cache: self,
			study_uid: UI::from(study_uid),
		}
	}

	fn unpin(&self, study_uid: &str) {
		let mut state = self.state.lock().unwrap();
		if let Some(entry) = state.studies.get_mut(study_uid) {
			entry.pinned = entry.pinned.saturating_sub(1);
		}
	}

	/// All instances of a study, in deterministic SOPInstanceUID order.
	pub fn instances_of(&self, study_uid: &str) -> Vec<Arc<FileDicomObject<InMemDicomObject>>> {
		let mut state = self.state.lock().unwrap();
		let Some(entry) = state.studies.get_mut(study_uid) else {
			return Vec::new();
		};
		entry.last_touch = Instant::now();

		let mut keyed: Vec<(&UI, &StoredInstance)> = entry.instances.iter().collect();
		keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
		keyed
			.into_iter()
			.map(|(_, instance)| Arc::clone(&instance.file))
			.collect()
	}

	pub fn instance_count(&self, study_uid: &str) -> usize {
		self.state
			.lock()
			.unwrap()
			.studies
			.get(study_uid)
			.map_or(0, |entry| entry.instances.len())
	}

	/// Advertised SOPInstanceUIDs not present in the cache.
	pub fn missing_instances(&self, study_uid: &str) -> Vec<UI> {
		let state = self.state.lock().unwrap();
		let Some(entry) = state.studies.get(study_uid) else {
			return Vec::new();
		};
		let Some(expected) = &entry.expected else {
			return Vec::new();
		};
		let mut missing: Vec<UI> = expected
			.iter()
			.filter(|sop_uid| !entry.instances.contains_key(*sop_uid))
			.cloned()
			.collect();
		missing.sort();
		missing
	}

	pub fn is_stable(&self, study_uid: &str) -> bool {
		self.state
			.lock()
			.unwrap()
			.studies
			.get(study_uid)
			.is_some_and(|entry| entry.is_stable(self.config.stable_age()))
	}

	/// Suspends until the study is stable: quiescent for the configured
	/// window, or complete against the advertised instance list.
	/// # Errors
	/// Returns [`CacheError::Cancelled`] if the signal fires first.
	pub async fn wait_stable(
		&self,
		study_uid: &str,
		cancel: &CancellationToken,
	) -> Result<(), CacheError> {
		loop {
			if self.is_stable(study_uid) {
				return Ok(());
			}
			tokio::select! {
				() = tokio::time::sleep(STABILITY_POLL_INTERVAL) => {}
				() = cancel.cancelled() => return Err(CacheError::Cancelled),
			}
		}
	}

	/// Drops a study after it has been consumed.
	pub fn remove(&self, study_uid: &str) {
		let mut state = self.state.lock().unwrap();
		if state.studies.remove(study_uid).is_some() {
			debug!(study_uid, "Recycled study from raw cache");
		}
	}

	pub fn total_size(&self) -> u64 {
		self.state.lock().unwrap().total_size()
	}

	/// Evicts least-recently-used studies until the cache fits the byte
	/// ceiling. Pinned studies are skipped.
	fn evict_if_needed(&self) {
		let ceiling = self.config.maximum_storage_bytes();
		let mut state = self.state.lock().unwrap();

		while state.total_size() > ceiling {
			let candidate = state
				.studies
				.iter()
				.filter(|(_, entry)| entry.pinned == 0)
				.min_by_key(|(_, entry)| entry.last_touch)
				.map(|(study_uid, _)| study_uid.clone());

			let Some(study_uid) = candidate else {
				warn!("Cache over byte ceiling but every study is pinned");
				return;
			};
			let size = state.studies.remove(&study_uid).map_or(0, |e| e.size());
			info!(study_uid, size, "Evicted least-recently-used study");
		}
	}

	/// Publishes stability events for studies that turned stable since the
	/// last tick. Runs until cancelled.
	pub async fn run_stability_monitor(&self, cancel: CancellationToken) {
		loop {
			tokio::select! {
				() = tokio::time::sleep(STABILITY_POLL_INTERVAL) => {}
				() = cancel.cancelled() => return,
			}

			let newly_stable: Vec<UI> = {
				let mut state = self.state.lock().unwrap();
				let stable_age = self.config.stable_age();
				state
					.studies
					.iter_mut()
					.filter(|(_, entry)| !entry.stable_notified && entry.is_stable(stable_age))
					.map(|(study_uid, entry)| {
						entry.stable_notified = true;
						study_uid.clone()
					})
					.collect()
			};

			for study_uid in newly_stable {
				info!(study_uid, "Study is stable");
				for observer in self.observers.read().unwrap().iter() {
					observer.on_study_stable(&study_uid);
				}
			}
		}
	}
}

/// Pins a study against eviction for as long as it is held.
pub struct StudyPin<'a> {
	cache: &'a RawCache,
	study_uid: UI,
}

impl Drop for StudyPin<'_> {
	fn drop(&mut self) {
		self.cache.unpin(&self.study_uid);
	}
}

/// The sink registered with the store SCP.
pub struct CacheIngest {
	cache: Arc<RawCache>,
}

impl CacheIngest {
	pub const fn new(cache: Arc<RawCache>) -> Self {
		Self { cache }
	}
}

#[async_trait]
impl InstanceSink for CacheIngest {
	async fn on_instance(&self, instance: ReceivedInstance) -> anyhow::Result<()> {
		self.cache
			.store(instance.file, &instance.sop_instance_uid)?;
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Stored instance is missing attribute {0}")]
	MissingAttribute(dicom::core::Tag),
	#[error("Wait for stability was cancelled")]
	Cancelled,
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::uids;
	use dicom::object::FileMetaTableBuilder;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn instance(study_uid: &str, sop_uid: &str) -> FileDicomObject<InMemDicomObject> {
		let object = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::STUDY_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, UI::from(study_uid)),
			),
			DataElement::new(
				tags::SERIES_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, UI::from(format!("{study_uid}.1"))),
			),
			DataElement::new(
				tags::SOP_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, UI::from(sop_uid)),
			),
		]);
		object.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
				.media_storage_sop_instance_uid(sop_uid)
				.transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
				.build()
				.unwrap(),
		)
	}

	fn cache(stable_seconds: u64, max_mb: u64) -> Arc<RawCache> {
		Arc::new(RawCache::new(CacheConfig {
			stable_seconds,
			maximum_storage_size_mb: max_mb,
			concurrent_jobs: 1,
		}))
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_store_overwrites() {
		let cache = cache(60, 100);
		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		assert_eq!(cache.instance_count("1.2.3"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn instances_are_ordered_by_sop_uid() {
		let cache = cache(60, 100);
		cache.store(instance("1.2.3", "1.2.3.9"), "1.2.3.9").unwrap();
		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		cache.store(instance("1.2.3", "1.2.3.5"), "1.2.3.5").unwrap();

		let uids: Vec<String> = cache
			.instances_of("1.2.3")
			.iter()
			.map(|file| {
				file.get(tags::SOP_INSTANCE_UID)
					.unwrap()
					.to_str()
					.unwrap()
					.to_string()
			})
			.collect();
		assert_eq!(uids, vec!["1.2.3.1", "1.2.3.5", "1.2.3.9"]);
	}

	#[tokio::test(start_paused = true)]
	async fn stability_by_completeness() {
		let cache = cache(3600, 100);
		cache.set_expected("1.2.3", vec![UI::from("1.2.3.1"), UI::from("1.2.3.2")]);

		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		assert!(!cache.is_stable("1.2.3"));
		assert_eq!(cache.missing_instances("1.2.3"), vec![UI::from("1.2.3.2")]);

		cache.store(instance("1.2.3", "1.2.3.2"), "1.2.3.2").unwrap();
		assert!(cache.is_stable("1.2.3"));
		assert!(cache.missing_instances("1.2.3").is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn stability_by_quiescence() {
		let cache = cache(60, 100);
		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		assert!(!cache.is_stable("1.2.3"));

		tokio::time::advance(Duration::from_secs(61)).await;
		assert!(cache.is_stable("1.2.3"));

		cache.wait_stable("1.2.3", &CancellationToken::new()).await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn eviction_skips_pinned_studies() {
		// Ceiling of 0 MB evicts everything unpinned on the next store.
		let cache = cache(60, 0);

		let pin = cache.pin("1.2.3");
		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		cache.store(instance("9.8.7", "9.8.7.1"), "9.8.7.1").unwrap();

		assert_eq!(cache.instance_count("1.2.3"), 1);
		assert_eq!(cache.instance_count("9.8.7"), 0);

		drop(pin);
		cache.store(instance("5.5.5", "5.5.5.1"), "5.5.5.1").unwrap();
		assert_eq!(cache.instance_count("1.2.3"), 0);
	}

	struct CountingObserver {
		stored: AtomicUsize,
		stable: AtomicUsize,
	}

	impl CacheObserver for CountingObserver {
		fn on_instance_stored(&self, _study_uid: &str, _sop_instance_uid: &str) {
			self.stored.fetch_add(1, Ordering::SeqCst);
		}
		fn on_study_stable(&self, _study_uid: &str) {
			self.stable.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn observers_receive_arrival_and_stability() {
		let cache = cache(1, 100);
		let observer = Arc::new(CountingObserver {
			stored: AtomicUsize::new(0),
			stable: AtomicUsize::new(0),
		});
		cache.subscribe(Arc::clone(&observer) as Arc<dyn CacheObserver>);

		cache.store(instance("1.2.3", "1.2.3.1"), "1.2.3.1").unwrap();
		assert_eq!(observer.stored.load(Ordering::SeqCst), 1);

		let cancel = CancellationToken::new();
		let monitor = {
			let cache = Arc::clone(&cache);
			let cancel = cancel.clone();
			tokio::spawn(async move { cache.run_stability_monitor(cancel).await })
		};

		tokio::time::advance(Duration::from_secs(3)).await;
		tokio::task::yield_now().await;
		cancel.cancel();
		monitor.await.unwrap();

		assert_eq!(observer.stable.load(Ordering::SeqCst), 1);
	}
}
