//! A small association pool keyed by presentation parameter.
//!
//! Associations are negotiated per abstract syntax, so a pooled slot is
//! only reused when the requested presentation matches. Recycling probes
//! the association with C-ECHO.

use super::client::{ClientAssociation, ClientAssociationOptions};
use super::AssociationError;
use crate::dimse::cecho::EchoScu;
use crate::types::UI;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use futures::TryFutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out waiting for an association")]
	Timeout,
	#[error("Failed to recycle association: {0}")]
	Recycle(String),
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter)
		-> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	/// Takes an association matching the presentation parameter, recycling
	/// a pooled one when possible.
	/// # Errors
	/// Returns a [`PoolError`] on timeout or connection failure.
	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target_slot = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));

				if let Some(target_slot) = target_slot {
					Some(target_slot)
				} else {
					// Make room by dropping the oldest slot.
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(mut slot) = slot {
				let recycle_result = self.inner.manager.recycle(&slot.object).await;
				if recycle_result.is_ok() {
					slot.metrics.recycle_count += 1;
					slot.metrics.last_used = Instant::now();
					slot
				} else {
					let object = self.inner.manager.create(&parameter).await?;
					ObjectInner::fresh(object, parameter)
				}
			} else {
				let object = self.inner.manager.create(&parameter).await?;
				ObjectInner::fresh(object, parameter)
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(object) = self.inner.take() {
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(object);
			}
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	metrics: Metrics,
}

impl<M: Manager> ObjectInner<M> {
	fn fresh(object: M::Object, parameter: M::Parameter) -> Self {
		let now = Instant::now();
		Self {
			object,
			parameter,
			metrics: Metrics {
				recycle_count: 0,
				created: now,
				last_used: now,
			},
		}
	}
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

/// The presentation a caller needs. Two parameters are compatible when the
/// abstract syntax matches and at least one transfer syntax overlaps.
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

pub struct AssociationManager {
	pub address: SocketAddr,
	pub calling_aet: String,
	pub called_aet: String,
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address: self.address,
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(PoolError::Backend);

		if let Ok(association) = &association {
			info!(
				association_uuid = association.uuid().to_string(),
				called_aet = self.called_aet,
				"Created new client association"
			);
		} else {
			warn!(called_aet = self.called_aet, "Failed to create client association");
		}

		association
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		let successful = EchoScu::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("Failed to recycle association: {err}"))?;

		if successful {
			info!(
				association_uuid = association.uuid().to_string(),
				"Recycled association"
			);
			Ok(())
		} else {
			warn!(
				association_uuid = association.uuid().to_string(),
				"Recycling failed"
			);
			Err(String::from("C-ECHO returned non-successful status code"))
		}
	}
}

/// An association pool bound to one upstream node.
pub type AssociationPool = Pool<AssociationManager>;
