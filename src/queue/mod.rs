//! Priority-aware adapter for the RabbitMQ broker.
//!
//! Two logical queues are exposed: *primary* for first-attempt retrieval and
//! *secondary* for the fallback source. Delivery is at-least-once; the
//! scheduler is responsible for idempotence via the export ledger.

use crate::config::QueueConfig;
use crate::message::{ExtractRequest, MessageError};
use crate::types::QueuePriority;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
	BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
	QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Persistent delivery mode, so messages survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueName {
	Primary,
	Secondary,
	DeadLetter,
}

pub struct QueueAdapter {
	channel: Channel,
	config: QueueConfig,
}

impl QueueAdapter {
	/// Connects to the broker and declares the queue topology.
	/// # Errors
	/// Returns a [`QueueError`] if the connection cannot be established or
	/// a queue declaration is refused.
	pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
		let connection =
			Connection::connect(&config.url, ConnectionProperties::default()).await?;
		let channel = connection.create_channel().await?;

		let adapter = Self {
			channel,
			config: config.clone(),
		};
		adapter.declare_queues().await?;
		Ok(adapter)
	}

	async fn declare_queues(&self) -> Result<(), QueueError> {
		let mut arguments = FieldTable::default();
		arguments.insert(
			"x-max-priority".into(),
			AMQPValue::LongInt(i32::from(QueuePriority::MAX)),
		);

		let options = QueueDeclareOptions {
			durable: true,
			..QueueDeclareOptions::default()
		};

		for queue in [&self.config.primary_queue, &self.config.secondary_queue] {
			self.channel
				.queue_declare(queue, options, arguments.clone())
				.await?;
		}
		self.channel
			.queue_declare(&self.config.dead_letter_queue, options, FieldTable::default())
			.await?;

		debug!(
			primary = self.config.primary_queue,
			secondary = self.config.secondary_queue,
			"Declared queue topology"
		);
		Ok(())
	}

	fn queue_name(&self, queue: QueueName) -> &str {
		match queue {
			QueueName::Primary => &self.config.primary_queue,
			QueueName::Secondary => &self.config.secondary_queue,
			QueueName::DeadLetter => &self.config.dead_letter_queue,
		}
	}

	/// Publishes one extract request, carrying its priority to the broker.
	/// # Errors
	/// Returns a [`QueueError`] if the publish is not confirmed.
	pub async fn publish(
		&self,
		queue: QueueName,
		request: &ExtractRequest,
	) -> Result<(), QueueError> {
		let payload = request.to_bytes()?;
		let properties = BasicProperties::default()
			.with_priority(request.priority.get())
			.with_delivery_mode(DELIVERY_MODE_PERSISTENT);

		self.channel
			.basic_publish(
				"",
				self.queue_name(queue),
				BasicPublishOptions::default(),
				&payload,
				properties,
			)
			.await?
			.await?;

		debug!(
			identifier = request.identifier(),
			priority = %request.priority,
			"Published extract request"
		);
		Ok(())
	}

	/// Starts consuming a queue. The prefetch window equals the in-flight
	/// ceiling so the broker never hands out more work than the scheduler
	/// is allowed to run.
	/// # Errors
	/// Returns a [`QueueError`] if the consumer cannot be registered.
	pub async fn consume(
		&self,
		queue: QueueName,
		consumer_tag: &str,
	) -> Result<ExtractConsumer, QueueError> {
		self.channel
			.basic_qos(
				self.config.max_messages_in_flight,
				BasicQosOptions::default(),
			)
			.await?;

		let consumer = self
			.channel
			.basic_consume(
				self.queue_name(queue),
				consumer_tag,
				BasicConsumeOptions::default(),
				FieldTable::default(),
			)
			.await?;

		info!(
			queue = self.queue_name(queue),
			prefetch = self.config.max_messages_in_flight,
			"Consuming extract requests"
		);

		Ok(ExtractConsumer {
			consumer,
			channel: self.channel.clone(),
			dead_letter_queue: self.config.dead_letter_queue.clone(),
		})
	}

	/// Moves a payload to the dead-letter queue (unknown project,
	/// malformed message).
	/// # Errors
	/// Returns a [`QueueError`] if the publish is not confirmed.
	pub async fn dead_letter(&self, payload: &[u8]) -> Result<(), QueueError> {
		self.channel
			.basic_publish(
				"",
				&self.config.dead_letter_queue,
				BasicPublishOptions::default(),
				payload,
				BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
			)
			.await?
			.await?;
		Ok(())
	}

	/// Number of messages currently waiting in a queue.
	/// # Errors
	/// Returns a [`QueueError`] if the passive declaration fails.
	pub async fn depth(&self, queue: QueueName) -> Result<u32, QueueError> {
		let declared = self
			.channel
			.queue_declare(
				self.queue_name(queue),
				QueueDeclareOptions {
					passive: true,
					..QueueDeclareOptions::default()
				},
				FieldTable::default(),
			)
			.await?;
		Ok(declared.message_count())
	}

	/// Drops all messages from a queue. Used by tests and `stop --purge`.
	/// # Errors
	/// Returns a [`QueueError`] if the purge is refused.
	pub async fn purge(&self, queue: QueueName) -> Result<u32, QueueError> {
		let purged = self
			.channel
			.queue_purge(self.queue_name(queue), QueuePurgeOptions::default())
			.await?;
		Ok(purged)
	}
}

/// One in-flight delivery. Must be settled exactly once via [`ack`],
/// [`requeue`] or [`reject`].
///
/// [`ack`]: ExtractDelivery::ack
/// [`requeue`]: ExtractDelivery::requeue
/// [`reject`]: ExtractDelivery::reject
pub struct ExtractDelivery {
	pub request: ExtractRequest,
	acker: Acker,
}

impl ExtractDelivery {
	/// # Errors
	/// Returns a [`QueueError`] if the broker rejects the settlement.
	pub async fn ack(self) -> Result<(), QueueError> {
		self.acker.ack(BasicAckOptions::default()).await?;
		Ok(())
	}

	/// Negative-ack with redelivery: the broker will hand the message out
	/// again, preserving its priority.
	/// # Errors
	/// Returns a [`QueueError`] if the broker rejects the settlement.
	pub async fn requeue(self) -> Result<(), QueueError> {
		self.acker
			.nack(BasicNackOptions {
				requeue: true,
				..BasicNackOptions::default()
			})
			.await?;
		Ok(())
	}

	/// Negative-ack without redelivery.
	/// # Errors
	/// Returns a [`QueueError`] if the broker rejects the settlement.
	pub async fn reject(self) -> Result<(), QueueError> {
		self.acker
			.nack(BasicNackOptions {
				requeue: false,
				..BasicNackOptions::default()
			})
			.await?;
		Ok(())
	}
}

pub struct ExtractConsumer {
	consumer: lapin::Consumer,
	channel: Channel,
	dead_letter_queue: String,
}

impl ExtractConsumer {
	/// Yields the next parseable delivery. Malformed payloads are moved to
	/// the dead-letter queue and skipped.
	pub async fn next(&mut self) -> Option<Result<ExtractDelivery, QueueError>> {
		loop {
			let delivery = match self.consumer.next().await? {
				Ok(delivery) => delivery,
				Err(err) => return Some(Err(QueueError::Broker(err))),
			};

			match ExtractRequest::from_bytes(&delivery.data) {
				Ok(request) => {
					return Some(Ok(ExtractDelivery {
						request,
						acker: delivery.acker,
					}));
				}
				Err(err) => {
					warn!("Dead-lettering malformed message: {err}");
					if let Err(err) = self.dead_letter(&delivery.data).await {
						return Some(Err(err));
					}
					if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await {
						return Some(Err(QueueError::Broker(err)));
					}
				}
			}
		}
	}

	/// Moves a raw payload to the dead-letter queue.
	/// # Errors
	/// Returns a [`QueueError`] if the publish is not confirmed.
	pub async fn dead_letter(&self, payload: &[u8]) -> Result<(), QueueError> {
		self.channel
			.basic_publish(
				"",
				&self.dead_letter_queue,
				BasicPublishOptions::default(),
				payload,
				BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
			)
			.await?
			.await?;
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("Broker error: {0}")]
	Broker(#[from] lapin::Error),
	#[error(transparent)]
	Message(#[from] MessageError),
}
