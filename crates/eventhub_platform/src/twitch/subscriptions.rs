#![forbid(unsafe_code)]

//! Sequential, fail-fast subscription of a descriptor list to one EventSub session.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::twitch::descriptor::{DescriptorError, EventDescriptor};
use crate::twitch::helix::{CreatedSubscription, HelixClient};
use crate::{ConnectionStep, ConnectorEvent, ConnectorEventTx, error_event};

const STATUS_ENABLED: &str = "enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
	Pending,
	Enabled,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	pub event: EventDescriptor,

	/// Empty until the provider assigned one.
	pub subscription_id: String,
	pub status: SubscriptionStatus,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
	#[error(transparent)]
	InvalidDescriptor(#[from] DescriptorError),

	#[error("subscription {event} was not enabled (status={status}, id={subscription_id})")]
	NotEnabled {
		event: EventDescriptor,
		subscription_id: String,
		status: String,
	},

	#[error("subscription request for {event} failed: {message}")]
	Request { event: EventDescriptor, message: String },
}

/// The one provider call the pipeline needs.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
	async fn create_subscription(
		&self,
		event: &EventDescriptor,
		session_id: &str,
		user_id: &str,
	) -> anyhow::Result<CreatedSubscription>;
}

#[async_trait]
impl SubscriptionApi for HelixClient {
	async fn create_subscription(
		&self,
		event: &EventDescriptor,
		session_id: &str,
		user_id: &str,
	) -> anyhow::Result<CreatedSubscription> {
		HelixClient::create_subscription(self, event, session_id, user_id).await
	}
}

/// Subscribe every descriptor, one request at a time, stopping at the first failure.
///
/// Emits `Connecting(Subscribing { .. })` after each enabled subscription and a single
/// `Connected` once all succeeded. A failure emits `Error` instead and the remaining
/// descriptors are never parsed nor sent.
///
/// The returned list holds the enabled entries followed by the failed one, if any.
pub async fn subscribe_all(
	api: &dyn SubscriptionApi,
	session_id: &str,
	user_id: &str,
	descriptors: &[String],
	events_tx: &ConnectorEventTx,
) -> (Vec<Subscription>, Result<(), SubscriptionError>) {
	let mut subscriptions = Vec::with_capacity(descriptors.len());

	for raw in descriptors {
		let event = match EventDescriptor::parse(raw) {
			Ok(event) => event,
			Err(e) => {
				let err = SubscriptionError::from(e);
				fail(&err, events_tx);
				return (subscriptions, Err(err));
			}
		};

		let mut entry = Subscription {
			event: event.clone(),
			subscription_id: String::new(),
			status: SubscriptionStatus::Pending,
		};
		debug!(event = %event, session_id, "creating eventsub subscription");

		let outcome = match api.create_subscription(&event, session_id, user_id).await {
			Ok(created) if created.status == STATUS_ENABLED => {
				entry.subscription_id = created.id;
				Ok(())
			}
			Ok(created) => {
				entry.subscription_id = created.id.clone();
				Err(SubscriptionError::NotEnabled {
					event: event.clone(),
					subscription_id: created.id,
					status: created.status,
				})
			}
			Err(e) => Err(SubscriptionError::Request {
				event: event.clone(),
				message: format!("{e:#}"),
			}),
		};

		match outcome {
			Ok(()) => {
				entry.status = SubscriptionStatus::Enabled;
				metrics::counter!("eventhub_subscriptions_total").increment(1);
				info!(event = %event, subscription_id = %entry.subscription_id, "eventsub subscription enabled");

				let _ = events_tx.send(ConnectorEvent::Connecting(ConnectionStep::Subscribing {
					event,
					subscription_id: entry.subscription_id.clone(),
				}));
				subscriptions.push(entry);
			}
			Err(err) => {
				entry.status = SubscriptionStatus::Failed;
				subscriptions.push(entry);
				fail(&err, events_tx);
				return (subscriptions, Err(err));
			}
		}
	}

	let _ = events_tx.send(ConnectorEvent::Connected);
	(subscriptions, Ok(()))
}

fn fail(err: &SubscriptionError, events_tx: &ConnectorEventTx) {
	metrics::counter!("eventhub_subscription_failures_total").increment(1);
	warn!(error = %err, "eventsub subscription pipeline aborted");
	let _ = events_tx.send(error_event("subscribe failed", err));
}
