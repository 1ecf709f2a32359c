#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

pub(crate) const MESSAGE_TYPE_WELCOME: &str = "session_welcome";
pub(crate) const MESSAGE_TYPE_KEEPALIVE: &str = "session_keepalive";
pub(crate) const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
pub(crate) const MESSAGE_TYPE_RECONNECT: &str = "session_reconnect";

/// A lightweight peek struct to cheaply inspect `metadata.message_type`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeMessage {
	pub(crate) payload: EventSubWelcomePayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomePayload {
	pub(crate) session: EventSubWelcomeSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeSession {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
}

impl EventSubWelcomeSession {
	pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
		self.keepalive_timeout_seconds.map(|secs| Duration::from_millis(secs.saturating_mul(1_000)))
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubReconnectMessage {
	pub(crate) payload: EventSubReconnectPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubReconnectPayload {
	pub(crate) session: EventSubReconnectSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubReconnectSession {
	pub(crate) reconnect_url: String,
}

/// Extract `metadata.message_type` from a raw EventSub WS JSON string.
///
/// Fails for non-JSON frames and for frames without a `metadata.message_type` envelope.
pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse a raw WS message as `session_welcome`.
pub(crate) fn parse_welcome(raw_json: &str) -> anyhow::Result<EventSubWelcomeMessage> {
	serde_json::from_str(raw_json).context("parse session_welcome")
}

/// Parse a raw WS message as `session_reconnect`.
pub(crate) fn parse_reconnect(raw_json: &str) -> anyhow::Result<EventSubReconnectMessage> {
	serde_json::from_str(raw_json).context("parse session_reconnect")
}

/// Extract `metadata.subscription_type` (present on notifications only).
pub(crate) fn peek_subscription_type(raw_json: &str) -> Option<String> {
	serde_json::from_str::<EventSubMetadataPeek>(raw_json)
		.ok()
		.and_then(|p| p.metadata.subscription_type)
}
