#![forbid(unsafe_code)]

pub mod oauth;
pub mod twitch;

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::twitch::descriptor::EventDescriptor;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Application id + user access token used for every authenticated provider call.
#[derive(Debug, Clone)]
pub struct Credentials {
	pub application_id: String,
	pub access_token: SecretString,
}

impl Credentials {
	pub fn new(application_id: impl Into<String>, access_token: SecretString) -> Self {
		Self {
			application_id: application_id.into(),
			access_token,
		}
	}
}

/// Progress markers emitted while a connect cycle is under way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStep {
	/// Dialing has started.
	Initiated,

	/// The websocket handshake completed; waiting for `session_welcome`.
	WebSocketConnected,

	/// One subscription was enabled.
	Subscribing {
		event: EventDescriptor,
		subscription_id: String,
	},
}

/// Connector → consumer event message.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
	Connecting(ConnectionStep),

	/// Every descriptor of the current cycle was subscribed.
	Connected,

	/// The socket closed without a pending reconnect hand-off.
	Disconnected,

	/// Raw `session_keepalive` / `notification` frame, unchanged.
	Message(String),

	/// Human-readable failure from a background task.
	Error(String),
}

pub type ConnectorEventTx = mpsc::UnboundedSender<ConnectorEvent>;
pub type ConnectorEventRx = mpsc::UnboundedReceiver<ConnectorEvent>;

/// Build a standard connector event channel pair.
pub fn connector_channel() -> (ConnectorEventTx, ConnectorEventRx) {
	mpsc::unbounded_channel()
}

/// Build an error event.
pub fn error_event(detail: impl Into<String>, err: impl fmt::Display) -> ConnectorEvent {
	ConnectorEvent::Error(format!("{}: {err}", detail.into()))
}

/// Generate an opaque id for a connect cycle (logs only).
pub fn new_cycle_id() -> String {
	Uuid::new_v4().to_string()
}
