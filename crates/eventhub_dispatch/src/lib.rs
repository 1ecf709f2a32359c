#![forbid(unsafe_code)]

//! Local fan-out of upstream notifications: a WebSocket broadcast server and a UDP sender.

pub mod udp_sender;
pub mod ws_server;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

pub use udp_sender::UdpFanoutSender;
pub use ws_server::WsBroadcastServer;

/// Sink lifecycle and client events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
	WsServerStarted { addr: SocketAddr },
	/// `start` could not bind; the server stays stopped.
	WsServerFailed { error: String },
	WsServerStopped,
	ClientConnected { client_id: u64, peer: SocketAddr },
	ClientDisconnected { client_id: u64, peer: SocketAddr },
	UdpSenderStarted,
	UdpSenderStopped,
}

pub type DispatchEventTx = mpsc::UnboundedSender<DispatchEvent>;
pub type DispatchEventRx = mpsc::UnboundedReceiver<DispatchEvent>;

pub fn dispatch_channel() -> (DispatchEventTx, DispatchEventRx) {
	mpsc::unbounded_channel()
}

/// Credentials handed to every new WebSocket client so it can call the provider API itself.
///
/// Unset fields serialize as explicit `null`.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
	pub application_id: Option<String>,
	pub access_token: Option<String>,
	pub user_id: Option<String>,
}

impl fmt::Debug for ClientMetadata {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientMetadata")
			.field("application_id", &self.application_id)
			.field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
			.field("user_id", &self.user_id)
			.finish()
	}
}

#[derive(Serialize)]
struct MetadataFrame<'a> {
	metadata: &'a ClientMetadata,
}

impl ClientMetadata {
	/// `{"metadata":{"application_id":…,"access_token":…,"user_id":…}}`
	pub fn to_frame(&self) -> serde_json::Result<String> {
		serde_json::to_string(&MetadataFrame { metadata: self })
	}
}

/// Read-mostly metadata snapshot, replaced whole when login state changes.
#[derive(Clone, Default)]
pub struct MetadataHandle {
	inner: Arc<RwLock<Arc<ClientMetadata>>>,
}

impl MetadataHandle {
	pub fn new(metadata: ClientMetadata) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Arc::new(metadata))),
		}
	}

	pub fn snapshot(&self) -> Arc<ClientMetadata> {
		self.inner.read().clone()
	}

	pub fn replace(&self, metadata: ClientMetadata) {
		*self.inner.write() = Arc::new(metadata);
	}
}

/// Per-sink result of one `Fanout::dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOutcome {
	/// Clients the message was handed to (0 when the server is stopped).
	pub ws_clients: usize,
	pub udp_queued: bool,
}

/// Hands each notification to both sinks. Neither sink can fail the other.
#[derive(Clone)]
pub struct Fanout {
	ws: Arc<WsBroadcastServer>,
	udp: UdpFanoutSender,
}

impl Fanout {
	pub fn new(ws: Arc<WsBroadcastServer>, udp: UdpFanoutSender) -> Self {
		Self { ws, udp }
	}

	pub fn ws(&self) -> &WsBroadcastServer {
		&self.ws
	}

	pub fn udp(&self) -> &UdpFanoutSender {
		&self.udp
	}

	pub fn dispatch(&self, message: &str) -> FanoutOutcome {
		let ws_clients = self.ws.broadcast(message);
		let udp_queued = self.udp.enqueue(message);
		FanoutOutcome { ws_clients, udp_queued }
	}
}
