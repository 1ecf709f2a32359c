#![forbid(unsafe_code)]

//! Upstream EventSub session: handshake, keepalive liveness and the reconnect hand-off.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::eventsub::{self, MESSAGE_TYPE_KEEPALIVE, MESSAGE_TYPE_NOTIFICATION, MESSAGE_TYPE_RECONNECT, MESSAGE_TYPE_WELCOME};
use super::helix::{DEFAULT_HELIX_BASE_URL, DEFAULT_REQUEST_TIMEOUT, HelixClient};
use super::subscriptions::{SubscriptionApi, subscribe_all};
use crate::{ConnectionStep, ConnectorEvent, ConnectorEventTx, Credentials, error_event, new_cycle_id};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Keepalive assumed until a welcome says otherwise.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Slack on top of the keepalive before a silent socket counts as dead.
pub const LIVENESS_GRACE: Duration = Duration::from_millis(5_000);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;
pub type SubscriptionApiFactory = Arc<dyn Fn(&Credentials) -> anyhow::Result<Arc<dyn SubscriptionApi>> + Send + Sync>;

/// EventSub connector configuration.
#[derive(Clone)]
pub struct ConnectorConfig {
	pub eventsub_ws_url: String,
	pub helix_base_url: String,
	pub request_timeout: Duration,

	/// Overrides how sockets are dialed.
	pub ws_connector: Option<WsConnector>,

	/// Overrides how the subscription API is built from credentials.
	pub api_factory: Option<SubscriptionApiFactory>,
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			eventsub_ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			ws_connector: None,
			api_factory: None,
		}
	}
}

/// Everything one connect cycle needs, reused verbatim by a reconnect.
struct ConnectRequest {
	credentials: Credentials,
	user_id: String,
	descriptors: Vec<String>,
}

/// Shared session fields. Written by the receive loop, read by the liveness test.
#[derive(Debug)]
pub(crate) struct SessionState {
	pub(crate) socket_open: bool,
	pub(crate) dialing: bool,
	pub(crate) session_id: Option<String>,
	pub(crate) keepalive_interval: Duration,
	pub(crate) pending_reconnect_url: Option<String>,
	pub(crate) last_message_at: Option<Instant>,
	pub(crate) local_close: bool,

	/// Bumped per dialed socket; a receive loop only owns the state while it matches.
	pub(crate) generation: u64,
	close_tx: Option<oneshot::Sender<()>>,
}

impl Default for SessionState {
	fn default() -> Self {
		Self {
			socket_open: false,
			dialing: false,
			session_id: None,
			keepalive_interval: DEFAULT_KEEPALIVE,
			pending_reconnect_url: None,
			last_message_at: None,
			local_close: false,
			generation: 0,
			close_tx: None,
		}
	}
}

impl SessionState {
	/// Open and heard from within `keepalive + grace`.
	pub(crate) fn is_alive(&self, now: Instant) -> bool {
		self.socket_open
			&& self
				.last_message_at
				.is_some_and(|at| now.saturating_duration_since(at) < self.keepalive_interval + LIVENESS_GRACE)
	}
}

enum Flow {
	Continue,
	CloseForReconnect,
}

struct Inner {
	cfg: ConnectorConfig,
	events_tx: ConnectorEventTx,
	state: Mutex<SessionState>,
}

/// Owns the single upstream EventSub connection.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct EventSubConnector {
	inner: Arc<Inner>,
}

impl EventSubConnector {
	pub fn new(cfg: ConnectorConfig, events_tx: ConnectorEventTx) -> Self {
		Self {
			inner: Arc::new(Inner {
				cfg,
				events_tx,
				state: Mutex::new(SessionState::default()),
			}),
		}
	}

	/// Dial (the pending reconnect URL, else the configured endpoint) and start receiving.
	///
	/// Returns `false` without touching the session when already connected, and `false`
	/// plus an `Error` event when the socket cannot be opened.
	pub async fn connect(&self, credentials: Credentials, user_id: impl Into<String>, descriptors: Vec<String>) -> bool {
		let req = Arc::new(ConnectRequest {
			credentials,
			user_id: user_id.into(),
			descriptors,
		});
		self.inner.clone().connect(req).await
	}

	pub fn is_connected(&self) -> bool {
		self.inner.state.lock().is_alive(Instant::now())
	}

	/// Current session id, only while the socket is open.
	pub fn session_id(&self) -> Option<String> {
		let st = self.inner.state.lock();
		if st.socket_open { st.session_id.clone() } else { None }
	}

	/// Ask the receive loop to close the socket. `Disconnected` follows asynchronously.
	///
	/// A deliberate close never reconnects, even with a reconnect URL pending.
	pub fn close(&self) -> bool {
		let mut st = self.inner.state.lock();
		if !st.is_alive(Instant::now()) {
			return false;
		}

		st.local_close = true;
		st.pending_reconnect_url = None;
		match st.close_tx.take() {
			Some(tx) => tx.send(()).is_ok(),
			None => false,
		}
	}

	#[cfg(test)]
	pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
		f(&mut self.inner.state.lock())
	}
}

impl Inner {
	async fn connect_eventsub_ws(url: Url) -> anyhow::Result<EventSubWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to eventsub ws")?;
		Ok(ws)
	}

	async fn connect_ws(&self, url: Url) -> anyhow::Result<EventSubWs> {
		match &self.cfg.ws_connector {
			Some(c) => c(url).await,
			None => Self::connect_eventsub_ws(url).await,
		}
	}

	fn subscription_api(&self, credentials: &Credentials) -> anyhow::Result<Arc<dyn SubscriptionApi>> {
		if let Some(factory) = &self.cfg.api_factory {
			return factory(credentials);
		}

		let base = Url::parse(&self.cfg.helix_base_url).context("parse helix base url")?;
		let client = HelixClient::new(base, credentials.clone(), self.cfg.request_timeout)?;
		Ok(Arc::new(client))
	}

	fn emit(&self, ev: ConnectorEvent) {
		let _ = self.events_tx.send(ev);
	}

	async fn connect(self: Arc<Self>, req: Arc<ConnectRequest>) -> bool {
		let (target, generation, stale_close) = {
			let mut st = self.state.lock();
			if st.dialing || st.is_alive(Instant::now()) {
				debug!("eventsub connect rejected: already connected");
				return false;
			}

			// Consumed here so a failed dial never reuses it.
			let target = st
				.pending_reconnect_url
				.take()
				.unwrap_or_else(|| self.cfg.eventsub_ws_url.clone());

			st.generation = st.generation.wrapping_add(1);
			st.dialing = true;
			st.local_close = false;
			st.session_id = None;
			st.socket_open = false;
			(target, st.generation, st.close_tx.take())
		};

		if let Some(tx) = stale_close {
			debug!("shutting down stale eventsub socket before redial");
			let _ = tx.send(());
		}

		let cycle_id = new_cycle_id();
		info!(%cycle_id, url = %target, "eventsub connecting");
		self.emit(ConnectorEvent::Connecting(ConnectionStep::Initiated));

		let dialed = match Url::parse(&target).context("parse eventsub ws url") {
			Ok(url) => self.connect_ws(url).await,
			Err(e) => Err(e),
		};

		let ws = match dialed {
			Ok(ws) => ws,
			Err(e) => {
				self.state.lock().dialing = false;
				warn!(%cycle_id, error = %e, "failed to connect eventsub ws");
				self.emit(error_event("failed to connect eventsub ws", format!("{e:#}")));
				return false;
			}
		};

		let (close_tx, close_rx) = oneshot::channel();
		{
			let mut st = self.state.lock();
			st.dialing = false;
			st.socket_open = true;
			st.keepalive_interval = DEFAULT_KEEPALIVE;
			st.last_message_at = Some(Instant::now());
			st.close_tx = Some(close_tx);
		}

		info!(%cycle_id, "eventsub websocket open; waiting for session_welcome");
		self.emit(ConnectorEvent::Connecting(ConnectionStep::WebSocketConnected));

		tokio::spawn(self.clone().receive_loop(ws, close_rx, generation, req, cycle_id));
		true
	}

	async fn receive_loop(
		self: Arc<Self>,
		mut ws: EventSubWs,
		mut close_rx: oneshot::Receiver<()>,
		generation: u64,
		req: Arc<ConnectRequest>,
		cycle_id: String,
	) {
		loop {
			tokio::select! {
				_ = &mut close_rx => {
					debug!(%cycle_id, "closing eventsub socket on request");
					let _ = ws.close(None).await;
					break;
				}
				msg = ws.next() => {
					let Some(msg) = msg else {
						debug!(%cycle_id, "eventsub stream ended");
						break;
					};

					let msg = match msg {
						Ok(m) => m,
						Err(e) => {
							warn!(%cycle_id, error = %e, "eventsub ws read error");
							continue;
						}
					};

					match msg {
						Message::Text(t) => {
							if let Flow::CloseForReconnect = self.on_text(&t, generation, &req) {
								let _ = ws.close(None).await;
								break;
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(c) => {
							debug!(%cycle_id, close = ?c, "eventsub ws closed by peer");
							break;
						}
						_ => {}
					}
				}
			}
		}

		self.on_closed(generation, req, &cycle_id);
	}

	fn on_text(self: &Arc<Self>, raw: &str, generation: u64, req: &Arc<ConnectRequest>) -> Flow {
		let message_type = match eventsub::peek_message_type(raw) {
			Ok(t) => t,
			Err(e) => {
				debug!(error = %e, "dropping non-envelope eventsub frame");
				return Flow::Continue;
			}
		};

		{
			let mut st = self.state.lock();
			if st.generation != generation {
				return Flow::Continue;
			}
			st.last_message_at = Some(Instant::now());
		}

		metrics::counter!("eventhub_eventsub_messages_total", "message_type" => message_type.clone()).increment(1);

		match message_type.as_str() {
			MESSAGE_TYPE_WELCOME => {
				let session = match eventsub::parse_welcome(raw) {
					Ok(w) => w.payload.session,
					Err(e) => {
						debug!(error = %e, "dropping malformed session_welcome");
						return Flow::Continue;
					}
				};

				let keepalive = session.keepalive_interval().unwrap_or(DEFAULT_KEEPALIVE);
				{
					let mut st = self.state.lock();
					st.session_id = Some(session.id.clone());
					st.keepalive_interval = keepalive;
				}
				info!(session_id = %session.id, keepalive_ms = keepalive.as_millis() as u64, "eventsub session welcome");

				self.spawn_subscriptions(session.id, req.clone());
			}
			MESSAGE_TYPE_KEEPALIVE | MESSAGE_TYPE_NOTIFICATION => {
				if let Some(sub_type) = eventsub::peek_subscription_type(raw) {
					debug!(subscription_type = %sub_type, "eventsub notification");
				}
				self.emit(ConnectorEvent::Message(raw.to_string()));
			}
			MESSAGE_TYPE_RECONNECT => {
				let url = match eventsub::parse_reconnect(raw) {
					Ok(m) => m.payload.session.reconnect_url,
					Err(e) => {
						debug!(error = %e, "dropping malformed session_reconnect");
						return Flow::Continue;
					}
				};

				let mut st = self.state.lock();
				if st.local_close {
					return Flow::Continue;
				}
				info!(reconnect_url = %url, "eventsub session_reconnect; migrating");
				st.pending_reconnect_url = Some(url);
				return Flow::CloseForReconnect;
			}
			other => {
				debug!(message_type = %other, "ignoring eventsub message");
			}
		}

		Flow::Continue
	}

	fn spawn_subscriptions(self: &Arc<Self>, session_id: String, req: Arc<ConnectRequest>) {
		let inner = self.clone();
		tokio::spawn(async move {
			let api = match inner.subscription_api(&req.credentials) {
				Ok(api) => api,
				Err(e) => {
					warn!(error = %e, "failed to build subscription api");
					inner.emit(error_event("failed to build subscription api", format!("{e:#}")));
					return;
				}
			};

			let (subs, res) = subscribe_all(api.as_ref(), &session_id, &req.user_id, &req.descriptors, &inner.events_tx).await;
			if res.is_ok() {
				info!(%session_id, count = subs.len(), "eventsub subscriptions enabled");
			}
		});
	}

	fn on_closed(self: Arc<Self>, generation: u64, req: Arc<ConnectRequest>, cycle_id: &str) {
		let reconnect = {
			let mut st = self.state.lock();
			if st.generation != generation {
				debug!(%cycle_id, "superseded eventsub socket closed");
				return;
			}

			st.socket_open = false;
			st.session_id = None;
			st.close_tx = None;
			if st.local_close {
				st.pending_reconnect_url = None;
			}
			st.pending_reconnect_url.is_some()
		};

		if reconnect {
			metrics::counter!("eventhub_eventsub_reconnects_total").increment(1);
			info!(%cycle_id, "eventsub socket closed; reconnecting to pending url");
			tokio::spawn(async move {
				if !self.clone().connect(req).await {
					let st = self.state.lock();
					let taken_over = st.dialing || st.socket_open;
					drop(st);
					// A failed hand-off is a lost connection.
					if !taken_over {
						self.emit(ConnectorEvent::Disconnected);
					}
				}
			});
			return;
		}

		info!(%cycle_id, "eventsub disconnected");
		self.emit(ConnectorEvent::Disconnected);
	}
}
