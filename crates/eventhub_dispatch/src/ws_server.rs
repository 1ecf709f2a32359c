#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::{DispatchEvent, DispatchEventTx, MetadataHandle};

enum ServerState {
	Stopped,
	/// `accept_task` is taken by the first `stop`; the state stays `Running` until it has finished.
	Running {
		addr: SocketAddr,
		accept_task: Option<JoinHandle<()>>,
	},
}

struct Client {
	peer: SocketAddr,
	tx: mpsc::UnboundedSender<Message>,
}

struct Shared {
	clients: Mutex<HashMap<u64, Client>>,
	next_client_id: AtomicU64,
	metadata: MetadataHandle,
	events_tx: DispatchEventTx,
}

impl Shared {
	fn emit(&self, ev: DispatchEvent) {
		let _ = self.events_tx.send(ev);
	}

	fn client_gone(&self, client_id: u64) {
		let removed = self.clients.lock().remove(&client_id);
		if let Some(client) = removed {
			self.record_client_count();
			debug!(client_id, peer = %client.peer, "ws client disconnected");
			self.emit(DispatchEvent::ClientDisconnected {
				client_id,
				peer: client.peer,
			});
		}
	}

	fn record_client_count(&self) {
		let n = self.clients.lock().len();
		metrics::gauge!("eventhub_ws_clients").set(n as f64);
	}
}

/// Local WebSocket server that pushes every notification to all connected clients.
pub struct WsBroadcastServer {
	shared: Arc<Shared>,
	state: Mutex<ServerState>,
}

impl WsBroadcastServer {
	pub fn new(metadata: MetadataHandle, events_tx: DispatchEventTx) -> Self {
		Self {
			shared: Arc::new(Shared {
				clients: Mutex::new(HashMap::new()),
				next_client_id: AtomicU64::new(1),
				metadata,
				events_tx,
			}),
			state: Mutex::new(ServerState::Stopped),
		}
	}

	/// Bind and accept clients. No-op returning the bound address when already running.
	pub async fn start(&self, bind: SocketAddr) -> anyhow::Result<SocketAddr> {
		if let Some(addr) = self.local_addr() {
			return Ok(addr);
		}

		let bound = TcpListener::bind(bind)
			.await
			.with_context(|| format!("bind ws broadcast server on {bind}"))
			.and_then(|listener| {
				let addr = listener.local_addr().context("ws broadcast server local addr")?;
				Ok((listener, addr))
			});
		let (listener, addr) = match bound {
			Ok(v) => v,
			Err(e) => {
				let error = format!("{e:#}");
				warn!(%bind, %error, "ws broadcast server failed to start");
				self.shared.emit(DispatchEvent::WsServerFailed { error });
				return Err(e);
			}
		};

		{
			let mut st = self.state.lock();
			if let ServerState::Running { addr, .. } = &*st {
				return Ok(*addr);
			}
			let accept_task = tokio::spawn(accept_loop(listener, self.shared.clone()));
			*st = ServerState::Running {
				addr,
				accept_task: Some(accept_task),
			};
		}

		info!(%addr, "ws broadcast server listening");
		self.shared.emit(DispatchEvent::WsServerStarted { addr });
		Ok(addr)
	}

	/// Drop every client socket without a close handshake and stop accepting.
	///
	/// Returns once the listener is released, so the port can be bound again right away.
	pub async fn stop(&self) -> bool {
		let (addr, accept_task) = {
			let mut st = self.state.lock();
			match &mut *st {
				ServerState::Running { addr, accept_task } => match accept_task.take() {
					Some(task) => (*addr, task),
					None => return false,
				},
				ServerState::Stopped => return false,
			}
		};

		// Client tasks live in the accept task's JoinSet and are aborted with it.
		accept_task.abort();
		let _ = accept_task.await;
		*self.state.lock() = ServerState::Stopped;

		let dropped: Vec<(u64, Client)> = self.shared.clients.lock().drain().collect();
		self.shared.record_client_count();
		for (client_id, client) in dropped {
			self.shared.emit(DispatchEvent::ClientDisconnected {
				client_id,
				peer: client.peer,
			});
		}

		info!(%addr, "ws broadcast server stopped");
		self.shared.emit(DispatchEvent::WsServerStopped);
		true
	}

	pub fn is_running(&self) -> bool {
		matches!(&*self.state.lock(), ServerState::Running { .. })
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		match &*self.state.lock() {
			ServerState::Running { addr, .. } => Some(*addr),
			ServerState::Stopped => None,
		}
	}

	pub fn client_count(&self) -> usize {
		self.shared.clients.lock().len()
	}

	/// Queue `message` for every open client. Returns how many clients it was handed to.
	pub fn broadcast(&self, message: &str) -> usize {
		let frame = Message::text(message.to_owned());
		let clients = self.shared.clients.lock();
		if clients.is_empty() {
			return 0;
		}

		// A closed channel means the client task is already on its way out.
		let sent = clients.values().filter(|c| c.tx.send(frame.clone()).is_ok()).count();
		drop(clients);

		metrics::counter!("eventhub_ws_broadcasts_total").increment(1);
		sent
	}
}

impl Drop for WsBroadcastServer {
	fn drop(&mut self) {
		if let ServerState::Running {
			accept_task: Some(task),
			..
		} = &*self.state.lock()
		{
			task.abort();
		}
	}
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
	let mut clients = JoinSet::new();

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						clients.spawn(serve_client(stream, peer, shared.clone()));
					}
					Err(e) => warn!(error = %e, "ws broadcast accept failed"),
				}
			}
			Some(_) = clients.join_next(), if !clients.is_empty() => {}
		}
	}
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
	let mut ws = match tokio_tungstenite::accept_async(stream).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "ws handshake failed");
			return;
		}
	};

	let client_id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
	let (tx, mut rx) = mpsc::unbounded_channel();

	// Queued before registration so it precedes any broadcast.
	match shared.metadata.snapshot().to_frame() {
		Ok(frame) => {
			let _ = tx.send(Message::text(frame));
		}
		Err(e) => warn!(client_id, error = %e, "failed to encode client metadata frame"),
	}

	shared.clients.lock().insert(client_id, Client { peer, tx: tx.clone() });
	shared.record_client_count();
	info!(client_id, %peer, "ws client connected");
	shared.emit(DispatchEvent::ClientConnected { client_id, peer });

	loop {
		tokio::select! {
			outbound = rx.recv() => {
				let Some(msg) = outbound else { break };
				if let Err(e) = ws.send(msg).await {
					debug!(client_id, error = %e, "ws client send failed");
					break;
				}
			}
			inbound = ws.next() => {
				match inbound {
					Some(Ok(Message::Ping(p))) => {
						let _ = tx.send(Message::Pong(p));
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						debug!(client_id, error = %e, "ws client read failed");
						break;
					}
				}
			}
		}
	}

	shared.client_gone(client_id);
}
