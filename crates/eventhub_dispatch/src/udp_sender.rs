#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{DispatchEvent, DispatchEventTx};

/// A warning is logged each time the backlog crosses a multiple of this.
const QUEUE_DEPTH_WARN_STEP: usize = 1024;

enum SenderState {
	Stopped,
	/// `cancel` and `consumer` are taken by `stop`; the state stays `Running` until the consumer exits.
	Running {
		generation: u64,
		tx: mpsc::UnboundedSender<String>,
		depth: Arc<AtomicUsize>,
		cancel: Option<oneshot::Sender<()>>,
		consumer: Option<JoinHandle<()>>,
	},
}

struct Inner {
	state: Mutex<SenderState>,
	generation: AtomicU64,
	events_tx: DispatchEventTx,
}

/// Sends every queued message as one datagram to `127.0.0.1:<port>` for each configured port.
///
/// Cheap to clone; clones share the same queue and consumer.
#[derive(Clone)]
pub struct UdpFanoutSender {
	inner: Arc<Inner>,
}

impl UdpFanoutSender {
	pub fn new(events_tx: DispatchEventTx) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(SenderState::Stopped),
				generation: AtomicU64::new(0),
				events_tx,
			}),
		}
	}

	/// Spawn the consumer with a fresh, empty queue. Returns `false` if one is already running.
	pub fn start(&self, ports: Vec<u16>) -> bool {
		let mut st = self.inner.state.lock();
		if matches!(&*st, SenderState::Running { .. }) {
			return false;
		}

		let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, rx) = mpsc::unbounded_channel();
		let (cancel, cancel_rx) = oneshot::channel();
		let depth = Arc::new(AtomicUsize::new(0));
		metrics::gauge!("eventhub_udp_queue_depth").set(0.0);

		let consumer = tokio::spawn(consume(self.inner.clone(), generation, ports, rx, cancel_rx, depth.clone()));
		*st = SenderState::Running {
			generation,
			tx,
			depth,
			cancel: Some(cancel),
			consumer: Some(consumer),
		};
		true
	}

	/// Wake the consumer out of its wait and return once it has exited.
	///
	/// `UdpSenderStopped` is emitted before this returns, so it always precedes the next start.
	pub async fn stop(&self) -> bool {
		let (cancel, consumer) = {
			let mut st = self.inner.state.lock();
			match &mut *st {
				SenderState::Running { cancel, consumer, .. } => match (cancel.take(), consumer.take()) {
					(Some(cancel), Some(consumer)) => (cancel, consumer),
					_ => return false,
				},
				SenderState::Stopped => return false,
			}
		};

		let _ = cancel.send(());
		if let Err(e) = consumer.await {
			warn!(error = %e, "udp consumer ended abnormally");
			let mut st = self.inner.state.lock();
			if matches!(&*st, SenderState::Running { consumer: None, .. }) {
				*st = SenderState::Stopped;
			}
		}
		true
	}

	pub fn is_running(&self) -> bool {
		matches!(&*self.inner.state.lock(), SenderState::Running { .. })
	}

	/// Queue a message. `false` when no consumer is running.
	pub fn enqueue(&self, message: &str) -> bool {
		let st = self.inner.state.lock();
		let SenderState::Running {
			tx,
			depth,
			cancel: Some(_),
			..
		} = &*st
		else {
			return false;
		};

		let queued = depth.fetch_add(1, Ordering::Relaxed) + 1;
		if tx.send(message.to_owned()).is_err() {
			depth.fetch_sub(1, Ordering::Relaxed);
			return false;
		}

		metrics::gauge!("eventhub_udp_queue_depth").set(queued as f64);
		if queued % QUEUE_DEPTH_WARN_STEP == 0 {
			warn!(depth = queued, "udp send queue is growing");
		}
		true
	}
}

async fn consume(
	inner: Arc<Inner>,
	generation: u64,
	ports: Vec<u16>,
	mut rx: mpsc::UnboundedReceiver<String>,
	mut cancel_rx: oneshot::Receiver<()>,
	depth: Arc<AtomicUsize>,
) {
	match UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await {
		Ok(socket) => {
			info!(?ports, "udp sender started");
			let _ = inner.events_tx.send(DispatchEvent::UdpSenderStarted);

			let targets: Vec<SocketAddr> = ports
				.iter()
				.map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, *port)))
				.collect();

			loop {
				tokio::select! {
					_ = &mut cancel_rx => break,
					msg = rx.recv() => {
						let Some(msg) = msg else { break };
						let left = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
						metrics::gauge!("eventhub_udp_queue_depth").set(left as f64);
						send_to_all(&socket, &targets, msg.as_bytes()).await;
					}
				}
			}
		}
		Err(e) => warn!(error = %e, "udp sender could not bind a socket"),
	}

	{
		let mut st = inner.state.lock();
		if matches!(&*st, SenderState::Running { generation: g, .. } if *g == generation) {
			*st = SenderState::Stopped;
		}
	}

	info!("udp sender stopped");
	let _ = inner.events_tx.send(DispatchEvent::UdpSenderStopped);
}

/// One datagram per target. Failures are logged and the message is not retried.
async fn send_to_all(socket: &UdpSocket, targets: &[SocketAddr], payload: &[u8]) {
	for target in targets {
		match socket.send_to(payload, *target).await {
			Ok(_) => metrics::counter!("eventhub_udp_datagrams_total").increment(1),
			Err(e) => {
				metrics::counter!("eventhub_udp_send_errors_total").increment(1);
				warn!(%target, error = %e, "udp datagram send failed");
			}
		}
	}
}
