#![forbid(unsafe_code)]

use std::future::Future;

use anyhow::anyhow;
use eventhub_dispatch::{DispatchEvent, DispatchEventRx, Fanout};
use eventhub_platform::twitch::EventSubConnector;
use eventhub_platform::{ConnectionStep, ConnectorEvent, ConnectorEventRx};
use tracing::{debug, info, warn};

/// Route connector messages to the sinks until shutdown or upstream loss.
///
/// `Disconnected` ends the run with an error; `shutdown` resolving ends it cleanly.
pub async fn run(
	connector: &EventSubConnector,
	mut connector_rx: ConnectorEventRx,
	mut dispatch_rx: DispatchEventRx,
	fanout: &Fanout,
	shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
	tokio::pin!(shutdown);

	let res = loop {
		tokio::select! {
			ev = connector_rx.recv() => {
				let Some(ev) = ev else {
					break Err(anyhow!("connector event channel closed"));
				};
				if let Some(res) = on_connector_event(ev, fanout) {
					break res;
				}
			}
			Some(ev) = dispatch_rx.recv() => on_dispatch_event(ev),
			_ = &mut shutdown => {
				info!("shutdown requested");
				connector.close();
				break Ok(());
			}
		}
	};

	fanout.ws().stop().await;
	fanout.udp().stop().await;
	res
}

/// `Some` ends the loop.
fn on_connector_event(ev: ConnectorEvent, fanout: &Fanout) -> Option<anyhow::Result<()>> {
	match ev {
		ConnectorEvent::Message(raw) => {
			let outcome = fanout.dispatch(&raw);
			debug!(ws_clients = outcome.ws_clients, udp_queued = outcome.udp_queued, "dispatched");
		}
		ConnectorEvent::Connecting(ConnectionStep::Initiated) => info!("eventsub: connecting"),
		ConnectorEvent::Connecting(ConnectionStep::WebSocketConnected) => info!("eventsub: socket open, waiting for welcome"),
		ConnectorEvent::Connecting(ConnectionStep::Subscribing { event, subscription_id }) => {
			info!(%event, %subscription_id, "eventsub: subscribed");
		}
		ConnectorEvent::Connected => info!("eventsub: all subscriptions enabled"),
		ConnectorEvent::Error(msg) => warn!(error = %msg, "eventsub error"),
		ConnectorEvent::Disconnected => {
			warn!("eventsub: disconnected");
			return Some(Err(anyhow!("eventsub connection lost")));
		}
	}
	None
}

fn on_dispatch_event(ev: DispatchEvent) {
	match ev {
		DispatchEvent::ClientConnected { client_id, peer } => debug!(client_id, %peer, "ws client joined"),
		DispatchEvent::ClientDisconnected { client_id, peer } => debug!(client_id, %peer, "ws client left"),
		other => debug!(event = ?other, "dispatch event"),
	}
}
