#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use eventhub_dispatch::{
	ClientMetadata, DispatchEvent, DispatchEventRx, Fanout, FanoutOutcome, MetadataHandle, UdpFanoutSender,
	WsBroadcastServer, dispatch_channel,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("EVENTHUB_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn any_local_port() -> SocketAddr {
	SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn next_event(rx: &mut DispatchEventRx) -> DispatchEvent {
	timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("dispatch event within timeout")
		.expect("channel open")
}

async fn wait_for(rx: &mut DispatchEventRx, pred: impl Fn(&DispatchEvent) -> bool) -> DispatchEvent {
	loop {
		let ev = next_event(rx).await;
		if pred(&ev) {
			return ev;
		}
	}
}

async fn next_text(client: &mut Client) -> String {
	loop {
		let msg = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("frame");
		if let Message::Text(t) = msg {
			return t.to_string();
		}
	}
}

async fn recv_datagram(socket: &UdpSocket) -> String {
	let mut buf = vec![0u8; 64 * 1024];
	let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
		.await
		.expect("datagram within timeout")
		.expect("recv");
	String::from_utf8(buf[..n].to_vec()).expect("utf-8 datagram")
}

#[tokio::test]
async fn broadcast_without_clients_is_a_no_op() {
	init_test_logging();
	let (tx, _rx) = dispatch_channel();
	let server = WsBroadcastServer::new(MetadataHandle::default(), tx);

	assert_eq!(server.broadcast("{}"), 0, "stopped server");

	server.start(any_local_port()).await.expect("start");
	assert_eq!(server.broadcast("{}"), 0, "running server without clients");
	assert!(server.stop().await);
}

#[tokio::test]
async fn every_client_gets_metadata_first_then_broadcasts() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let metadata = MetadataHandle::new(ClientMetadata {
		application_id: Some("app".to_string()),
		access_token: None,
		user_id: Some("42".to_string()),
	});
	let server = WsBroadcastServer::new(metadata, tx);

	let addr = server.start(any_local_port()).await.expect("start");
	assert!(matches!(next_event(&mut rx).await, DispatchEvent::WsServerStarted { addr: a } if a == addr));
	assert_eq!(server.start(any_local_port()).await.expect("second start"), addr);

	let url = format!("ws://{addr}");
	let mut clients = Vec::new();
	for _ in 0..3 {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");
		clients.push(ws);
		wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientConnected { .. })).await;
	}
	assert_eq!(server.client_count(), 3);

	let notification = r#"{"metadata":{"message_type":"notification"},"payload":{"event":{}}}"#;
	assert_eq!(server.broadcast(notification), 3);

	for client in clients.iter_mut() {
		assert_eq!(
			next_text(client).await,
			r#"{"metadata":{"application_id":"app","access_token":null,"user_id":"42"}}"#
		);
		assert_eq!(next_text(client).await, notification);
	}

	let mut leaving = clients.pop().expect("client");
	leaving.close(None).await.expect("close");
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientDisconnected { .. })).await;
	assert_eq!(server.broadcast(notification), 2);

	assert!(server.stop().await);
	assert!(!server.stop().await);
	assert!(server.broadcast(notification) == 0);
	assert_eq!(server.client_count(), 0);

	// Sockets are dropped without a close handshake.
	for client in clients.iter_mut() {
		let end = timeout(Duration::from_secs(2), async {
			loop {
				match client.next().await {
					None | Some(Err(_)) => return true,
					Some(Ok(Message::Close(_))) => return false,
					Some(Ok(_)) => {}
				}
			}
		})
		.await
		.expect("socket ends after stop");
		assert!(end, "no close frame expected");
	}
}

#[tokio::test]
async fn client_pings_are_answered() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let server = WsBroadcastServer::new(MetadataHandle::default(), tx);
	let addr = server.start(any_local_port()).await.expect("start");

	let (mut ws, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}").as_str())
		.await
		.expect("connect");
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientConnected { .. })).await;

	ws.send(Message::Ping(b"hi".to_vec().into())).await.expect("ping");
	ws.send(Message::text("ignored by the server")).await.expect("text");

	let pong = timeout(Duration::from_secs(2), async {
		loop {
			match ws.next().await {
				Some(Ok(Message::Pong(p))) => return p.to_vec(),
				Some(Ok(_)) => {}
				other => panic!("stream ended before pong: {other:?}"),
			}
		}
	})
	.await
	.expect("pong within timeout");
	assert_eq!(pong, b"hi");
}

#[tokio::test]
async fn udp_sends_one_datagram_per_port_per_message() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let sender = UdpFanoutSender::new(tx);

	assert!(!sender.enqueue("before start"), "no consumer yet");

	let mut receivers = Vec::new();
	for _ in 0..2 {
		receivers.push(UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver"));
	}
	let ports: Vec<u16> = receivers
		.iter()
		.map(|s| s.local_addr().expect("addr").port())
		.collect();

	assert!(sender.start(ports.clone()));
	assert!(!sender.start(ports), "second start is a no-op");
	assert_eq!(next_event(&mut rx).await, DispatchEvent::UdpSenderStarted);

	let messages = ["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"];
	for m in messages {
		assert!(sender.enqueue(m));
	}

	for socket in &receivers {
		let mut got = Vec::new();
		for _ in 0..messages.len() {
			got.push(recv_datagram(socket).await);
		}
		got.sort();
		assert_eq!(got, messages);
	}

	assert!(sender.stop().await);
	assert_eq!(rx.try_recv().ok(), Some(DispatchEvent::UdpSenderStopped), "emitted before stop returns");
	assert!(!sender.is_running());
	assert!(!sender.enqueue("after stop"));
	assert!(!sender.stop().await);
}

#[tokio::test]
async fn fanout_reaches_both_sinks_independently() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let ws = Arc::new(WsBroadcastServer::new(MetadataHandle::default(), tx.clone()));
	let udp = UdpFanoutSender::new(tx);
	let fanout = Fanout::new(ws.clone(), udp.clone());

	let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
	assert!(udp.start(vec![receiver.local_addr().expect("addr").port()]));
	wait_for(&mut rx, |e| *e == DispatchEvent::UdpSenderStarted).await;

	// WebSocket sink stopped: UDP still delivers.
	assert_eq!(
		fanout.dispatch("one"),
		FanoutOutcome {
			ws_clients: 0,
			udp_queued: true,
		}
	);
	assert_eq!(recv_datagram(&receiver).await, "one");

	let addr = ws.start(any_local_port()).await.expect("start");
	let (mut client, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}").as_str())
		.await
		.expect("connect");
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientConnected { .. })).await;

	// UDP sink stopped: WebSocket still delivers.
	assert!(udp.stop().await);
	assert_eq!(
		fanout.dispatch("two"),
		FanoutOutcome {
			ws_clients: 1,
			udp_queued: false,
		}
	);
	let _metadata = next_text(&mut client).await;
	assert_eq!(next_text(&mut client).await, "two");
}

#[tokio::test]
async fn ws_restart_on_the_same_port_right_after_stop() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let server = WsBroadcastServer::new(MetadataHandle::default(), tx);

	let addr = server.start(any_local_port()).await.expect("start");
	let (_client, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}").as_str())
		.await
		.expect("connect");
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientConnected { .. })).await;

	assert!(server.stop().await);
	assert_eq!(server.start(addr).await.expect("restart on the released port"), addr);
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::WsServerStarted { addr: a } if *a == addr)).await;

	let (mut client, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}").as_str())
		.await
		.expect("connect after restart");
	wait_for(&mut rx, |e| matches!(e, DispatchEvent::ClientConnected { .. })).await;
	assert_eq!(server.broadcast("again"), 1);
	let _metadata = next_text(&mut client).await;
	assert_eq!(next_text(&mut client).await, "again");
	assert!(server.stop().await);
}

#[tokio::test]
async fn ws_bind_failure_is_reported_and_udp_keeps_delivering() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let ws = Arc::new(WsBroadcastServer::new(MetadataHandle::default(), tx.clone()));
	let udp = UdpFanoutSender::new(tx);
	let fanout = Fanout::new(ws.clone(), udp.clone());

	let occupied = tokio::net::TcpListener::bind(any_local_port()).await.expect("occupy a port");
	let taken = occupied.local_addr().expect("addr");

	assert!(ws.start(taken).await.is_err());
	assert!(!ws.is_running());
	match next_event(&mut rx).await {
		DispatchEvent::WsServerFailed { error } => assert!(!error.is_empty()),
		other => panic!("expected WsServerFailed, got {other:?}"),
	}

	let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
	assert!(udp.start(vec![receiver.local_addr().expect("addr").port()]));
	assert_eq!(next_event(&mut rx).await, DispatchEvent::UdpSenderStarted);

	assert_eq!(
		fanout.dispatch("still here"),
		FanoutOutcome {
			ws_clients: 0,
			udp_queued: true,
		}
	);
	assert_eq!(recv_datagram(&receiver).await, "still here");
	assert!(udp.stop().await);
}

#[tokio::test]
async fn udp_stop_then_start_reports_events_in_order() {
	init_test_logging();
	let (tx, mut rx) = dispatch_channel();
	let sender = UdpFanoutSender::new(tx);
	let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
	let port = receiver.local_addr().expect("addr").port();

	assert!(sender.start(vec![port]));
	assert!(sender.enqueue("first"));
	assert_eq!(recv_datagram(&receiver).await, "first");

	assert!(sender.stop().await);
	assert!(sender.start(vec![port]));
	assert!(sender.enqueue("second"));
	assert_eq!(recv_datagram(&receiver).await, "second");

	let events = vec![next_event(&mut rx).await, next_event(&mut rx).await, next_event(&mut rx).await];
	assert_eq!(
		events,
		vec![
			DispatchEvent::UdpSenderStarted,
			DispatchEvent::UdpSenderStopped,
			DispatchEvent::UdpSenderStarted,
		]
	);
	assert!(sender.is_running());
	assert!(sender.stop().await);
}
