#![forbid(unsafe_code)]

mod config;
mod login;
mod relay;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use eventhub_dispatch::{Fanout, MetadataHandle, UdpFanoutSender, WsBroadcastServer, dispatch_channel};
use eventhub_platform::twitch::EventSubConnector;
use eventhub_platform::{Credentials, SecretString, connector_channel};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::settings::{LoggedInUser, SettingsStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: eventhub_server [--config path] [--settings path] [--login]\n\
\n\
Options:\n\
\t--config     Config file (default: <config_dir>/eventhub/config.toml)\n\
\t--settings   Settings file (default: <config_dir>/eventhub/settings.toml)\n\
\t--login      Run the browser login even if an access token is stored\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: PathBuf,
	settings_path: PathBuf,
	force_login: bool,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: config::default_config_path(),
		settings_path: settings::default_settings_path(),
		force_login: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = PathBuf::from(v);
			}
			"--settings" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--settings must be non-empty");
					usage_and_exit();
				}
				args.settings_path = PathBuf::from(v);
			}
			"--login" => args.force_login = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,eventhub_server=debug,eventhub_platform=debug,eventhub_dispatch=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("eventhub_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let server_cfg = config::load_server_config_from_path(&args.config_path)?;
	info!(path = %args.config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let mut store = SettingsStore::load(&args.settings_path);
	info!(path = %store.path().display(), settings = ?store.current(), "loaded settings");

	// Sinks first so local consumers can attach while login runs.
	let (dispatch_tx, dispatch_rx) = dispatch_channel();
	let metadata = MetadataHandle::new(login::client_metadata(store.current()));
	let ws = Arc::new(WsBroadcastServer::new(metadata.clone(), dispatch_tx.clone()));
	let udp = UdpFanoutSender::new(dispatch_tx);
	let fanout = Fanout::new(ws.clone(), udp.clone());

	// A sink that fails to start stays stopped; the other one is unaffected.
	if let Some(port) = store.current().ws_port {
		if let Err(e) = ws.start(server_cfg.ws_bind(port)).await {
			warn!(error = %format!("{e:#}"), "continuing without the websocket sink");
		}
	} else {
		info!("no ws_port configured; websocket sink disabled");
	}

	if !store.current().udp_ports.is_empty() {
		udp.start(store.current().udp_ports.clone());
	} else {
		info!("no udp_ports configured; udp sink disabled");
	}

	if args.force_login || !store.current().has_access_token() {
		login::login(&server_cfg, &mut store).await?;
		metadata.replace(login::client_metadata(store.current()));
	}

	let current = store.current().clone();
	let application_id = current
		.application_id
		.clone()
		.ok_or_else(|| anyhow!("no application_id (settings or EVENTHUB_APPLICATION_ID)"))?;
	let access_token = current
		.access_token
		.clone()
		.map(SecretString::new)
		.context("no access token after login")?;
	let credentials = Credentials::new(application_id, access_token);

	let user_id = match current.logged_in_user {
		Some(LoggedInUser { id, .. }) if !id.trim().is_empty() => id,
		_ => {
			let user = login::resolve_user(&server_cfg, credentials.clone()).await?;
			let id = user.id.clone();
			store.update(|s| s.logged_in_user = Some(user.clone()))?;
			metadata.replace(login::client_metadata(store.current()));
			id
		}
	};

	if current.events.is_empty() {
		warn!("no events configured; the session will carry keepalives only");
	}

	let (connector_tx, connector_rx) = connector_channel();
	let connector = EventSubConnector::new(server_cfg.connector_config(), connector_tx);
	if !connector.connect(credentials, user_id, current.events.clone()).await {
		ws.stop().await;
		udp.stop().await;
		return Err(anyhow!("could not open the eventsub connection"));
	}

	let shutdown = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	relay::run(&connector, connector_rx, dispatch_rx, &fanout, shutdown).await
}
