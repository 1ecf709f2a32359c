#![forbid(unsafe_code)]

//! Local HTTP endpoint that finishes an implicit-grant browser login.

mod authorize;


use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rust_embed::RustEmbed;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::SecretString;

pub use authorize::{DEFAULT_REDIRECT_URI, TWITCH_AUTHORIZE_URL, authorize_url};

pub const DEFAULT_OAUTH_PORT: u16 = 8082;

const MISSING_TOKEN: &str = "Missing token!";

#[derive(RustEmbed)]
#[folder = "assets/oauth"]
#[include = "*.html"]
struct Pages;

#[derive(Debug, Clone)]
pub enum OAuthEvent {
	TokenCaptured(SecretString),
}

pub type OAuthEventTx = mpsc::UnboundedSender<OAuthEvent>;
pub type OAuthEventRx = mpsc::UnboundedReceiver<OAuthEvent>;

pub fn oauth_channel() -> (OAuthEventTx, OAuthEventRx) {
	mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub struct OAuthServerConfig {
	pub bind: SocketAddr,

	/// Served under `/html/`. Nothing is served there when unset.
	pub html_dir: Option<PathBuf>,
}

impl Default for OAuthServerConfig {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_OAUTH_PORT)),
			html_dir: None,
		}
	}
}

enum ServerState {
	Stopped,
	/// Stays `Running` until the accept task taken by `stop` has finished.
	Running {
		addr: SocketAddr,
		accept_task: Option<JoinHandle<()>>,
	},
}

struct Shared {
	events_tx: OAuthEventTx,
	html_dir: Option<PathBuf>,
}

pub struct OAuthCaptureServer {
	bind: SocketAddr,
	shared: Arc<Shared>,
	state: Mutex<ServerState>,
}

impl OAuthCaptureServer {
	pub fn new(cfg: OAuthServerConfig, events_tx: OAuthEventTx) -> Self {
		Self {
			bind: cfg.bind,
			shared: Arc::new(Shared {
				events_tx,
				html_dir: cfg.html_dir,
			}),
			state: Mutex::new(ServerState::Stopped),
		}
	}

	/// Bind and serve. A second call while running returns the bound address unchanged.
	pub async fn start(&self) -> anyhow::Result<SocketAddr> {
		if let Some(addr) = self.local_addr() {
			return Ok(addr);
		}

		let listener = TcpListener::bind(self.bind)
			.await
			.with_context(|| format!("bind oauth server on {}", self.bind))?;
		let addr = listener.local_addr().context("oauth server local addr")?;

		let mut st = self.state.lock();
		if let ServerState::Running { addr, .. } = &*st {
			return Ok(*addr);
		}

		let accept_task = tokio::spawn(accept_loop(listener, self.shared.clone()));
		*st = ServerState::Running {
			addr,
			accept_task: Some(accept_task),
		};
		info!(%addr, "oauth capture server listening");
		Ok(addr)
	}

	/// Abort the accept loop and every in-flight connection, returning once the port is free.
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

		accept_task.abort();
		let _ = accept_task.await;
		*self.state.lock() = ServerState::Stopped;
		info!(%addr, "oauth capture server stopped");
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
}

impl Drop for OAuthCaptureServer {
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
	// Dropped with the accept task, which aborts every connection still running.
	let mut connections = JoinSet::new();

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(e) => {
						warn!(error = %e, "oauth server accept failed");
						continue;
					}
				};

				let shared = shared.clone();
				connections.spawn(async move {
					let io = TokioIo::new(stream);
					let service = service_fn(move |req| handle(req, shared.clone()));
					if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
						debug!(%peer, error = %err, "oauth connection error");
					}
				});
			}
			Some(_) = connections.join_next(), if !connections.is_empty() => {}
		}
	}
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

fn not_found() -> Response<Full<Bytes>> {
	respond(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", Bytes::from_static(b"Not found"))
}

fn page(name: &str) -> Response<Full<Bytes>> {
	match Pages::get(name) {
		Some(f) => respond(StatusCode::OK, "text/html; charset=utf-8", f.data.into_owned()),
		None => not_found(),
	}
}

fn route_matches(path: &str, prefix: &str) -> bool {
	path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

async fn handle(req: Request<Incoming>, shared: Arc<Shared>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();
	debug!(method = %req.method(), %path, "oauth request");

	if route_matches(&path, "/oauth_token") {
		let body = req.into_body().collect().await?.to_bytes();
		return Ok(capture_token(&body, &shared));
	}

	if route_matches(&path, "/oauth") {
		return Ok(page("oauth.html"));
	}

	if route_matches(&path, "/html") {
		let rel = path.strip_prefix("/html").unwrap_or_default();
		return Ok(serve_html_dir(shared.html_dir.as_deref(), rel).await);
	}

	Ok(page("index.html"))
}

fn capture_token(body: &[u8], shared: &Shared) -> Response<Full<Bytes>> {
	let token = form_urlencoded::parse(body)
		.find(|(k, _)| k == "access_token")
		.map(|(_, v)| v.into_owned())
		.filter(|t| !t.trim().is_empty());

	let Some(token) = token else {
		return respond(
			StatusCode::BAD_REQUEST,
			"text/plain; charset=utf-8",
			Bytes::from_static(MISSING_TOKEN.as_bytes()),
		);
	};

	metrics::counter!("eventhub_oauth_tokens_captured_total").increment(1);
	info!("oauth access token captured");
	let _ = shared.events_tx.send(OAuthEvent::TokenCaptured(SecretString::new(token)));

	page("oauth_token.html")
}

/// Map `/html/<rel>` onto the html directory. `..` and absolute components are refused.
fn resolve_in_dir(root: &Path, rel: &str) -> Option<PathBuf> {
	let mut out = root.to_path_buf();
	for component in Path::new(rel.trim_start_matches('/')).components() {
		match component {
			Component::Normal(part) => out.push(part),
			Component::CurDir => {}
			Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
		}
	}
	Some(out)
}

fn content_type_for(path: &Path) -> &'static str {
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.map(str::to_ascii_lowercase)
		.unwrap_or_default();

	match ext.as_str() {
		"html" | "htm" => "text/html; charset=utf-8",
		"css" => "text/css; charset=utf-8",
		"js" | "mjs" => "text/javascript; charset=utf-8",
		"json" => "application/json",
		"txt" => "text/plain; charset=utf-8",
		"svg" => "image/svg+xml",
		"png" => "image/png",
		"jpg" | "jpeg" => "image/jpeg",
		"gif" => "image/gif",
		"webp" => "image/webp",
		"ico" => "image/x-icon",
		"woff" => "font/woff",
		"woff2" => "font/woff2",
		"mp3" => "audio/mpeg",
		"wav" => "audio/wav",
		"mp4" => "video/mp4",
		_ => "application/octet-stream",
	}
}

async fn serve_html_dir(root: Option<&Path>, rel: &str) -> Response<Full<Bytes>> {
	let Some(root) = root else {
		return not_found();
	};
	let Some(mut target) = resolve_in_dir(root, rel) else {
		debug!(%rel, "rejected html path");
		return not_found();
	};

	if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
		target.push("index.html");
	}

	match tokio::fs::read(&target).await {
		Ok(bytes) => respond(StatusCode::OK, content_type_for(&target), bytes),
		Err(e) => {
			debug!(path = %target.display(), error = %e, "html file not served");
			not_found()
		}
	}
}
