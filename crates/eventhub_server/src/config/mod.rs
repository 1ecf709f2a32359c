#![forbid(unsafe_code)]

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use eventhub_platform::oauth::{DEFAULT_OAUTH_PORT, DEFAULT_REDIRECT_URI, OAuthServerConfig};
use eventhub_platform::twitch::ConnectorConfig;
use serde::Deserialize;
use tracing::{info, warn};

/// `<config_dir>/eventhub`, falling back to `~/.config/eventhub`.
pub fn default_config_dir() -> PathBuf {
	if let Some(cfg) = dirs::config_dir() {
		return cfg.join("eventhub");
	}

	if let Some(home) = dirs::home_dir() {
		return home.join(".config").join("eventhub");
	}

	PathBuf::from(".").join("eventhub")
}

/// Default config path: `<config_dir>/eventhub/config.toml`.
pub fn default_config_path() -> PathBuf {
	default_config_dir().join("config.toml")
}

/// Load the server config from TOML and `EVENTHUB_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub twitch: TwitchSettings,
	pub oauth: OAuthSettings,
	pub dispatch: DispatchSettings,
	pub server: ServerSettings,
}

/// Upstream endpoints. Unset fields keep the connector defaults.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
	/// Local port of the capture server.
	pub port: u16,
	/// Must match the redirect URI registered for the application.
	pub redirect_uri: String,
	/// Served under `/html/`.
	pub html_dir: Option<PathBuf>,
}

impl Default for OAuthSettings {
	fn default() -> Self {
		Self {
			port: DEFAULT_OAUTH_PORT,
			redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
			html_dir: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
	/// Interface the WebSocket broadcast server binds to.
	pub ws_bind_host: IpAddr,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			ws_bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let oauth = OAuthSettings {
			port: file.oauth.port.unwrap_or(DEFAULT_OAUTH_PORT),
			redirect_uri: file
				.oauth
				.redirect_uri
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
			html_dir: file.oauth.html_dir.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
		};

		let ws_bind_host = match file.dispatch.ws_bind_host.filter(|s| !s.trim().is_empty()) {
			Some(host) => parse_host(&host).unwrap_or_else(|| {
				warn!(%host, "dispatch config: invalid ws_bind_host; using 127.0.0.1");
				IpAddr::V4(Ipv4Addr::LOCALHOST)
			}),
			None => IpAddr::V4(Ipv4Addr::LOCALHOST),
		};

		Self {
			twitch: TwitchSettings {
				eventsub_ws_url: file.twitch.eventsub_ws_url.filter(|s| !s.trim().is_empty()),
				helix_base_url: file.twitch.helix_base_url.filter(|s| !s.trim().is_empty()),
				request_timeout: file
					.twitch
					.request_timeout_ms
					.filter(|ms| *ms > 0)
					.map(Duration::from_millis),
			},
			oauth,
			dispatch: DispatchSettings { ws_bind_host },
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
		}
	}

	pub fn connector_config(&self) -> ConnectorConfig {
		let mut cfg = ConnectorConfig::default();
		if let Some(url) = self.twitch.eventsub_ws_url.clone() {
			cfg.eventsub_ws_url = url;
		}
		if let Some(url) = self.twitch.helix_base_url.clone() {
			cfg.helix_base_url = url;
		}
		if let Some(timeout) = self.twitch.request_timeout {
			cfg.request_timeout = timeout;
		}
		cfg
	}

	/// The capture server listens on loopback only.
	pub fn oauth_server_config(&self) -> OAuthServerConfig {
		OAuthServerConfig {
			bind: SocketAddr::from((Ipv4Addr::LOCALHOST, self.oauth.port)),
			html_dir: Some(
				self.oauth
					.html_dir
					.clone()
					.unwrap_or_else(|| default_config_dir().join("html")),
			),
		}
	}

	pub fn ws_bind(&self, port: u16) -> SocketAddr {
		SocketAddr::new(self.dispatch.ws_bind_host, port)
	}
}

/// Accepts bare addresses and bracketed IPv6 (`[::1]`).
fn parse_host(host: &str) -> Option<IpAddr> {
	let host = host.trim();
	let host = host
		.strip_prefix('[')
		.and_then(|h| h.strip_suffix(']'))
		.unwrap_or(host);
	host.parse().ok()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	oauth: FileOAuthSettings,

	#[serde(default)]
	dispatch: FileDispatchSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOAuthSettings {
	port: Option<u16>,
	redirect_uri: Option<String>,
	html_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDispatchSettings {
	ws_bind_host: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Non-empty, trimmed value of `key`.
fn env_value(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
	lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_value(&lookup, "EVENTHUB_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_TWITCH_REQUEST_TIMEOUT_MS") {
		match v.parse::<u64>() {
			Ok(ms) if ms > 0 => {
				cfg.twitch.request_timeout = Some(Duration::from_millis(ms));
				info!(ms, "twitch config: request_timeout overridden by env");
			}
			_ => warn!(value = %v, "twitch config: ignoring invalid EVENTHUB_TWITCH_REQUEST_TIMEOUT_MS"),
		}
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_OAUTH_PORT") {
		match v.parse::<u16>() {
			Ok(port) => {
				cfg.oauth.port = port;
				info!(port, "oauth config: port overridden by env");
			}
			Err(e) => warn!(value = %v, error = %e, "oauth config: ignoring invalid EVENTHUB_OAUTH_PORT"),
		}
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_OAUTH_REDIRECT_URI") {
		cfg.oauth.redirect_uri = v;
		info!("oauth config: redirect_uri overridden by env");
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_OAUTH_HTML_DIR") {
		cfg.oauth.html_dir = Some(PathBuf::from(v));
		info!("oauth config: html_dir overridden by env");
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_WS_BIND_HOST") {
		match parse_host(&v) {
			Some(host) => {
				cfg.dispatch.ws_bind_host = host;
				info!(%host, "dispatch config: ws_bind_host overridden by env");
			}
			None => warn!(value = %v, "dispatch config: ignoring invalid EVENTHUB_WS_BIND_HOST"),
		}
	}

	if let Some(v) = env_value(&lookup, "EVENTHUB_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if !cfg.oauth.redirect_uri.contains(&format!(":{}/", cfg.oauth.port)) {
		warn!(
			port = cfg.oauth.port,
			redirect_uri = %cfg.oauth.redirect_uri,
			"oauth config: redirect_uri does not point at the capture port"
		);
	}
}
