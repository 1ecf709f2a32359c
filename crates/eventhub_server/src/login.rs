#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::{Context as _, anyhow};
use eventhub_dispatch::ClientMetadata;
use eventhub_platform::oauth::{OAuthCaptureServer, OAuthEvent, OAuthEventRx, OAuthServerConfig, authorize_url, oauth_channel};
use eventhub_platform::twitch::HelixClient;
use eventhub_platform::{Credentials, SecretString};
use tracing::{info, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::settings::{LoggedInUser, Settings, SettingsStore};

/// A running capture server and the channel its token arrives on.
pub struct TokenCapture {
	server: OAuthCaptureServer,
	rx: OAuthEventRx,
	addr: SocketAddr,
}

impl TokenCapture {
	pub async fn start(cfg: OAuthServerConfig) -> anyhow::Result<Self> {
		let (tx, rx) = oauth_channel();
		let server = OAuthCaptureServer::new(cfg, tx);
		let addr = server.start().await.context("start oauth capture server")?;
		Ok(Self { server, rx, addr })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	/// Wait for the first captured token. The server is stopped on every exit path.
	pub async fn wait_for_token(mut self) -> anyhow::Result<SecretString> {
		let res = tokio::select! {
			ev = self.rx.recv() => match ev {
				Some(OAuthEvent::TokenCaptured(token)) => Ok(token),
				None => Err(anyhow!("oauth capture server went away")),
			},
			_ = tokio::signal::ctrl_c() => Err(anyhow!("login cancelled")),
		};

		self.server.stop().await;
		res
	}
}

/// Run the implicit-grant login and persist the resulting token and user.
pub async fn login(cfg: &ServerConfig, store: &mut SettingsStore) -> anyhow::Result<()> {
	let application_id = store
		.current()
		.application_id
		.clone()
		.filter(|v| !v.trim().is_empty())
		.ok_or_else(|| anyhow!("login requires application_id (settings or EVENTHUB_APPLICATION_ID)"))?;

	let capture = TokenCapture::start(cfg.oauth_server_config()).await?;
	let url = authorize_url(&application_id, &store.current().scopes, &cfg.oauth.redirect_uri);

	info!(addr = %capture.local_addr(), %url, "waiting for login; open the URL if no browser appears");
	if let Err(e) = open::that(&url) {
		warn!(error = %e, "failed to open browser");
	}

	let token = capture.wait_for_token().await?;
	info!("access token captured");

	let credentials = Credentials::new(application_id, token.clone());
	let user = resolve_user(cfg, credentials).await?;
	info!(user_id = %user.id, login = %user.login, "logged in");

	store.update(|s| {
		s.access_token = Some(token.expose().to_string());
		s.logged_in_user = Some(user.clone());
	})
}

/// Helix whoami for the token owner.
pub async fn resolve_user(cfg: &ServerConfig, credentials: Credentials) -> anyhow::Result<LoggedInUser> {
	let connector = cfg.connector_config();
	let base = Url::parse(&connector.helix_base_url)
		.with_context(|| format!("parse helix base url {}", connector.helix_base_url))?;
	let helix = HelixClient::new(base, credentials, connector.request_timeout)?;
	let user = helix.get_token_user().await.context("resolve token user")?;

	Ok(LoggedInUser {
		id: user.id,
		login: user.login,
		display_name: user.display_name,
	})
}

/// What every new WebSocket client is told first.
pub fn client_metadata(settings: &Settings) -> ClientMetadata {
	ClientMetadata {
		application_id: settings.application_id.clone(),
		access_token: settings.access_token.clone(),
		user_id: settings.logged_in_user.as_ref().map(|u| u.id.clone()),
	}
}
