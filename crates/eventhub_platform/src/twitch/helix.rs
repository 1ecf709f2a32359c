#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Credentials;
use crate::twitch::descriptor::EventDescriptor;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const USERS_PATH: &str = "/helix/users";
const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

/// The user that owns the access token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenUser {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: String,
}

/// `data[0]` of a create-subscription response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedSubscription {
	pub id: String,
	pub status: String,

	#[serde(default, rename = "type")]
	pub kind: String,

	#[serde(default)]
	pub version: String,
}

#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	credentials: Credentials,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'a str,
	condition: BTreeMap<&'static str, String>,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HelixDataResponse<T> {
	data: Vec<T>,
}

/// Helix error object: `{"error": "...", "status": 400, "message": "..."}`.
#[derive(Debug, Deserialize)]
struct HelixErrorResponse {
	#[serde(default)]
	error: String,
	#[serde(default)]
	status: u16,
	#[serde(default)]
	message: String,
}

fn describe_failure(status: StatusCode, body: &str) -> String {
	match serde_json::from_str::<HelixErrorResponse>(body) {
		Ok(err) if !err.message.is_empty() || !err.error.is_empty() => {
			let code = if err.status != 0 { err.status } else { status.as_u16() };
			format!("status={code} error={} message={}", err.error, err.message)
		}
		_ => format!("status={status} body={body}"),
	}
}

impl HelixClient {
	pub fn new(base_url: Url, credentials: Credentials, timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("eventhub/0.x (eventsub-ws)")
			.timeout(timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			credentials,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.credentials.application_id)
			.header("Authorization", format!("Bearer {}", self.credentials.access_token.expose()))
	}

	fn url(&self, path: &str) -> anyhow::Result<Url> {
		self.base_url.join(path).context("join helix url")
	}

	/// `GET /helix/users` without parameters: the user the token belongs to.
	pub async fn get_token_user(&self) -> anyhow::Result<TokenUser> {
		let url = self.url(USERS_PATH)?;

		let resp = self
			.authed(self.http.get(url))
			.send()
			.await
			.context("helix GET /helix/users (whoami) send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users (whoami) read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users (whoami) failed: {}", describe_failure(status, &body));
		}

		let parsed: HelixDataResponse<TokenUser> =
			serde_json::from_str(&body).context("helix users (whoami) parse json")?;

		parsed.data.into_iter().next().context("helix whoami returned empty data")
	}

	/// `POST /helix/eventsub/subscriptions` bound to a websocket session.
	///
	/// Does not retry. A non-2xx response or an error object fails with the provider's message.
	pub async fn create_subscription(
		&self,
		event: &EventDescriptor,
		session_id: &str,
		user_id: &str,
	) -> anyhow::Result<CreatedSubscription> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let kind = event.kind();

		let req = HelixCreateSubscriptionRequest {
			r#type: kind,
			version: event.version(),
			condition: event.condition(user_id),
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = self
			.authed(self.http.post(url))
			.json(&req)
			.send()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if !status.is_success() {
			anyhow::bail!(
				"helix create subscription failed (type={kind}): {}",
				describe_failure(status, &body)
			);
		}

		let parsed: HelixDataResponse<CreatedSubscription> = serde_json::from_str(&body)
			.with_context(|| format!("helix create subscription parse json (type={kind})"))?;

		parsed
			.data
			.into_iter()
			.next()
			.with_context(|| format!("helix create subscription returned empty data (type={kind})"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_object_is_summarised() {
		let body = r#"{"error":"Conflict","status":409,"message":"subscription already exists"}"#;
		let msg = describe_failure(StatusCode::CONFLICT, body);
		assert_eq!(msg, "status=409 error=Conflict message=subscription already exists");
	}

	#[test]
	fn non_json_failure_keeps_raw_body() {
		let msg = describe_failure(StatusCode::BAD_GATEWAY, "upstream down");
		assert_eq!(msg, "status=502 Bad Gateway body=upstream down");
	}

	#[test]
	fn request_body_carries_websocket_transport_and_condition() {
		let event = EventDescriptor::parse("channel.follow/2:bm").unwrap();
		let req = HelixCreateSubscriptionRequest {
			r#type: event.kind(),
			version: event.version(),
			condition: event.condition("42"),
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id: "sess-1",
			},
		};

		let json = serde_json::to_value(&req).unwrap();
		assert_eq!(
			json,
			serde_json::json!({
				"type": "channel.follow",
				"version": "2",
				"condition": {
					"broadcaster_user_id": "42",
					"moderator_user_id": "42"
				},
				"transport": {
					"method": "websocket",
					"session_id": "sess-1"
				}
			})
		);
	}
}
