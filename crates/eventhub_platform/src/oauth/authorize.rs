#![forbid(unsafe_code)]

use url::form_urlencoded;

pub const TWITCH_AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8082/oauth";

/// Implicit-grant authorize URL. Always forces the provider to ask for the login again.
pub fn authorize_url(application_id: &str, scopes: &[String], redirect_uri: &str) -> String {
	let query = form_urlencoded::Serializer::new(String::new())
		.append_pair("response_type", "token")
		.append_pair("force_verify", "true")
		.append_pair("client_id", application_id)
		.append_pair("redirect_uri", redirect_uri)
		.append_pair("scope", &scopes.join(" "))
		.finish();

	format!("{TWITCH_AUTHORIZE_URL}?{query}")
}
