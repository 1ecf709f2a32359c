#![forbid(unsafe_code)]

//! The persisted state document: login, event descriptors and sink ports.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::default_config_dir;

pub fn default_settings_path() -> PathBuf {
	default_config_dir().join("settings.toml")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInUser {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct Settings {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub application_id: Option<String>,
	pub scopes: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub access_token: Option<String>,
	/// Event descriptors, e.g. `channel.follow/2:mb`.
	pub events: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ws_port: Option<u16>,
	pub udp_ports: Vec<u16>,
	// Last: TOML tables must follow plain values.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub logged_in_user: Option<LoggedInUser>,
}

impl fmt::Debug for Settings {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Settings")
			.field("application_id", &self.application_id)
			.field("scopes", &self.scopes)
			.field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
			.field("logged_in_user", &self.logged_in_user)
			.field("events", &self.events)
			.field("ws_port", &self.ws_port)
			.field("udp_ports", &self.udp_ports)
			.finish()
	}
}

impl Settings {
	/// Each known key is read on its own; a key with the wrong shape is skipped with a warning.
	fn from_table(mut table: toml::Table) -> Self {
		let settings = Self {
			application_id: take(&mut table, "application_id"),
			scopes: take(&mut table, "scopes").unwrap_or_default(),
			access_token: take(&mut table, "access_token"),
			logged_in_user: take(&mut table, "logged_in_user"),
			events: take(&mut table, "events").unwrap_or_default(),
			ws_port: take(&mut table, "ws_port"),
			udp_ports: take(&mut table, "udp_ports").unwrap_or_default(),
		};

		for key in table.keys() {
			info!(%key, "settings: ignoring unknown key");
		}

		settings
	}

	pub fn has_access_token(&self) -> bool {
		self.access_token.as_deref().is_some_and(|t| !t.trim().is_empty())
	}
}

fn take<T: DeserializeOwned>(table: &mut toml::Table, key: &str) -> Option<T> {
	let value = table.remove(key)?;
	match value.try_into::<T>() {
		Ok(v) => Some(v),
		Err(e) => {
			warn!(%key, error = %e, "settings: skipping malformed key");
			None
		}
	}
}

/// Loaded settings plus the run-only env overrides.
///
/// `current` is what the daemon uses; `persisted` is what gets written back.
#[derive(Debug)]
pub struct SettingsStore {
	path: PathBuf,
	persisted: Settings,
	current: Settings,
}

impl SettingsStore {
	pub fn load(path: &Path) -> Self {
		Self::load_with_env(path, |key| std::env::var(key).ok())
	}

	pub fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
		let persisted = load_from_disk(path).unwrap_or_default();
		let mut current = persisted.clone();

		if let Some(v) = lookup("EVENTHUB_APPLICATION_ID").map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
			current.application_id = Some(v);
			info!("settings: application_id overridden by env");
		}
		if let Some(v) = lookup("EVENTHUB_ACCESS_TOKEN").map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
			current.access_token = Some(v);
			info!("settings: access_token overridden by env");
		}

		Self {
			path: path.to_path_buf(),
			persisted,
			current,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn current(&self) -> &Settings {
		&self.current
	}

	/// Apply `f` to both views and rewrite the file.
	pub fn update(&mut self, f: impl Fn(&mut Settings)) -> anyhow::Result<()> {
		f(&mut self.persisted);
		f(&mut self.current);
		persist_to_disk(&self.path, &self.persisted)
	}
}

fn load_from_disk(path: &Path) -> Option<Settings> {
	let data = match fs::read_to_string(path) {
		Ok(d) => d,
		Err(e) => {
			info!(path = %path.display(), error = %e, "no settings file");
			return None;
		}
	};

	match toml::from_str::<toml::Table>(&data) {
		Ok(table) => {
			info!(path = %path.display(), "loaded settings");
			Some(Settings::from_table(table))
		}
		Err(e) => {
			warn!(path = %path.display(), error = %e, "failed to parse settings TOML; starting from defaults");
			None
		}
	}
}

fn persist_to_disk(path: &Path, settings: &Settings) -> anyhow::Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).with_context(|| format!("create settings dir {}", parent.display()))?;
	}

	let data = toml::to_string_pretty(settings).context("serialize settings")?;
	let len = data.len();
	fs::write(path, data).with_context(|| format!("write settings file {}", path.display()))?;
	info!(path = %path.display(), bytes = len, "wrote settings file");
	Ok(())
}
