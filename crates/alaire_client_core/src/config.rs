#![forbid(unsafe_code)]

use std::time::Duration;

use alaire_domain::{ParseIdError, RoomId};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Contract cadences. The liveness verdict may lag the broadcast by up to
/// the probe interval; the timeline may lag the server by up to the sync
/// interval.
pub const STATUS_PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const MESSAGE_SYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
	/// REST base, e.g. `https://radio.example.org`.
	pub base_url: String,

	/// Push endpoint base, e.g. `wss://radio.example.org/ws/chat`. The room
	/// slug is appended as a path segment.
	pub presence_url: String,

	/// Room slug for both the history endpoint and the presence channel.
	pub room: String,

	/// Broadcast status probe cadence.
	pub status_interval_ms: u64,

	/// Timeline poll cadence while the session is open.
	pub sync_interval_ms: u64,

	/// Per-request HTTP timeout.
	pub http_timeout_ms: u64,

	pub reconnect_min_delay_ms: u64,
	pub reconnect_max_delay_ms: u64,

	/// Presence connection silent for longer than this is re-dialed.
	pub keepalive_window_ms: u64,

	/// How long transient send notices stay readable.
	pub notice_ttl_ms: u64,

	/// Newest-first window requested from the history endpoint.
	pub history_limit: u32,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			base_url: "http://localhost:8000".to_string(),
			presence_url: "ws://localhost:8000/ws/chat".to_string(),
			room: "aire-principal".to_string(),
			status_interval_ms: STATUS_PROBE_INTERVAL.as_millis() as u64,
			sync_interval_ms: MESSAGE_SYNC_INTERVAL.as_millis() as u64,
			http_timeout_ms: 10_000,
			reconnect_min_delay_ms: 500,
			reconnect_max_delay_ms: 30_000,
			keepalive_window_ms: 60_000,
			notice_ttl_ms: 3_000,
			history_limit: 200,
		}
	}
}

impl SessionConfig {
	pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
		let cfg: Self = toml::from_str(raw).context("parse session config")?;
		cfg.room_id().context("invalid room in session config")?;
		Ok(cfg)
	}

	pub fn room_id(&self) -> Result<RoomId, ParseIdError> {
		RoomId::new(&self.room)
	}

	pub fn status_interval(&self) -> Duration {
		Duration::from_millis(self.status_interval_ms)
	}

	pub fn sync_interval(&self) -> Duration {
		Duration::from_millis(self.sync_interval_ms)
	}

	pub fn http_timeout(&self) -> Duration {
		Duration::from_millis(self.http_timeout_ms)
	}

	pub fn reconnect_min_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_min_delay_ms)
	}

	pub fn reconnect_max_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_max_delay_ms)
	}

	pub fn keepalive_window(&self) -> Duration {
		Duration::from_millis(self.keepalive_window_ms)
	}

	pub fn notice_ttl(&self) -> Duration {
		Duration::from_millis(self.notice_ttl_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = SessionConfig::default();
		assert!(cfg.room_id().is_ok());
		assert_eq!(cfg.status_interval(), STATUS_PROBE_INTERVAL);
		assert_eq!(cfg.sync_interval(), MESSAGE_SYNC_INTERVAL);
		assert!(cfg.history_limit > 0);
	}

	#[test]
	fn partial_toml_keeps_defaults() {
		let cfg = SessionConfig::from_toml_str(
			r#"
			base_url = "https://radio.example.org"
			room = "noche-electronica"
			"#,
		)
		.unwrap();

		assert_eq!(cfg.base_url, "https://radio.example.org");
		assert_eq!(cfg.room, "noche-electronica");
		assert_eq!(cfg.sync_interval(), MESSAGE_SYNC_INTERVAL);
		assert_eq!(cfg.notice_ttl(), Duration::from_millis(3_000));
	}

	#[test]
	fn bad_room_slug_is_rejected() {
		let err = SessionConfig::from_toml_str(r#"room = "a/b""#).unwrap_err();
		assert!(err.to_string().contains("invalid room"), "unexpected error: {err:#}");
	}
}
