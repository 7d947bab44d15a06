#![forbid(unsafe_code)]

use core::fmt;
use std::sync::Arc;

use alaire_domain::{RoomId, SendError, ServerMessageId, UserIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

pub mod presence;
pub mod rest;

pub use presence::{PresenceChannelConfig, WsPresenceChannel};
pub use rest::RestChatClient;

/// Broadcast liveness as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStatus {
	pub is_live: bool,

	/// Listeners of the broadcast itself, not chat connections.
	#[serde(default)]
	pub listener_count: u64,
}

/// One record from the history endpoint. The service serves these
/// newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
	pub id: ServerMessageId,
	pub body: String,
	pub author_handle: String,
	pub created_at: DateTime<Utc>,
}

/// Acknowledgement for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedMessage {
	pub id: ServerMessageId,
	pub created_at: DateTime<Utc>,
}

/// Events emitted by the presence channel run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
	/// Channel established for the room.
	Connected,

	/// Count of participants currently connected to the room. Replaces
	/// any previous value.
	Online { count: u64 },

	/// Channel lost. The run loop keeps retrying with backoff until it is
	/// shut down.
	Disconnected { reason: String },
}

/// Sender half used by the presence run loop.
pub type PresenceEventTx = mpsc::Sender<PresenceEvent>;
/// Receiver half consumed by the session.
pub type PresenceEventRx = mpsc::Receiver<PresenceEvent>;

/// Read side of the broadcast status endpoint.
#[async_trait]
pub trait BroadcastStatusProvider: Send + Sync {
	async fn fetch_status(&self) -> anyhow::Result<BroadcastStatus>;
}

/// Read side of the message history endpoint.
#[async_trait]
pub trait MessageHistoryProvider: Send + Sync {
	/// Fetch the recent window for `room`, newest-first as served.
	async fn fetch_history(&self, room: &RoomId) -> anyhow::Result<Vec<RemoteMessage>>;
}

/// Write side of the chat service. Requires a bearer credential.
#[async_trait]
pub trait MessageCreateProvider: Send + Sync {
	async fn create_message(&self, room: &RoomId, body: &str) -> Result<CreatedMessage, SendError>;
}

/// Long-lived push channel reporting room presence.
#[async_trait]
pub trait PresenceProvider: Send + Sync {
	/// Run the channel for `room` until `shutdown` flips to true, emitting
	/// on `events`. Returns when shut down or when the receiver is gone.
	async fn run(&self, room: RoomId, events: PresenceEventTx, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// Current-user identity storage with explicit get/set/clear. Implementations
/// must not rely on ambient global state.
pub trait IdentityProvider: Send + Sync {
	fn get(&self) -> Option<UserIdentity>;
	fn set(&self, identity: UserIdentity);
	fn clear(&self);
}

/// Bearer credential storage with explicit get/set/clear.
pub trait CredentialProvider: Send + Sync {
	fn get(&self) -> Option<SecretString>;
	fn set(&self, token: SecretString);
	fn clear(&self);
}

/// Wrapper that keeps credentials out of logs and serialized output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(Self(s))
	}
}

/// In-memory identity store for embedding and tests.
#[derive(Default)]
pub struct MemoryIdentityStore {
	identity: parking_lot::RwLock<Option<UserIdentity>>,
}

impl MemoryIdentityStore {
	pub fn new(identity: Option<UserIdentity>) -> Arc<Self> {
		Arc::new(Self {
			identity: parking_lot::RwLock::new(identity),
		})
	}
}

impl IdentityProvider for MemoryIdentityStore {
	fn get(&self) -> Option<UserIdentity> {
		self.identity.read().clone()
	}

	fn set(&self, identity: UserIdentity) {
		*self.identity.write() = Some(identity);
	}

	fn clear(&self) {
		*self.identity.write() = None;
	}
}

/// In-memory credential store for embedding and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
	token: parking_lot::RwLock<Option<SecretString>>,
}

impl MemoryCredentialStore {
	pub fn new(token: Option<SecretString>) -> Arc<Self> {
		Arc::new(Self {
			token: parking_lot::RwLock::new(token),
		})
	}
}

impl CredentialProvider for MemoryCredentialStore {
	fn get(&self) -> Option<SecretString> {
		self.token.read().clone()
	}

	fn set(&self, token: SecretString) {
		*self.token.write() = Some(token);
	}

	fn clear(&self) {
		*self.token.write() = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_never_prints_its_contents() {
		let secret = SecretString::new("token-abc123");
		assert_eq!(format!("{secret}"), "<redacted>");
		assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
		let Ok(json) = serde_json::to_string(&secret) else {
			panic!("secret must serialize");
		};
		assert_eq!(json, "\"\"");
		assert_eq!(secret.expose(), "token-abc123");
	}

	#[test]
	fn memory_stores_get_set_clear() {
		let credentials = MemoryCredentialStore::new(None);
		assert!(credentials.get().is_none());
		credentials.set(SecretString::new("t"));
		assert_eq!(credentials.get().map(|t| t.expose().to_string()), Some("t".to_string()));
		credentials.clear();
		assert!(credentials.get().is_none());

		let identities = MemoryIdentityStore::new(None);
		assert!(identities.get().is_none());
		identities.set(UserIdentity::new("maria@example.com"));
		let Some(identity) = identities.get() else {
			panic!("identity must be present after set");
		};
		assert_eq!(identity.handle, "maria@example.com");
		identities.clear();
		assert!(identities.get().is_none());
	}
}
