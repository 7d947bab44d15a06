#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod identity;

pub use identity::UserIdentity;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Room (chat channel) slug, embedded verbatim in request paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a `RoomId`. The slug must be non-empty and must not contain
	/// whitespace or `/`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.contains('/') || id.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("not a path-safe room slug: {id:?}")));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Server-assigned message identifier, kept opaque on the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerMessageId(String);

impl ServerMessageId {
	/// Create a non-empty server message id.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ServerMessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ServerMessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ServerMessageId::new(s.to_string())
	}
}

/// Client-generated identifier for a provisional message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMessageId(pub uuid::Uuid);

impl ClientMessageId {
	/// Create a new random client message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ClientMessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Unified message identity: server-assigned for confirmed entries,
/// client-generated for provisional ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
	Server(ServerMessageId),
	Client(ClientMessageId),
}

impl MessageId {
	pub fn is_client(&self) -> bool {
		matches!(self, MessageId::Client(_))
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MessageId::Server(id) => write!(f, "{id}"),
			MessageId::Client(id) => write!(f, "{id}"),
		}
	}
}

/// Confirmation state of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
	Provisional,
	Confirmed,
}

impl MessageState {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageState::Provisional => "provisional",
			MessageState::Confirmed => "confirmed",
		}
	}
}

impl fmt::Display for MessageState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One chat timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,

	pub body: String,

	/// Resolved display string, never a full email address.
	pub author_display_name: String,

	pub author_is_self: bool,

	/// Server-assigned for confirmed entries, local wall clock for
	/// provisional ones.
	pub created_at: DateTime<Utc>,

	pub state: MessageState,
}

impl Message {
	/// Build a locally-echoed entry for a message the current user is
	/// about to send. Gets a fresh client id.
	pub fn provisional(body: impl Into<String>, author_display_name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
		Self {
			id: MessageId::Client(ClientMessageId::new_v4()),
			body: body.into(),
			author_display_name: author_display_name.into(),
			author_is_self: true,
			created_at,
			state: MessageState::Provisional,
		}
	}

	/// Build an entry attested by the server.
	pub fn confirmed(
		id: ServerMessageId,
		body: impl Into<String>,
		author_display_name: impl Into<String>,
		author_is_self: bool,
		created_at: DateTime<Utc>,
	) -> Self {
		Self {
			id: MessageId::Server(id),
			body: body.into(),
			author_display_name: author_display_name.into(),
			author_is_self,
			created_at,
			state: MessageState::Confirmed,
		}
	}
}

/// Participant count reported by the push channel. Replaced wholesale on
/// every presence event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
	pub online_count: u64,
}

/// Broadcast liveness as last observed by the status probe. Owned by the
/// session gate; everything else only reads it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
	pub is_live: bool,

	/// Listener count from the status payload. Not the same thing as
	/// `PresenceState`, which counts chat connections.
	pub listener_count: u64,

	/// `None` until the first probe completes.
	pub last_checked_at: Option<DateTime<Utc>>,
}

/// Upper bound on message length, counted in Unicode code points.
pub const MAX_MESSAGE_CODE_POINTS: usize = 500;

/// Trim and bounds-check a message body before it leaves the composer.
pub fn validate_body(raw: &str) -> Result<String, SendError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(SendError::EmptyBody);
	}
	let length = trimmed.chars().count();
	if length > MAX_MESSAGE_CODE_POINTS {
		return Err(SendError::BodyTooLong { length, limit: MAX_MESSAGE_CODE_POINTS });
	}
	Ok(trimmed.to_string())
}

/// Why a send attempt did not produce a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
	EmptyBody,
	BodyTooLong { length: usize, limit: usize },
	NotLive,
	SendInFlight,
	ChatClosed,
	NotAuthenticated,
	/// The server refused the message; detail is the first field-level
	/// error from the response body when one was present.
	Rejected(Option<String>),
	/// The request never produced a server verdict.
	Network(String),
}

impl SendError {
	/// True when the attempt was refused before any network call.
	pub fn is_validation(&self) -> bool {
		matches!(
			self,
			SendError::EmptyBody
				| SendError::BodyTooLong { .. }
				| SendError::NotLive
				| SendError::SendInFlight
				| SendError::ChatClosed
		)
	}
}

impl fmt::Display for SendError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::EmptyBody => f.write_str("message is empty"),
			Self::BodyTooLong { length, limit } => {
				write!(f, "message is {length} code points, the limit is {limit}")
			}
			Self::NotLive => f.write_str("chat is only available while the broadcast is live"),
			Self::SendInFlight => f.write_str("another message is still being sent"),
			Self::ChatClosed => f.write_str("chat session is not open"),
			Self::NotAuthenticated => f.write_str("sign in to send messages"),
			Self::Rejected(Some(detail)) => f.write_str(detail),
			Self::Rejected(None) | Self::Network(_) => f.write_str("message could not be sent, try again"),
		}
	}
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn mk_confirmed(id: &str, body: &str) -> Message {
		let Ok(id) = ServerMessageId::new(id) else {
			panic!("test id must be non-empty");
		};
		Message::confirmed(id, body, "ana", false, Utc::now())
	}

	#[test]
	fn room_id_rejects_unsafe_slugs() {
		assert!(RoomId::new("").is_err());
		assert!(RoomId::new("   ").is_err());
		assert!(RoomId::new("a/b").is_err());
		assert!(RoomId::new("radio oriente").is_err());
		assert_eq!(RoomId::new("aire-principal").unwrap().as_str(), "aire-principal");
	}

	#[test]
	fn server_id_parse_roundtrip() {
		let id = "41".parse::<ServerMessageId>().unwrap();
		assert_eq!(id.to_string(), "41");
		assert!("".parse::<ServerMessageId>().is_err());
	}

	#[test]
	fn provisional_messages_get_distinct_client_ids() {
		let now = Utc::now();
		let a = Message::provisional("hola", "yo", now);
		let b = Message::provisional("hola", "yo", now);
		assert!(a.id.is_client());
		assert_ne!(a.id, b.id);
		assert_eq!(a.state, MessageState::Provisional);
		assert!(a.author_is_self);
	}

	#[test]
	fn confirmed_message_carries_server_identity() {
		let msg = mk_confirmed("7", "buenas tardes");
		assert_eq!(msg.state, MessageState::Confirmed);
		assert!(!msg.id.is_client());
		let MessageId::Server(id) = &msg.id else {
			panic!("expected a server id");
		};
		assert_eq!(id.as_str(), "7");
	}

	#[test]
	fn validate_body_trims_and_bounds() {
		assert_eq!(validate_body("  hola  ").unwrap(), "hola");
		assert_eq!(validate_body("").unwrap_err(), SendError::EmptyBody);
		assert_eq!(validate_body(" \t\n ").unwrap_err(), SendError::EmptyBody);

		let exactly_limit = "ñ".repeat(MAX_MESSAGE_CODE_POINTS);
		assert_eq!(validate_body(&exactly_limit).unwrap(), exactly_limit);

		let over_limit = "ñ".repeat(MAX_MESSAGE_CODE_POINTS + 1);
		let Err(SendError::BodyTooLong { length, limit }) = validate_body(&over_limit) else {
			panic!("expected BodyTooLong");
		};
		assert_eq!(length, MAX_MESSAGE_CODE_POINTS + 1);
		assert_eq!(limit, MAX_MESSAGE_CODE_POINTS);
	}

	#[test]
	fn send_error_user_text() {
		assert_eq!(SendError::Rejected(Some("user is blocked".into())).to_string(), "user is blocked");
		assert_eq!(SendError::Rejected(None).to_string(), "message could not be sent, try again");
		assert_eq!(SendError::Network("timeout".into()).to_string(), "message could not be sent, try again");
		assert!(SendError::NotLive.is_validation());
		assert!(SendError::ChatClosed.is_validation());
		assert!(!SendError::Rejected(None).is_validation());
		assert!(!SendError::NotAuthenticated.is_validation());
	}

	proptest! {
		#[test]
		fn trimmed_bodies_stay_within_the_limit(raw in "\\PC{0,600}") {
			match validate_body(&raw) {
				Ok(body) => {
					prop_assert!(!body.is_empty());
					prop_assert!(body.chars().count() <= MAX_MESSAGE_CODE_POINTS);
					prop_assert_eq!(body.as_str(), raw.trim());
				}
				Err(SendError::EmptyBody) => prop_assert!(raw.trim().is_empty()),
				Err(SendError::BodyTooLong { length, limit }) => {
					prop_assert_eq!(length, raw.trim().chars().count());
					prop_assert_eq!(limit, MAX_MESSAGE_CODE_POINTS);
					prop_assert!(length > limit);
				}
				Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
			}
		}
	}
}
