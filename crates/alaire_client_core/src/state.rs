#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use alaire_domain::{ClientMessageId, Message, MessageId, PresenceState, SendError, SessionState};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

/// Point-in-time view handed to renderers. Later state changes never mutate
/// an already-taken snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
	pub open: bool,
	pub authenticated: bool,
	pub sending: bool,

	/// Broadcast liveness as last probed.
	pub session: SessionState,

	/// Room participant count from the push channel.
	pub presence: PresenceState,
	pub presence_connected: bool,

	/// Oldest first, unique by id.
	pub timeline: Vec<Message>,

	/// Transient notices still within their display window.
	pub notices: Vec<String>,
}

/// Claim protecting an optimistic insert from full-replace reconciliation
/// while its send is still unconfirmed.
#[derive(Debug, Clone)]
struct PendingSend {
	message: Message,
}

#[derive(Debug, Clone)]
struct Notice {
	text: String,
	expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StateInner {
	open: bool,
	authenticated: bool,
	sending: bool,
	generation: u64,
	timeline: Vec<Message>,
	pending_send: Option<PendingSend>,
	presence: PresenceState,
	presence_connected: bool,
	session: SessionState,
	notices: Vec<Notice>,
}

/// Session state shared between the engine tasks and snapshot readers.
///
/// All mutation happens under one write lock so each cross-field rule
/// (single-flight send, gate check before the optimistic insert) holds
/// inside a single critical section. Writers that resume after an await
/// pass the generation their session started with; a mismatch means the
/// session was closed mid-flight and the write is dropped.
#[derive(Debug)]
pub struct SharedState {
	inner: RwLock<StateInner>,
	changes: watch::Sender<u64>,
	notice_ttl: Duration,
}

impl SharedState {
	pub fn new(notice_ttl: Duration) -> Self {
		let (changes, _) = watch::channel(0);
		Self {
			inner: RwLock::new(StateInner {
				open: false,
				authenticated: false,
				sending: false,
				generation: 0,
				timeline: Vec::new(),
				pending_send: None,
				presence: PresenceState::default(),
				presence_connected: false,
				session: SessionState::default(),
				notices: Vec::new(),
			}),
			changes,
			notice_ttl,
		}
	}

	/// Wakes whenever any snapshot-visible field changes.
	pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
		self.changes.subscribe()
	}

	fn bump(&self) {
		self.changes.send_modify(|v| *v = v.wrapping_add(1));
	}

	pub fn snapshot(&self) -> ChatSnapshot {
		let inner = self.inner.read();
		let now = Utc::now();
		ChatSnapshot {
			open: inner.open,
			authenticated: inner.authenticated,
			sending: inner.sending,
			session: inner.session,
			presence: inner.presence,
			presence_connected: inner.presence_connected,
			timeline: inner.timeline.clone(),
			notices: inner.notices.iter().filter(|n| n.expires_at > now).map(|n| n.text.clone()).collect(),
		}
	}

	pub fn session_state(&self) -> SessionState {
		self.inner.read().session
	}

	/// Mark the session open and hand back the generation all of its
	/// post-await writes must carry.
	pub(crate) fn begin_session(&self, authenticated: bool) -> u64 {
		let mut inner = self.inner.write();
		inner.open = true;
		inner.authenticated = authenticated;
		inner.generation = inner.generation.wrapping_add(1);
		let generation = inner.generation;
		drop(inner);
		self.bump();
		generation
	}

	/// Tear down the open session: timeline, presence, claims and notices
	/// all reset. The broadcast verdict survives, the gate owns it. The
	/// generation moves on so in-flight writes from the closed session
	/// land as no-ops.
	pub(crate) fn end_session(&self) {
		let mut inner = self.inner.write();
		inner.open = false;
		clear_room(&mut inner);
		drop(inner);
		self.bump();
	}

	/// Drop an open session to the signed-out state: room content, claims
	/// and notices reset, `open` stays set so the surface can show its
	/// sign-in call to action. The generation moves on exactly as on a
	/// close.
	pub(crate) fn revoke_session_auth(&self, generation: u64) {
		let mut inner = self.inner.write();
		if !inner.open || inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale sign-out");
			return;
		}
		clear_room(&mut inner);
		drop(inner);
		self.bump();
	}

	/// Gate verdict write. Not generation guarded; the probe outlives any
	/// one session.
	pub(crate) fn set_session_state(&self, session: SessionState) {
		{
			let mut inner = self.inner.write();
			inner.session = session;
		}
		self.bump();
	}

	pub(crate) fn set_online_count(&self, generation: u64, count: u64) {
		let mut inner = self.inner.write();
		if !inner.open || inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale presence count");
			return;
		}
		inner.presence.online_count = count;
		drop(inner);
		self.bump();
	}

	pub(crate) fn set_presence_connected(&self, generation: u64, connected: bool) {
		let mut inner = self.inner.write();
		if !inner.open || inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale presence flag");
			return;
		}
		inner.presence_connected = connected;
		drop(inner);
		self.bump();
	}

	/// Full-replace reconciliation. `messages` is the fetched window already
	/// mapped into timeline entries; ordering and id dedup are normalized
	/// here. A pending claim keeps its provisional alive across scheduled
	/// polls until the server copy shows up; the send's own resync always
	/// spends the claim. Returns false when the write was stale.
	pub(crate) fn replace_timeline(&self, generation: u64, messages: Vec<Message>, from_resync: bool) -> bool {
		let mut timeline = normalize_timeline(messages);

		let mut inner = self.inner.write();
		if !inner.open || inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale timeline replace");
			return false;
		}

		if let Some(pending) = inner.pending_send.take() {
			let confirmed = timeline.iter().any(|m| m.author_is_self && m.body == pending.message.body);
			if !from_resync && !confirmed {
				timeline.push(pending.message.clone());
				timeline.sort_by_key(|m| m.created_at);
				inner.pending_send = Some(pending);
			}
		}

		inner.timeline = timeline;
		drop(inner);
		self.bump();
		true
	}

	/// Single critical section covering the gate checks, the not-live
	/// refusal notice, and the optimistic insert. `body` must already have
	/// passed `validate_body`.
	pub(crate) fn begin_send(&self, body: &str, author_display_name: &str) -> Result<(u64, Message), SendError> {
		let mut inner = self.inner.write();
		if !inner.open {
			return Err(SendError::ChatClosed);
		}
		if !inner.authenticated {
			return Err(SendError::NotAuthenticated);
		}
		if inner.sending {
			return Err(SendError::SendInFlight);
		}
		if !inner.session.is_live {
			let err = SendError::NotLive;
			queue_notice(&mut inner, err.to_string(), self.notice_ttl);
			drop(inner);
			self.bump();
			return Err(err);
		}

		let message = Message::provisional(body, author_display_name, Utc::now());
		inner.sending = true;
		inner.pending_send = Some(PendingSend { message: message.clone() });
		inner.timeline.push(message.clone());
		inner.timeline.sort_by_key(|m| m.created_at);
		let generation = inner.generation;
		drop(inner);
		self.bump();
		Ok((generation, message))
	}

	pub(crate) fn finish_send(&self, generation: u64) {
		let mut inner = self.inner.write();
		if inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale send completion");
			return;
		}
		inner.sending = false;
		drop(inner);
		self.bump();
	}

	/// Remove a failed optimistic insert and release its claim.
	pub(crate) fn rollback_provisional(&self, generation: u64, client_id: ClientMessageId) {
		let mut inner = self.inner.write();
		if inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale rollback");
			return;
		}
		inner.timeline.retain(|m| m.id != MessageId::Client(client_id));
		inner.pending_send = None;
		drop(inner);
		self.bump();
	}

	/// Release the claim without touching the timeline. Used when a send
	/// was accepted but its resync did not complete; the next poll carries
	/// the server copy.
	pub(crate) fn clear_pending_send(&self, generation: u64) {
		let mut inner = self.inner.write();
		if inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale claim release");
			return;
		}
		inner.pending_send = None;
	}

	/// Queue a transient notice for a send begun under `generation`; a
	/// stale push is dropped. Expired notices are pruned here and filtered
	/// out of snapshots.
	pub(crate) fn push_notice(&self, generation: u64, text: impl Into<String>) {
		let mut inner = self.inner.write();
		if inner.generation != generation {
			debug!(generation, current = inner.generation, "dropping stale notice");
			return;
		}
		queue_notice(&mut inner, text.into(), self.notice_ttl);
		drop(inner);
		self.bump();
	}
}

fn clear_room(inner: &mut StateInner) {
	inner.authenticated = false;
	inner.sending = false;
	inner.generation = inner.generation.wrapping_add(1);
	inner.timeline.clear();
	inner.pending_send = None;
	inner.presence = PresenceState::default();
	inner.presence_connected = false;
	inner.notices.clear();
}

fn queue_notice(inner: &mut StateInner, text: String, ttl: Duration) {
	let now = Utc::now();
	inner.notices.retain(|n| n.expires_at > now);
	inner.notices.push(Notice { text, expires_at: now + ttl });
}

fn normalize_timeline(messages: Vec<Message>) -> Vec<Message> {
	let mut seen = HashSet::new();
	let mut out = Vec::with_capacity(messages.len());
	for message in messages {
		if seen.insert(message.id.clone()) {
			out.push(message);
		}
	}
	out.sort_by_key(|m| m.created_at);
	out
}
