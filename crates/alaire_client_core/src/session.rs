#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use alaire_domain::{Message, MessageId, RoomId, SendError, SessionState, UserIdentity, validate_body};
use alaire_domain::identity::handle_display_name;
use alaire_platform::{
	BroadcastStatusProvider, IdentityProvider, MessageCreateProvider, MessageHistoryProvider, PresenceEvent,
	PresenceEventRx, PresenceProvider, RemoteMessage,
};
use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::state::{ChatSnapshot, SharedState};

/// Everything the engine talks to, injected so callers can swap transports
/// or storage.
#[derive(Clone)]
pub struct ChatProviders {
	pub status: Arc<dyn BroadcastStatusProvider>,
	pub history: Arc<dyn MessageHistoryProvider>,
	pub create: Arc<dyn MessageCreateProvider>,
	pub presence: Arc<dyn PresenceProvider>,
	pub identity: Arc<dyn IdentityProvider>,
}

struct OpenSession {
	generation: u64,
	shutdown: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
}

/// Live chat engine for one room.
///
/// The broadcast status gate runs from `start` to `shutdown`; the chat
/// session itself (timeline sync, presence, sending) runs between `open`
/// and `close`. Readers take [`ChatSnapshot`]s and wake on the change
/// channel.
pub struct LiveChatClient {
	room: RoomId,
	cfg: SessionConfig,
	providers: ChatProviders,
	state: Arc<SharedState>,
	gate_shutdown: watch::Sender<bool>,
	gate_task: Mutex<Option<JoinHandle<()>>>,
	session: Mutex<Option<OpenSession>>,
}

impl LiveChatClient {
	/// Create the client and start the status gate. Chat itself starts on
	/// [`LiveChatClient::open`].
	pub fn start(cfg: SessionConfig, providers: ChatProviders) -> anyhow::Result<Self> {
		let room = cfg.room_id().context("invalid room in session config")?;
		let state = Arc::new(SharedState::new(cfg.notice_ttl()));

		let (gate_shutdown, gate_rx) = watch::channel(false);
		let gate_task = tokio::spawn(run_status_gate(
			providers.status.clone(),
			state.clone(),
			cfg.status_interval(),
			gate_rx,
		));

		Ok(Self {
			room,
			cfg,
			providers,
			state,
			gate_shutdown,
			gate_task: Mutex::new(Some(gate_task)),
			session: Mutex::new(None),
		})
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	pub fn snapshot(&self) -> ChatSnapshot {
		self.state.snapshot()
	}

	/// Wakes whenever the snapshot would change.
	pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
		self.state.subscribe_changes()
	}

	/// Open the chat session. With an identity present this starts the
	/// timeline sync and the presence channel; without one the session
	/// opens in a signed-out state and syncs nothing. A sign-out while
	/// open lands in that same state: the loops stop and the session
	/// waits until the surface closes and reopens it. A second open while
	/// already open is a no-op.
	pub async fn open(&self) -> anyhow::Result<()> {
		let mut session = self.session.lock().await;
		if session.is_some() {
			debug!(room = %self.room, "open ignored, session already open");
			return Ok(());
		}

		let identity = self.providers.identity.get();
		let authenticated = identity.is_some();
		let generation = self.state.begin_session(authenticated);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let Some(identity) = identity else {
			info!(room = %self.room, "chat opened without identity, sync paused");
			*session = Some(OpenSession {
				generation,
				shutdown: shutdown_tx,
				tasks: Vec::new(),
			});
			return Ok(());
		};

		let mut tasks = Vec::new();

		tasks.push(tokio::spawn(run_message_sync(
			self.providers.history.clone(),
			self.providers.identity.clone(),
			self.state.clone(),
			self.room.clone(),
			generation,
			self.cfg.sync_interval(),
			shutdown_tx.clone(),
			shutdown_rx.clone(),
		)));

		let (events_tx, events_rx) = mpsc::channel(64);
		let presence = self.providers.presence.clone();
		let presence_room = self.room.clone();
		tasks.push(tokio::spawn(async move {
			if let Err(e) = presence.run(presence_room.clone(), events_tx, shutdown_rx).await {
				warn!(error = %e, room = %presence_room, "presence channel ended");
			}
		}));
		tasks.push(tokio::spawn(run_presence_pump(self.state.clone(), generation, events_rx)));

		info!(room = %self.room, user = %identity.display_name(), "chat session opened");
		*session = Some(OpenSession {
			generation,
			shutdown: shutdown_tx,
			tasks,
		});
		Ok(())
	}

	/// Close the chat session: stop its tasks, clear the timeline and
	/// presence. The status gate keeps running. A close while already
	/// closed is a no-op.
	pub async fn close(&self) {
		let Some(open) = self.session.lock().await.take() else {
			return;
		};

		let _ = open.shutdown.send(true);
		for task in open.tasks {
			if let Err(e) = task.await {
				warn!(error = %e, room = %self.room, "session task ended abnormally");
			}
		}
		self.state.end_session();
		info!(room = %self.room, generation = open.generation, "chat session closed");
	}

	/// Close the session and stop the status gate.
	pub async fn shutdown(&self) {
		self.close().await;
		let _ = self.gate_shutdown.send(true);
		if let Some(task) = self.gate_task.lock().await.take()
			&& let Err(e) = task.await
		{
			warn!(error = %e, "status gate ended abnormally");
		}
	}

	/// Optimistic send. The validated body is echoed into the timeline
	/// before the network call, then replaced by the server copy on the
	/// next successful fetch, or rolled back if the service refuses it.
	/// One send at a time; a send that is in flight when the broadcast
	/// ends still runs to completion.
	pub async fn send(&self, raw: &str) -> Result<(), SendError> {
		let body = validate_body(raw)?;

		let Some(identity) = self.providers.identity.get() else {
			return Err(SendError::NotAuthenticated);
		};

		let (generation, message) = self.state.begin_send(&body, &identity.display_name())?;

		match self.providers.create.create_message(&self.room, &body).await {
			Ok(created) => {
				debug!(room = %self.room, id = %created.id, "message accepted");
				match self.providers.history.fetch_history(&self.room).await {
					Ok(remote) => {
						let mapped = map_remote_messages(remote, &identity);
						self.state.replace_timeline(generation, mapped, true);
					}
					Err(e) => {
						warn!(error = %e, room = %self.room, "post-send resync failed, next poll will confirm");
						self.state.clear_pending_send(generation);
					}
				}
				self.state.finish_send(generation);
				Ok(())
			}
			Err(err) => {
				warn!(error = %err, room = %self.room, "send failed, rolling back the echo");
				if let MessageId::Client(client_id) = message.id {
					self.state.rollback_provisional(generation, client_id);
				}
				if matches!(err, SendError::Rejected(_) | SendError::Network(_)) {
					self.state.push_notice(generation, err.to_string());
				}
				self.state.finish_send(generation);
				Err(err)
			}
		}
	}
}

impl Drop for LiveChatClient {
	fn drop(&mut self) {
		let _ = self.gate_shutdown.send(true);
		if let Ok(mut session) = self.session.try_lock()
			&& let Some(open) = session.take()
		{
			let _ = open.shutdown.send(true);
		}
	}
}

/// Broadcast status probe. Owns the liveness verdict for the client's
/// whole lifetime; a failed probe reads as off air until the next one
/// succeeds.
async fn run_status_gate(
	status: Arc<dyn BroadcastStatusProvider>,
	state: Arc<SharedState>,
	interval: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = shutdown.changed() => break,
		}

		let fetched = tokio::select! {
			r = status.fetch_status() => r,
			_ = shutdown.changed() => break,
		};

		let session = match fetched {
			Ok(s) => SessionState {
				is_live: s.is_live,
				listener_count: s.listener_count,
				last_checked_at: Some(Utc::now()),
			},
			Err(e) => {
				warn!(error = %e, "status probe failed, treating broadcast as off air");
				SessionState {
					is_live: false,
					listener_count: 0,
					last_checked_at: Some(Utc::now()),
				}
			}
		};
		state.set_session_state(session);
	}
}

/// Timeline poll loop. The first tick lands immediately so an opened
/// session has history without waiting a full interval. The identity is
/// re-read on every tick; when it disappears the whole session drops to
/// the signed-out state. A failed poll keeps the current timeline.
async fn run_message_sync(
	history: Arc<dyn MessageHistoryProvider>,
	identity: Arc<dyn IdentityProvider>,
	state: Arc<SharedState>,
	room: RoomId,
	generation: u64,
	interval: Duration,
	shutdown_tx: watch::Sender<bool>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = shutdown.changed() => break,
		}

		let Some(user) = identity.get() else {
			info!(room = %room, "identity cleared, dropping the session to signed out");
			let _ = shutdown_tx.send(true);
			state.revoke_session_auth(generation);
			break;
		};

		let fetched = tokio::select! {
			r = history.fetch_history(&room) => r,
			_ = shutdown.changed() => break,
		};

		match fetched {
			Ok(remote) => {
				let mapped = map_remote_messages(remote, &user);
				if !state.replace_timeline(generation, mapped, false) {
					break;
				}
			}
			Err(e) => {
				warn!(error = %e, room = %room, "history poll failed, keeping current timeline");
			}
		}
	}
}

/// Apply presence events to shared state. Ends when the channel runner
/// drops its sender.
async fn run_presence_pump(state: Arc<SharedState>, generation: u64, mut events: PresenceEventRx) {
	while let Some(event) = events.recv().await {
		match event {
			PresenceEvent::Connected => state.set_presence_connected(generation, true),
			PresenceEvent::Online { count } => state.set_online_count(generation, count),
			PresenceEvent::Disconnected { reason } => {
				debug!(reason = %reason, "presence channel dropped");
				state.set_presence_connected(generation, false);
			}
		}
	}
}

/// Map a newest-first server window into oldest-first timeline entries,
/// resolving display names. The current user's entries use their own
/// resolved profile; other authors only ever expose a handle.
fn map_remote_messages(remote: Vec<RemoteMessage>, identity: &UserIdentity) -> Vec<Message> {
	let self_display = identity.display_name();
	remote
		.into_iter()
		.rev()
		.map(|m| {
			let author_is_self = m.author_handle == identity.handle;
			let display = if author_is_self {
				self_display.clone()
			} else {
				handle_display_name(&m.author_handle)
			};
			Message::confirmed(m.id, m.body, display, author_is_self, m.created_at)
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use alaire_domain::ServerMessageId;
	use chrono::DateTime;

	use super::*;

	fn mk_remote(id: &str, body: &str, handle: &str, at: i64) -> RemoteMessage {
		let Ok(id) = ServerMessageId::new(id) else {
			panic!("test id must be non-empty");
		};
		let Some(created_at) = DateTime::from_timestamp(at, 0) else {
			panic!("test timestamp out of range");
		};
		RemoteMessage {
			id,
			body: body.to_string(),
			author_handle: handle.to_string(),
			created_at,
		}
	}

	#[test]
	fn mapping_reverses_the_window_and_resolves_authors() {
		let mut identity = UserIdentity::new("carla@radio.fm");
		identity.first_name = Some("Carla".to_string());

		let remote = vec![
			mk_remote("2", "segunda", "dj.nocturno@radio.fm", 20),
			mk_remote("1", "primera", "carla@radio.fm", 10),
		];
		let mapped = map_remote_messages(remote, &identity);

		assert_eq!(mapped.len(), 2);
		assert_eq!(mapped[0].body, "primera");
		assert!(mapped[0].author_is_self);
		assert_eq!(mapped[0].author_display_name, "Carla");

		assert_eq!(mapped[1].body, "segunda");
		assert!(!mapped[1].author_is_self);
		assert_eq!(mapped[1].author_display_name, "dj.nocturno");
	}

	#[test]
	fn plain_handles_pass_through_unchanged() {
		let identity = UserIdentity::new("yo");
		let mapped = map_remote_messages(vec![mk_remote("1", "hola", "locutora", 10)], &identity);
		assert_eq!(mapped[0].author_display_name, "locutora");
	}
}
