#![forbid(unsafe_code)]

use std::time::Duration;

use alaire_domain::{Message, MessageId, SendError, ServerMessageId, SessionState};
use chrono::{DateTime, Utc};

use crate::state::SharedState;

fn mk_confirmed(id: &str, body: &str, at: i64) -> Message {
	let Ok(id) = ServerMessageId::new(id) else {
		panic!("test id must be non-empty");
	};
	let Some(at) = DateTime::from_timestamp(at, 0) else {
		panic!("test timestamp out of range");
	};
	Message::confirmed(id, body, "ana", false, at)
}

fn mk_self_confirmed(id: &str, body: &str, at: i64) -> Message {
	let Ok(id) = ServerMessageId::new(id) else {
		panic!("test id must be non-empty");
	};
	let Some(at) = DateTime::from_timestamp(at, 0) else {
		panic!("test timestamp out of range");
	};
	Message::confirmed(id, body, "yo", true, at)
}

fn mk_live_state() -> (SharedState, u64) {
	let state = SharedState::new(Duration::from_secs(3));
	let generation = state.begin_session(true);
	state.set_session_state(SessionState {
		is_live: true,
		listener_count: 12,
		last_checked_at: Some(Utc::now()),
	});
	(state, generation)
}

#[test]
fn replace_is_idempotent_and_ordered() {
	let (state, generation) = mk_live_state();
	let fetched = vec![mk_confirmed("3", "tres", 30), mk_confirmed("1", "uno", 10), mk_confirmed("2", "dos", 20)];

	assert!(state.replace_timeline(generation, fetched.clone(), false));
	let first = state.snapshot().timeline;
	let bodies: Vec<&str> = first.iter().map(|m| m.body.as_str()).collect();
	assert_eq!(bodies, vec!["uno", "dos", "tres"]);

	assert!(state.replace_timeline(generation, fetched, false));
	assert_eq!(state.snapshot().timeline, first);
}

#[test]
fn duplicate_ids_collapse_to_one_entry() {
	let (state, generation) = mk_live_state();
	let fetched = vec![mk_confirmed("1", "primera copia", 10), mk_confirmed("1", "segunda copia", 20)];

	state.replace_timeline(generation, fetched, false);
	let timeline = state.snapshot().timeline;
	assert_eq!(timeline.len(), 1);
	assert_eq!(timeline[0].body, "primera copia");
}

#[test]
fn provisional_survives_polls_until_the_server_copy_lands() {
	let (state, generation) = mk_live_state();
	let (send_generation, message) = state.begin_send("hola", "yo").unwrap();
	assert_eq!(send_generation, generation);

	// A scheduled poll that does not carry the copy yet.
	state.replace_timeline(generation, vec![mk_confirmed("1", "otra", 10)], false);
	let timeline = state.snapshot().timeline;
	assert_eq!(timeline.len(), 2);
	assert!(timeline.iter().any(|m| m.id == message.id));

	// The copy arrives; the provisional is dropped with its claim.
	state.replace_timeline(generation, vec![mk_confirmed("1", "otra", 10), mk_self_confirmed("2", "hola", 20)], false);
	let timeline = state.snapshot().timeline;
	assert_eq!(timeline.len(), 2);
	assert!(!timeline.iter().any(|m| m.id == message.id));

	state.replace_timeline(generation, Vec::new(), false);
	assert!(state.snapshot().timeline.is_empty());
}

#[test]
fn resync_spends_the_claim() {
	let (state, generation) = mk_live_state();
	let (_, message) = state.begin_send("hola", "yo").unwrap();

	state.replace_timeline(generation, vec![mk_self_confirmed("9", "hola", 40)], true);
	let timeline = state.snapshot().timeline;
	assert_eq!(timeline.len(), 1);
	assert!(!timeline.iter().any(|m| m.id == message.id));

	// No claim left, so an empty poll empties the timeline.
	state.replace_timeline(generation, Vec::new(), false);
	assert!(state.snapshot().timeline.is_empty());
}

#[test]
fn failed_send_rolls_back_and_leaves_a_notice() {
	let (state, generation) = mk_live_state();
	let (_, message) = state.begin_send("hola", "yo").unwrap();
	assert!(state.snapshot().sending);

	let MessageId::Client(client_id) = message.id else {
		panic!("provisional entries carry client ids");
	};
	state.rollback_provisional(generation, client_id);
	state.push_notice(generation, "message could not be sent, try again");
	state.finish_send(generation);

	let snapshot = state.snapshot();
	assert!(snapshot.timeline.is_empty());
	assert!(!snapshot.sending);
	assert_eq!(snapshot.notices, vec!["message could not be sent, try again".to_string()]);
}

#[test]
fn begin_send_enforces_the_gate_order() {
	let state = SharedState::new(Duration::from_secs(3));
	assert_eq!(state.begin_send("hola", "yo").unwrap_err(), SendError::ChatClosed);

	let generation = state.begin_session(false);
	assert_eq!(state.begin_send("hola", "yo").unwrap_err(), SendError::NotAuthenticated);
	state.end_session();

	let generation_two = state.begin_session(true);
	assert_ne!(generation, generation_two);
	assert_eq!(state.begin_send("hola", "yo").unwrap_err(), SendError::NotLive);
	assert_eq!(
		state.snapshot().notices,
		vec!["chat is only available while the broadcast is live".to_string()],
		"the refusal queues its notice in the same critical section"
	);

	state.set_session_state(SessionState {
		is_live: true,
		listener_count: 0,
		last_checked_at: Some(Utc::now()),
	});
	assert!(state.begin_send("hola", "yo").is_ok());
	assert_eq!(state.begin_send("otra", "yo").unwrap_err(), SendError::SendInFlight);
}

#[test]
fn stale_generation_writes_are_dropped() {
	let (state, old_generation) = mk_live_state();
	state.end_session();
	let generation = state.begin_session(true);

	assert!(!state.replace_timeline(old_generation, vec![mk_confirmed("1", "uno", 10)], false));
	state.set_online_count(old_generation, 9);
	state.push_notice(old_generation, "aviso perdido");

	let snapshot = state.snapshot();
	assert!(snapshot.timeline.is_empty());
	assert_eq!(snapshot.presence.online_count, 0);
	assert!(snapshot.notices.is_empty());

	state.set_online_count(generation, 4);
	assert_eq!(state.snapshot().presence.online_count, 4);
}

#[test]
fn closing_clears_the_room_but_keeps_the_broadcast_verdict() {
	let (state, generation) = mk_live_state();
	state.replace_timeline(generation, vec![mk_confirmed("1", "uno", 10)], false);
	state.set_online_count(generation, 7);
	state.push_notice(generation, "aviso");

	state.end_session();

	let snapshot = state.snapshot();
	assert!(!snapshot.open);
	assert!(!snapshot.authenticated);
	assert!(snapshot.timeline.is_empty());
	assert_eq!(snapshot.presence.online_count, 0);
	assert!(snapshot.notices.is_empty());
	assert!(snapshot.session.is_live, "the gate verdict must survive a close");
}

#[test]
fn revoking_auth_keeps_the_session_open_but_signed_out() {
	let (state, generation) = mk_live_state();
	state.replace_timeline(generation, vec![mk_confirmed("1", "uno", 10)], false);
	state.set_online_count(generation, 7);

	state.revoke_session_auth(generation);

	let snapshot = state.snapshot();
	assert!(snapshot.open, "the surface owns closing");
	assert!(!snapshot.authenticated);
	assert!(snapshot.timeline.is_empty());
	assert_eq!(snapshot.presence.online_count, 0);

	// The generation moved on, so writes from the signed-out session drop.
	assert!(!state.replace_timeline(generation, vec![mk_confirmed("2", "dos", 20)], false));
	assert!(state.snapshot().timeline.is_empty());

	// A stale revoke after a fresh session starts is a no-op.
	state.end_session();
	let next = state.begin_session(true);
	state.revoke_session_auth(generation);
	assert!(state.snapshot().authenticated);
	state.set_online_count(next, 3);
	assert_eq!(state.snapshot().presence.online_count, 3);
}

#[test]
fn notices_expire_after_their_ttl() {
	let state = SharedState::new(Duration::ZERO);
	let generation = state.begin_session(true);
	state.push_notice(generation, "ya caducado");
	assert!(state.snapshot().notices.is_empty());
}

#[test]
fn changes_tick_on_writes() {
	let (state, generation) = mk_live_state();
	let rx = state.subscribe_changes();
	let before = *rx.borrow();
	state.replace_timeline(generation, vec![mk_confirmed("1", "uno", 10)], false);
	assert_ne!(*rx.borrow(), before);
}
