#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use alaire_domain::RoomId;
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::{PresenceEvent, PresenceEventTx, PresenceProvider};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type PresenceWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<PresenceWs>> + Send + Sync>;

/// Tunables for the presence channel.
#[derive(Clone)]
pub struct PresenceChannelConfig {
	/// Push endpoint base; the room slug is appended as a path segment.
	pub url: String,

	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,

	/// A connection silent for longer than this is considered dead and
	/// re-dialed.
	pub keepalive_window: Duration,

	/// Dial hook; `None` connects over TCP/TLS.
	pub connector: Option<WsConnector>,
}

impl PresenceChannelConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			keepalive_window: Duration::from_secs(60),
			connector: None,
		}
	}
}

/// Push connection delivering room presence counts, re-dialed with backoff
/// whenever it drops. Joining the room is part of the dial itself (the room
/// is a path segment), so a reconnect is also the resubscribe.
pub struct WsPresenceChannel {
	cfg: PresenceChannelConfig,
}

impl WsPresenceChannel {
	pub fn new(cfg: PresenceChannelConfig) -> Self {
		Self { cfg }
	}

	fn room_url(&self, room: &RoomId) -> anyhow::Result<Url> {
		let raw = format!("{}/{}/", self.cfg.url.trim_end_matches('/'), room.as_str());
		Url::parse(&raw).with_context(|| format!("invalid presence url: {raw}"))
	}

	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move { connect_presence_ws(url).await }) as BoxFuture<'static, anyhow::Result<PresenceWs>>
		})
	}
}

async fn connect_presence_ws(url: Url) -> anyhow::Result<PresenceWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to presence ws")?;
	Ok(ws)
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.saturating_sub(1).min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let delay = Duration::from_millis(ms.min(u64::MAX as u128) as u64).clamp(min, max);

	let delay_ms = delay.as_millis() as u64;
	let jitter_window = (delay_ms / 10).max(1);
	let mut rng = rand::rng();
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));
	Duration::from_millis(delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset))
}

/// Extract an online count from a text frame. Returns `None` for frames of
/// other types and for counts the frame mangles; neither ends the
/// connection.
fn parse_online_count(raw: &str) -> Option<u64> {
	let Ok(peek) = serde_json::from_str::<PresenceFramePeek>(raw) else {
		debug!("unparseable presence frame");
		return None;
	};
	if peek.message_type != "presence" {
		debug!(message_type = %peek.message_type, "ignoring non-presence frame");
		return None;
	}

	match serde_json::from_str::<PresenceFrame>(raw) {
		Ok(frame) => Some(frame.online_count),
		Err(e) => {
			debug!(error = %e, "presence frame without a usable onlineCount");
			None
		}
	}
}

#[async_trait]
impl PresenceProvider for WsPresenceChannel {
	async fn run(&self, room: RoomId, events: PresenceEventTx, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		let url = self.room_url(&room)?;
		let connector = self.connector();
		let mut attempt: u32 = 0;

		'outer: loop {
			if *shutdown.borrow() {
				break;
			}

			if attempt > 0 {
				let delay = backoff_delay(attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				debug!(room = %room, attempt, delay_ms = delay.as_millis() as u64, "presence reconnect wait");
				tokio::select! {
					_ = sleep(delay) => {}
					_ = shutdown.changed() => break 'outer,
				}
			}

			let mut ws = match connector(url.clone()).await {
				Ok(ws) => ws,
				Err(e) => {
					attempt = attempt.saturating_add(1);
					warn!(error = %e, room = %room, "presence connect failed");
					continue;
				}
			};

			attempt = 0;
			if events.send(PresenceEvent::Connected).await.is_err() {
				break;
			}
			info!(room = %room, "presence channel connected");

			let mut last_activity = Instant::now();

			loop {
				tokio::select! {
					_ = shutdown.changed() => {
						let _ = ws.close(None).await;
						break 'outer;
					}

					msg = ws.next() => {
						let Some(msg) = msg else {
							if events.send(PresenceEvent::Disconnected { reason: "channel ended".to_string() }).await.is_err() {
								break 'outer;
							}
							break;
						};

						let msg = match msg {
							Ok(m) => m,
							Err(e) => {
								if events.send(PresenceEvent::Disconnected { reason: e.to_string() }).await.is_err() {
									break 'outer;
								}
								break;
							}
						};

						match msg {
							Message::Text(t) => {
								last_activity = Instant::now();
								if let Some(count) = parse_online_count(&t) {
									if events.send(PresenceEvent::Online { count }).await.is_err() {
										break 'outer;
									}
								}
							}

							Message::Ping(p) => {
								last_activity = Instant::now();
								let _ = ws.send(Message::Pong(p)).await;
							}

							Message::Pong(_) => {
								last_activity = Instant::now();
							}

							Message::Close(_) => {
								if events.send(PresenceEvent::Disconnected { reason: "closed by server".to_string() }).await.is_err() {
									break 'outer;
								}
								break;
							}

							_ => {}
						}
					}

					_ = sleep(self.cfg.keepalive_window) => {
						if last_activity.elapsed() > self.cfg.keepalive_window {
							warn!(room = %room, "presence channel idle beyond keepalive window");
							let _ = ws.close(None).await;
							if events.send(PresenceEvent::Disconnected { reason: "keepalive window elapsed".to_string() }).await.is_err() {
								break 'outer;
							}
							break;
						}
					}
				}
			}

			attempt = attempt.saturating_add(1);
		}

		Ok(())
	}
}

#[derive(Debug, Deserialize)]
struct PresenceFramePeek {
	#[serde(rename = "type")]
	message_type: String,
}

#[derive(Debug, Deserialize)]
struct PresenceFrame {
	#[serde(rename = "onlineCount")]
	online_count: u64,
}
