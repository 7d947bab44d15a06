#![forbid(unsafe_code)]

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use alaire_domain::{RoomId, SendError, ServerMessageId};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::{
	BroadcastStatus, BroadcastStatusProvider, CreatedMessage, CredentialProvider, MessageCreateProvider,
	MessageHistoryProvider, RemoteMessage,
};

/// HTTP side of the chat service: status probe, history window, message
/// create. One shared client carries the request timeout for all three.
#[derive(Clone)]
pub struct RestChatClient {
	base_url: String,
	credentials: Arc<dyn CredentialProvider>,
	history_limit: u32,
	client: reqwest::Client,
}

impl fmt::Debug for RestChatClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RestChatClient")
			.field("base_url", &self.base_url)
			.field("history_limit", &self.history_limit)
			.finish_non_exhaustive()
	}
}

impl RestChatClient {
	pub fn new(
		base_url: impl Into<String>,
		credentials: Arc<dyn CredentialProvider>,
		timeout: Duration,
		history_limit: u32,
	) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build http client")?;
		Ok(Self {
			base_url: base_url.into(),
			credentials,
			history_limit,
			client,
		})
	}

	fn auth_header(&self) -> anyhow::Result<String> {
		let token = self.credentials.get().ok_or_else(|| anyhow!("missing bearer credential"))?;
		let token = token.expose().trim().to_string();
		if token.is_empty() {
			return Err(anyhow!("missing bearer credential"));
		}
		Ok(format!("Bearer {token}"))
	}

	fn auth_header_optional(&self) -> Option<String> {
		self.auth_header().ok()
	}

	fn status_url(&self) -> String {
		format!("{}/api/radio/status/", self.base_url.trim_end_matches('/'))
	}

	fn messages_url(&self, room: &RoomId) -> String {
		format!("{}/api/chat/messages/{}/", self.base_url.trim_end_matches('/'), room.as_str())
	}
}

#[async_trait]
impl BroadcastStatusProvider for RestChatClient {
	async fn fetch_status(&self) -> anyhow::Result<BroadcastStatus> {
		let resp = self.client.get(self.status_url()).send().await.context("get radio status")?;
		if !resp.status().is_success() {
			return Err(anyhow!("radio status failed: status={}", resp.status()));
		}

		let body: StatusResponse = resp.json().await.context("parse radio status response")?;
		Ok(BroadcastStatus {
			is_live: body.is_online,
			listener_count: body.listeners_count,
		})
	}
}

#[async_trait]
impl MessageHistoryProvider for RestChatClient {
	async fn fetch_history(&self, room: &RoomId) -> anyhow::Result<Vec<RemoteMessage>> {
		let url = format!("{}?limit={}", self.messages_url(room), self.history_limit);
		let mut request = self.client.get(url);
		if let Some(auth) = self.auth_header_optional() {
			request = request.header("Authorization", auth);
		}

		let resp = request.send().await.context("get chat messages")?;
		if !resp.status().is_success() {
			return Err(anyhow!("chat history failed: status={}", resp.status()));
		}

		let bytes = resp.bytes().await.context("read chat history body")?;
		parse_history_payload(&bytes)
	}
}

#[async_trait]
impl MessageCreateProvider for RestChatClient {
	async fn create_message(&self, room: &RoomId, body: &str) -> Result<CreatedMessage, SendError> {
		let auth = self.auth_header().map_err(|_| SendError::NotAuthenticated)?;
		let payload = PostMessageRequest { contenido: body };

		let resp = self
			.client
			.post(self.messages_url(room))
			.header("Authorization", auth)
			.json(&payload)
			.send()
			.await
			.map_err(|e| SendError::Network(e.to_string()))?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => {
				let record: MessageRecord = resp.json().await.map_err(|e| SendError::Network(e.to_string()))?;
				normalize_record(record)
					.map(|m| CreatedMessage {
						id: m.id,
						created_at: m.created_at,
					})
					.ok_or_else(|| SendError::Network("malformed create response".to_string()))
			}
			status => {
				let text = resp.text().await.unwrap_or_default();
				debug!(%status, room = %room, "chat message rejected");
				Err(SendError::Rejected(rejection_detail(&text)))
			}
		}
	}
}

/// Decode a history response body. The service answers with either a bare
/// array of records or a paginated envelope whose `results` hold them; both
/// shapes collapse here, records the service mangled are skipped.
pub fn parse_history_payload(bytes: &[u8]) -> anyhow::Result<Vec<RemoteMessage>> {
	let payload: HistoryPayload = serde_json::from_slice(bytes).context("parse chat history response")?;
	let records = match payload {
		HistoryPayload::Plain(records) => records,
		HistoryPayload::Paginated { results } => results,
	};

	let total = records.len();
	let messages: Vec<RemoteMessage> = records.into_iter().filter_map(normalize_record).collect();
	if messages.len() < total {
		debug!(skipped = total - messages.len(), "dropped malformed history records");
	}
	Ok(messages)
}

fn normalize_record(record: MessageRecord) -> Option<RemoteMessage> {
	let id = match record.id {
		RawId::Num(n) => ServerMessageId::new(n.to_string()),
		RawId::Str(s) => ServerMessageId::new(s),
	}
	.ok()?;

	let created_at = DateTime::parse_from_rfc3339(&record.fecha_envio)
		.map(|t| t.with_timezone(&Utc))
		.ok()?;

	Some(RemoteMessage {
		id,
		body: record.contenido,
		author_handle: record.usuario_nombre,
		created_at,
	})
}

/// Pull a user-facing detail out of a rejection body: `detail` first, then
/// the first field error in body order, which may be a string or an array
/// of strings. Body order needs serde_json's `preserve_order`.
pub fn rejection_detail(body: &str) -> Option<String> {
	let value: serde_json::Value = serde_json::from_str(body).ok()?;
	let object = value.as_object()?;

	if let Some(detail) = object.get("detail").and_then(|v| v.as_str()) {
		return Some(detail.to_string());
	}

	for field in object.values() {
		match field {
			serde_json::Value::String(message) => return Some(message.clone()),
			serde_json::Value::Array(items) => {
				if let Some(message) = items.iter().find_map(|i| i.as_str()) {
					return Some(message.to_string());
				}
			}
			_ => {}
		}
	}
	None
}

#[derive(Debug, serde::Serialize)]
struct PostMessageRequest<'a> {
	contenido: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
	is_online: bool,
	#[serde(default)]
	listeners_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
	Plain(Vec<MessageRecord>),
	Paginated { results: Vec<MessageRecord> },
}

#[derive(Debug, Deserialize)]
struct MessageRecord {
	id: RawId,
	contenido: String,
	usuario_nombre: String,
	fecha_envio: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
	Num(u64),
	Str(String),
}
