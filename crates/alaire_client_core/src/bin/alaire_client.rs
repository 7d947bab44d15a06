#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use alaire_client_core::{ChatProviders, LiveChatClient, SessionConfig};
use alaire_domain::{MessageId, MessageState, UserIdentity};
use alaire_platform::{
	MemoryCredentialStore, MemoryIdentityStore, PresenceChannelConfig, RestChatClient, SecretString, WsPresenceChannel,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: alaire_client [--config file.toml] [--base-url url] [--ws-url url] [--room slug]\n\
\n\
Options:\n\
	--config    Session config as TOML (defaults apply for missing keys)\n\
	--base-url  REST base, e.g. https://radio.example.org\n\
	--ws-url    Presence endpoint base, e.g. wss://radio.example.org/ws/chat\n\
	--room      Room slug (default: aire-principal)\n\
	--help      Show this help\n\
\n\
Environment:\n\
	ALAIRE_AUTH_TOKEN    Bearer token for the chat API\n\
	ALAIRE_HANDLE        Login handle of the current user\n\
	ALAIRE_FIRST_NAME    Optional first name for display\n\
	ALAIRE_DISPLAY_NAME  Optional display-name override\n\
\n\
Examples:\n\
	alaire_client --base-url https://radio.example.org --ws-url wss://radio.example.org/ws/chat\n\
	ALAIRE_AUTH_TOKEN=... ALAIRE_HANDLE=carla@radio.fm alaire_client --room aire-principal\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,alaire_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> SessionConfig {
	let mut config_path: Option<String> = None;
	let mut base_url: Option<String> = None;
	let mut presence_url: Option<String> = None;
	let mut room: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(v);
			}
			"--base-url" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--base-url must be non-empty");
					usage_and_exit();
				}
				base_url = Some(v);
			}
			"--ws-url" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--ws-url must be non-empty");
					usage_and_exit();
				}
				presence_url = Some(v);
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--room must be non-empty");
					usage_and_exit();
				}
				room = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let mut cfg = match config_path {
		Some(path) => {
			let raw = std::fs::read_to_string(&path).unwrap_or_else(|e| {
				eprintln!("Cannot read {path}: {e}");
				usage_and_exit()
			});
			SessionConfig::from_toml_str(&raw).unwrap_or_else(|e| {
				eprintln!("Invalid config {path}: {e:#}");
				usage_and_exit()
			})
		}
		None => SessionConfig::default(),
	};

	if let Some(v) = base_url {
		cfg.base_url = v;
	}
	if let Some(v) = presence_url {
		cfg.presence_url = v;
	}
	if let Some(v) = room {
		cfg.room = v;
	}

	if let Err(e) = cfg.room_id() {
		eprintln!("Invalid --room value: {e}");
		usage_and_exit();
	}

	cfg
}

async fn run_render_loop(client: Arc<LiveChatClient>) {
	let mut changes = client.subscribe_changes();
	let mut seen: HashSet<MessageId> = HashSet::new();
	let mut last_live: Option<bool> = None;
	let mut last_online: Option<u64> = None;
	let mut last_notices: Vec<String> = Vec::new();

	loop {
		let snapshot = client.snapshot();

		if snapshot.session.last_checked_at.is_some() && last_live != Some(snapshot.session.is_live) {
			if snapshot.session.is_live {
				println!("-- broadcast live ({} listeners) --", snapshot.session.listener_count);
			} else {
				println!("-- broadcast off air --");
			}
			last_live = Some(snapshot.session.is_live);
		}

		if snapshot.presence_connected && last_online != Some(snapshot.presence.online_count) {
			println!("-- {} in the room --", snapshot.presence.online_count);
			last_online = Some(snapshot.presence.online_count);
		}

		for message in &snapshot.timeline {
			if seen.insert(message.id.clone()) {
				let marker = if message.state == MessageState::Provisional { " (sending)" } else { "" };
				println!(
					"[{}] {}: {}{marker}",
					message.created_at.format("%H:%M:%S"),
					message.author_display_name,
					message.body
				);
			}
		}

		for notice in &snapshot.notices {
			if !last_notices.contains(notice) {
				println!("! {notice}");
			}
		}
		last_notices = snapshot.notices;

		if changes.changed().await.is_err() {
			break;
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let cfg = parse_args();

	let token = std::env::var("ALAIRE_AUTH_TOKEN").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});
	let handle = std::env::var("ALAIRE_HANDLE").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});
	let first_name = std::env::var("ALAIRE_FIRST_NAME").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});
	let display_name = std::env::var("ALAIRE_DISPLAY_NAME").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});

	if token.is_some() != handle.is_some() {
		warn!("set both ALAIRE_AUTH_TOKEN and ALAIRE_HANDLE to chat; one without the other stays signed out");
	}

	let identity = handle.map(|handle| {
		let mut identity = UserIdentity::new(handle);
		identity.first_name = first_name;
		identity.display_override = display_name;
		identity
	});

	let credentials = MemoryCredentialStore::new(token.map(SecretString::new));
	let identity_store = MemoryIdentityStore::new(identity);

	let rest = Arc::new(RestChatClient::new(
		cfg.base_url.clone(),
		credentials,
		cfg.http_timeout(),
		cfg.history_limit,
	)?);

	let mut presence_cfg = PresenceChannelConfig::new(cfg.presence_url.clone());
	presence_cfg.reconnect_min_delay = cfg.reconnect_min_delay();
	presence_cfg.reconnect_max_delay = cfg.reconnect_max_delay();
	presence_cfg.keepalive_window = cfg.keepalive_window();

	let providers = ChatProviders {
		status: rest.clone(),
		history: rest.clone(),
		create: rest,
		presence: Arc::new(WsPresenceChannel::new(presence_cfg)),
		identity: identity_store,
	};

	info!(room = %cfg.room, base_url = %cfg.base_url, "starting live chat client");
	let client = Arc::new(LiveChatClient::start(cfg, providers)?);
	client.open().await?;

	let render = tokio::spawn(run_render_loop(client.clone()));

	println!("type a message and press enter to send; /quit leaves");
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			line = lines.next_line() => {
				match line {
					Ok(Some(line)) => {
						let line = line.trim();
						if line.is_empty() {
							continue;
						}
						if line == "/quit" {
							break;
						}
						if let Err(e) = client.send(line).await {
							eprintln!("send failed: {e}");
						}
					}
					Ok(None) => break,
					Err(e) => {
						warn!(error = %e, "stdin ended");
						break;
					}
				}
			}
			_ = tokio::signal::ctrl_c() => break,
		}
	}

	client.shutdown().await;
	render.abort();
	let _ = render.await;
	Ok(())
}
