#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Identity signals for the current user, as supplied by the identity
/// provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
	/// Login handle. May be shaped like an email address.
	pub handle: String,

	#[serde(default)]
	pub first_name: Option<String>,

	/// Explicitly cached display-name override.
	#[serde(default)]
	pub display_override: Option<String>,
}

impl UserIdentity {
	pub fn new(handle: impl Into<String>) -> Self {
		Self {
			handle: handle.into(),
			first_name: None,
			display_override: None,
		}
	}

	/// Resolve the name shown next to this user's messages. Precedence:
	/// cached override, then first name, then the handle via
	/// [`handle_display_name`].
	pub fn display_name(&self) -> String {
		if let Some(name) = non_blank(&self.display_override) {
			return name.to_string();
		}
		if let Some(name) = non_blank(&self.first_name) {
			return name.to_string();
		}
		handle_display_name(&self.handle)
	}
}

/// Display label for an author handle. Email-shaped handles are cut at the
/// first `@` so a full address is never rendered.
pub fn handle_display_name(handle: &str) -> String {
	match handle.split_once('@') {
		Some((local, _)) => local.to_string(),
		None => handle.to_string(),
	}
}

fn non_blank(value: &Option<String>) -> Option<&str> {
	value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
