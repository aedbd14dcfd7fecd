// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `api-key` plugin configuration: key shape, per-user quotas, and the
//! allowed-scopes policy enforced at `create-api-key` time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyConfigLayer {
	pub key_length: Option<u8>,
	pub key_prefix: Option<String>,
	pub max_keys_per_user: Option<u32>,
	pub default_ttl_days: Option<u32>,
	pub allowed_scopes: Option<Vec<String>>,
	pub require_scopes: Option<bool>,
	pub enable_usage_tracking: Option<bool>,
}

impl ApiKeyConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.key_length.is_some() {
			self.key_length = other.key_length;
		}
		if other.key_prefix.is_some() {
			self.key_prefix = other.key_prefix;
		}
		if other.max_keys_per_user.is_some() {
			self.max_keys_per_user = other.max_keys_per_user;
		}
		if other.default_ttl_days.is_some() {
			self.default_ttl_days = other.default_ttl_days;
		}
		if other.allowed_scopes.is_some() {
			self.allowed_scopes = other.allowed_scopes;
		}
		if other.require_scopes.is_some() {
			self.require_scopes = other.require_scopes;
		}
		if other.enable_usage_tracking.is_some() {
			self.enable_usage_tracking = other.enable_usage_tracking;
		}
	}

	pub fn finalize(self) -> Result<ApiKeyConfig, Vec<String>> {
		let mut errors = Vec::new();

		let key_length = self.key_length.unwrap_or(32);
		if key_length < 16 {
			errors.push(format!("key_length must be >= 16 bytes, got {key_length}"));
		}

		let allowed_scopes = self.allowed_scopes.unwrap_or_default();
		let require_scopes = self.require_scopes.unwrap_or(false);
		if require_scopes && allowed_scopes.is_empty() {
			errors.push("require_scopes is set but allowed_scopes is empty".to_string());
		}

		if errors.is_empty() {
			Ok(ApiKeyConfig {
				key_length,
				key_prefix: self.key_prefix.unwrap_or_else(|| "ak".to_string()),
				max_keys_per_user: self.max_keys_per_user.unwrap_or(10),
				default_ttl_days: self.default_ttl_days,
				allowed_scopes,
				require_scopes,
				enable_usage_tracking: self.enable_usage_tracking.unwrap_or(false),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyConfig {
	pub key_length: u8,
	pub key_prefix: String,
	pub max_keys_per_user: u32,
	/// `None` means keys never expire unless the caller sets `expires_at`
	/// explicitly at creation.
	pub default_ttl_days: Option<u32>,
	pub allowed_scopes: Vec<String>,
	pub require_scopes: bool,
	pub enable_usage_tracking: bool,
}

impl Default for ApiKeyConfig {
	fn default() -> Self {
		ApiKeyConfigLayer::default()
			.finalize()
			.expect("default layer always finalizes")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_use_ak_prefix() {
		assert_eq!(ApiKeyConfig::default().key_prefix, "ak");
	}

	#[test]
	fn short_key_length_is_rejected() {
		let layer = ApiKeyConfigLayer {
			key_length: Some(8),
			..Default::default()
		};
		assert!(layer.finalize().is_err());
	}

	#[test]
	fn requiring_scopes_without_an_allow_list_is_rejected() {
		let layer = ApiKeyConfigLayer {
			require_scopes: Some(true),
			..Default::default()
		};
		assert!(layer.finalize().is_err());
	}
}
