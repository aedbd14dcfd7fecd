// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `webauthn` plugin configuration. The plugin itself is scaffolding only —
//! `finish-registration`/`finish-authentication` return `not_implemented`
//! until attestation and assertion verification is built — but the config
//! surface is defined in full so deployments can wire up relying-party
//! identity ahead of that work.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebauthnConfigLayer {
	pub rp_id: Option<String>,
	pub rp_name: Option<String>,
	pub rp_origin: Option<String>,
	pub challenge_ttl_ms: Option<u64>,
	pub max_credentials_per_subject: Option<u32>,
}

impl WebauthnConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.rp_id.is_some() {
			self.rp_id = other.rp_id;
		}
		if other.rp_name.is_some() {
			self.rp_name = other.rp_name;
		}
		if other.rp_origin.is_some() {
			self.rp_origin = other.rp_origin;
		}
		if other.challenge_ttl_ms.is_some() {
			self.challenge_ttl_ms = other.challenge_ttl_ms;
		}
		if other.max_credentials_per_subject.is_some() {
			self.max_credentials_per_subject = other.max_credentials_per_subject;
		}
	}

	pub fn finalize(self) -> Result<WebauthnConfig, Vec<String>> {
		let mut errors = Vec::new();

		let challenge_ttl_ms = self.challenge_ttl_ms.unwrap_or(5 * 60 * 1000);
		if challenge_ttl_ms > 24 * 3600 * 1000 {
			errors.push(format!("challenge_ttl_ms must be <= {}, got {challenge_ttl_ms}", 24 * 3600 * 1000));
		}

		if errors.is_empty() {
			Ok(WebauthnConfig {
				rp_id: self.rp_id.unwrap_or_else(|| "localhost".to_string()),
				rp_name: self.rp_name.unwrap_or_else(|| "Auth Engine".to_string()),
				rp_origin: self.rp_origin,
				challenge_ttl_ms,
				max_credentials_per_subject: self.max_credentials_per_subject.unwrap_or(10),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebauthnConfig {
	pub rp_id: String,
	pub rp_name: String,
	pub rp_origin: Option<String>,
	pub challenge_ttl_ms: u64,
	pub max_credentials_per_subject: u32,
}

impl Default for WebauthnConfig {
	fn default() -> Self {
		WebauthnConfigLayer::default()
			.finalize()
			.expect("default layer always finalizes")
	}
}
