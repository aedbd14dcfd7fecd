// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! JWKS signing-key rotation policy, consumed by the token codec.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JwksConfigLayer {
	pub key_rotation_interval_days: Option<u32>,
	pub key_grace_period_days: Option<u32>,
	pub enable_refresh_token_rotation: Option<bool>,
}

impl JwksConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.key_rotation_interval_days.is_some() {
			self.key_rotation_interval_days = other.key_rotation_interval_days;
		}
		if other.key_grace_period_days.is_some() {
			self.key_grace_period_days = other.key_grace_period_days;
		}
		if other.enable_refresh_token_rotation.is_some() {
			self.enable_refresh_token_rotation = other.enable_refresh_token_rotation;
		}
	}

	pub fn finalize(self) -> JwksConfig {
		JwksConfig {
			key_rotation_interval_days: self.key_rotation_interval_days.unwrap_or(30),
			key_grace_period_days: self.key_grace_period_days.unwrap_or(7),
			enable_refresh_token_rotation: self.enable_refresh_token_rotation.unwrap_or(false),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwksConfig {
	pub key_rotation_interval_days: u32,
	pub key_grace_period_days: u32,
	pub enable_refresh_token_rotation: bool,
}

impl Default for JwksConfig {
	fn default() -> Self {
		Self {
			key_rotation_interval_days: 30,
			key_grace_period_days: 7,
			enable_refresh_token_rotation: false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grace_period_is_shorter_than_rotation_interval_by_default() {
		let config = JwksConfig::default();
		assert!(config.key_grace_period_days < config.key_rotation_interval_days);
	}
}
