// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `phone-password` plugin configuration — mirrors `email-password`'s shape
//! (see that module's comments for the TTL-bounds rationale) with an
//! E.164-normalization toggle in place of email-address validation.

use super::cleanup::{CleanupConfig, CleanupConfigLayer};
use super::test_users::{TestUsersConfig, TestUsersConfigLayer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhonePasswordConfigLayer {
	pub verify_phone: Option<bool>,
	pub login_on_register: Option<bool>,
	pub session_ttl_seconds: Option<u64>,
	pub code_length: Option<u8>,
	pub verification_code_expires_in_ms: Option<u64>,
	pub reset_password_code_expires_in_ms: Option<u64>,
	pub max_verification_attempts: Option<u32>,
	/// Reject phone numbers that don't parse as E.164 rather than storing
	/// whatever the caller sent.
	pub require_e164: Option<bool>,
	#[serde(default)]
	pub cleanup: CleanupConfigLayer,
	#[serde(default)]
	pub test_users: TestUsersConfigLayer,
}

impl PhonePasswordConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.verify_phone.is_some() {
			self.verify_phone = other.verify_phone;
		}
		if other.login_on_register.is_some() {
			self.login_on_register = other.login_on_register;
		}
		if other.session_ttl_seconds.is_some() {
			self.session_ttl_seconds = other.session_ttl_seconds;
		}
		if other.code_length.is_some() {
			self.code_length = other.code_length;
		}
		if other.verification_code_expires_in_ms.is_some() {
			self.verification_code_expires_in_ms = other.verification_code_expires_in_ms;
		}
		if other.reset_password_code_expires_in_ms.is_some() {
			self.reset_password_code_expires_in_ms = other.reset_password_code_expires_in_ms;
		}
		if other.max_verification_attempts.is_some() {
			self.max_verification_attempts = other.max_verification_attempts;
		}
		if other.require_e164.is_some() {
			self.require_e164 = other.require_e164;
		}
		self.cleanup.merge(other.cleanup);
		self.test_users.merge(other.test_users);
	}

	pub fn finalize(self) -> Result<PhonePasswordConfig, Vec<String>> {
		let mut errors = Vec::new();

		let session_ttl_seconds = self.session_ttl_seconds.unwrap_or(30 * 24 * 3600);
		if session_ttl_seconds == 0 || session_ttl_seconds > 30 * 24 * 3600 {
			errors.push(format!(
				"session_ttl_seconds must be in (0, {}], got {session_ttl_seconds}",
				30 * 24 * 3600
			));
		}

		let verification_code_expires_in_ms = self.verification_code_expires_in_ms.unwrap_or(15 * 60 * 1000);
		if verification_code_expires_in_ms > 24 * 3600 * 1000 {
			errors.push(format!(
				"verification_code_expires_in_ms must be <= {}, got {verification_code_expires_in_ms}",
				24 * 3600 * 1000
			));
		}

		let reset_password_code_expires_in_ms = self.reset_password_code_expires_in_ms.unwrap_or(15 * 60 * 1000);
		if reset_password_code_expires_in_ms > 24 * 3600 * 1000 {
			errors.push(format!(
				"reset_password_code_expires_in_ms must be <= {}, got {reset_password_code_expires_in_ms}",
				24 * 3600 * 1000
			));
		}

		if errors.is_empty() {
			Ok(PhonePasswordConfig {
				verify_phone: self.verify_phone.unwrap_or(false),
				login_on_register: self.login_on_register.unwrap_or(true),
				session_ttl_seconds,
				code_length: self.code_length.unwrap_or(6),
				verification_code_expires_in_ms,
				reset_password_code_expires_in_ms,
				max_verification_attempts: self.max_verification_attempts.unwrap_or(5),
				require_e164: self.require_e164.unwrap_or(true),
				cleanup: self.cleanup.finalize(),
				test_users: self.test_users.finalize(),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhonePasswordConfig {
	pub verify_phone: bool,
	pub login_on_register: bool,
	pub session_ttl_seconds: u64,
	pub code_length: u8,
	pub verification_code_expires_in_ms: u64,
	pub reset_password_code_expires_in_ms: u64,
	pub max_verification_attempts: u32,
	pub require_e164: bool,
	pub cleanup: CleanupConfig,
	pub test_users: TestUsersConfig,
}

impl Default for PhonePasswordConfig {
	fn default() -> Self {
		PhonePasswordConfigLayer::default()
			.finalize()
			.expect("default layer always finalizes")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_require_e164_and_disable_verification() {
		let config = PhonePasswordConfig::default();
		assert!(config.require_e164);
		assert!(!config.verify_phone);
	}

	#[test]
	fn session_ttl_over_30_days_is_rejected() {
		let layer = PhonePasswordConfigLayer {
			session_ttl_seconds: Some(31 * 24 * 3600),
			..Default::default()
		};
		assert!(layer.finalize().is_err());
	}
}
