// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `email-password` plugin configuration.

use super::cleanup::{CleanupConfig, CleanupConfigLayer};
use super::test_users::{TestUsersConfig, TestUsersConfigLayer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailPasswordConfigLayer {
	pub verify_email: Option<bool>,
	pub login_on_register: Option<bool>,
	pub session_ttl_seconds: Option<u64>,
	pub code_length: Option<u8>,
	pub verification_code_expires_in_ms: Option<u64>,
	pub reset_password_code_expires_in_ms: Option<u64>,
	pub max_verification_attempts: Option<u32>,
	#[serde(default)]
	pub cleanup: CleanupConfigLayer,
	#[serde(default)]
	pub test_users: TestUsersConfigLayer,
}

impl EmailPasswordConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.verify_email.is_some() {
			self.verify_email = other.verify_email;
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
		self.cleanup.merge(other.cleanup);
		self.test_users.merge(other.test_users);
	}

	/// Resolve defaults and enforce the TTL bounds the plugin runtime's
	/// config-validation step checks at construction time (session TTL
	/// positive and <= 30 days, code TTL <= 24 hours).
	pub fn finalize(self) -> Result<EmailPasswordConfig, Vec<String>> {
		let mut errors = Vec::new();

		let session_ttl_seconds = self.session_ttl_seconds.unwrap_or(30 * 24 * 3600);
		if session_ttl_seconds == 0 || session_ttl_seconds > 30 * 24 * 3600 {
			errors.push(format!(
				"session_ttl_seconds must be in (0, {}], got {session_ttl_seconds}",
				30 * 24 * 3600
			));
		}

		let verification_code_expires_in_ms =
			self.verification_code_expires_in_ms.unwrap_or(15 * 60 * 1000);
		if verification_code_expires_in_ms > 24 * 3600 * 1000 {
			errors.push(format!(
				"verification_code_expires_in_ms must be <= {}, got {verification_code_expires_in_ms}",
				24 * 3600 * 1000
			));
		}

		let reset_password_code_expires_in_ms =
			self.reset_password_code_expires_in_ms.unwrap_or(15 * 60 * 1000);
		if reset_password_code_expires_in_ms > 24 * 3600 * 1000 {
			errors.push(format!(
				"reset_password_code_expires_in_ms must be <= {}, got {reset_password_code_expires_in_ms}",
				24 * 3600 * 1000
			));
		}

		if errors.is_empty() {
			Ok(EmailPasswordConfig {
				verify_email: self.verify_email.unwrap_or(false),
				login_on_register: self.login_on_register.unwrap_or(true),
				session_ttl_seconds,
				code_length: self.code_length.unwrap_or(6),
				verification_code_expires_in_ms,
				reset_password_code_expires_in_ms,
				max_verification_attempts: self.max_verification_attempts.unwrap_or(5),
				cleanup: self.cleanup.finalize(),
				test_users: self.test_users.finalize(),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailPasswordConfig {
	pub verify_email: bool,
	pub login_on_register: bool,
	pub session_ttl_seconds: u64,
	pub code_length: u8,
	pub verification_code_expires_in_ms: u64,
	pub reset_password_code_expires_in_ms: u64,
	pub max_verification_attempts: u32,
	pub cleanup: CleanupConfig,
	pub test_users: TestUsersConfig,
}

impl Default for EmailPasswordConfig {
	fn default() -> Self {
		EmailPasswordConfigLayer::default()
			.finalize()
			.expect("default layer always finalizes")
	}
}
