// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Development-only test-user fixtures.
//!
//! `email-password.login` consults these before touching the data-access
//! port at all, so integration tests and local development can authenticate
//! without seeding a real credential. `EngineConfig::validate` refuses to
//! construct if these are enabled while `environment == "production"`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestUserLayer {
	pub email: String,
	pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestUsersConfigLayer {
	pub enabled: Option<bool>,
	pub users: Option<Vec<TestUserLayer>>,
}

impl TestUsersConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.enabled.is_some() {
			self.enabled = other.enabled;
		}
		if other.users.is_some() {
			self.users = other.users;
		}
	}

	pub fn finalize(self) -> TestUsersConfig {
		TestUsersConfig {
			enabled: self.enabled.unwrap_or(false),
			users: self
				.users
				.unwrap_or_default()
				.into_iter()
				.map(|u| TestUser {
					email: u.email,
					password: u.password,
				})
				.collect(),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestUser {
	pub email: String,
	pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestUsersConfig {
	pub enabled: bool,
	pub users: Vec<TestUser>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disabled_by_default() {
		assert!(!TestUsersConfig::default().enabled);
	}

	#[test]
	fn finalize_preserves_user_list() {
		let layer = TestUsersConfigLayer {
			enabled: Some(true),
			users: Some(vec![TestUserLayer {
				email: "dev@example.com".into(),
				password: "dev-password".into(),
			}]),
		};
		let config = layer.finalize();
		assert!(config.enabled);
		assert_eq!(config.users.len(), 1);
		assert_eq!(config.users[0].email, "dev@example.com");
	}
}
