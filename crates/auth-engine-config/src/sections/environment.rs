// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The deployment environment discriminator, consulted by
//! `EngineConfig::validate` to refuse `test_users.enabled = true` in
//! production.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
	Development,
	Staging,
	Production,
}

impl Environment {
	pub fn is_production(self) -> bool {
		matches!(self, Environment::Production)
	}
}

impl Default for Environment {
	fn default() -> Self {
		Environment::Development
	}
}

impl std::str::FromStr for Environment {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"development" | "dev" => Ok(Environment::Development),
			"staging" => Ok(Environment::Staging),
			"production" | "prod" => Ok(Environment::Production),
			other => Err(format!("unrecognized environment `{other}`")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_to_development() {
		assert_eq!(Environment::default(), Environment::Development);
	}

	#[test]
	fn only_production_is_production() {
		assert!(Environment::Production.is_production());
		assert!(!Environment::Staging.is_production());
		assert!(!Environment::Development.is_production());
	}

	#[test]
	fn parses_common_spellings() {
		assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
		assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
	}
}
