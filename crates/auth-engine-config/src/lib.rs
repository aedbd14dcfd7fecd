// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Centralized configuration management for the auth engine.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with per-plugin validation
//! - Consistent environment variable naming (`AUTH_ENGINE_*`)
//!
//! # Usage
//!
//! ```ignore
//! use auth_engine_config::load_config;
//!
//! let config = load_config()?;
//! println!("environment: {:?}", config.environment);
//! ```

pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use error::ConfigError;
pub use layer::EngineConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved engine configuration: every plugin's settings, finalized
/// and validated against every other plugin.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub environment: Environment,
	pub jwks: JwksConfig,
	pub email_password: EmailPasswordConfig,
	pub phone_password: PhonePasswordConfig,
	pub passwordless: PasswordlessConfig,
	pub anonymous: AnonymousConfig,
	pub api_key: ApiKeyConfig,
	pub oidc: OidcConfig,
	pub saml: SamlConfig,
	pub webauthn: WebauthnConfig,
}

impl Default for EngineConfig {
	fn default() -> Self {
		finalize(EngineConfigLayer::default()).expect("default layer always finalizes")
	}
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`AUTH_ENGINE_*`)
/// 2. Config file (`/etc/auth-engine/config.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<EngineConfig, ConfigError> {
	let mut sources: Vec<Box<dyn ConfigSource>> =
		vec![Box::new(DefaultsSource), Box::new(TomlSource::system()), Box::new(EnvSource)];

	sources.sort_by_key(|s| s.precedence());

	let mut merged = EngineConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	finalize(merged)
}

/// Load configuration from environment only (for testing or simple deployments).
pub fn load_config_from_env() -> Result<EngineConfig, ConfigError> {
	let mut merged = EngineConfigLayer::default();
	merged.merge(EnvSource.load()?);
	finalize(merged)
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(config_path: impl Into<std::path::PathBuf>) -> Result<EngineConfig, ConfigError> {
	let mut sources: Vec<Box<dyn ConfigSource>> =
		vec![Box::new(DefaultsSource), Box::new(TomlSource::new(config_path)), Box::new(EnvSource)];

	sources.sort_by_key(|s| s.precedence());

	let mut merged = EngineConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	finalize(merged)
}

/// Finalize an unresolved layer into a resolved config, aggregating every
/// section's validation errors into one `ConfigError::Validation` rather
/// than failing on the first section encountered.
fn finalize(layer: EngineConfigLayer) -> Result<EngineConfig, ConfigError> {
	let mut errors = Vec::new();

	let environment = layer.environment.unwrap_or_default();
	let jwks = layer.jwks.finalize();

	macro_rules! finalize_section {
		($layer:expr) => {
			match $layer.finalize() {
				Ok(config) => Some(config),
				Err(section_errors) => {
					errors.extend(section_errors);
					None
				}
			}
		};
	}

	let email_password = finalize_section!(layer.email_password);
	let phone_password = finalize_section!(layer.phone_password);
	let passwordless = finalize_section!(layer.passwordless);
	let anonymous = finalize_section!(layer.anonymous);
	let api_key = finalize_section!(layer.api_key);
	let oidc = finalize_section!(layer.oidc);
	let saml = finalize_section!(layer.saml);
	let webauthn = finalize_section!(layer.webauthn);

	if !errors.is_empty() {
		return Err(ConfigError::Validation(errors.join("; ")));
	}

	let test_users_enabled =
		email_password.as_ref().map(|c| c.test_users.enabled).unwrap_or(false) || phone_password.as_ref().map(|c| c.test_users.enabled).unwrap_or(false);
	validate_config(environment, test_users_enabled)?;

	let config = EngineConfig {
		environment,
		jwks,
		email_password: email_password.expect("validated above"),
		phone_password: phone_password.expect("validated above"),
		passwordless: passwordless.expect("validated above"),
		anonymous: anonymous.expect("validated above"),
		api_key: api_key.expect("validated above"),
		oidc: oidc.expect("validated above"),
		saml: saml.expect("validated above"),
		webauthn: webauthn.expect("validated above"),
	};

	info!(
		environment = ?config.environment,
		email_verification = config.email_password.verify_email,
		phone_verification = config.phone_password.verify_phone,
		magic_links = config.passwordless.magic_links,
		oidc_providers = config.oidc.providers.len(),
		saml_providers = config.saml.providers.len(),
		"engine configuration loaded"
	);

	Ok(config)
}

/// Cross-section rule: test-user fixtures must never be reachable in
/// production, regardless of which plugin enabled them.
fn validate_config(environment: Environment, test_users_enabled: bool) -> Result<(), ConfigError> {
	if environment.is_production() && test_users_enabled {
		return Err(ConfigError::Validation(
			"test_users.enabled is set while environment=production; this would let anyone \
			 authenticate with well-known fixture credentials. Disable test_users or set a \
			 non-production environment."
				.to_string(),
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_layer_finalizes_cleanly() {
		let config = EngineConfig::default();
		assert_eq!(config.environment, Environment::Development);
		assert!(!config.email_password.test_users.enabled);
	}

	#[test]
	fn test_users_enabled_in_production_is_rejected() {
		let mut layer = EngineConfigLayer::default();
		layer.environment = Some(Environment::Production);
		layer.email_password.test_users.enabled = Some(true);

		let result = finalize(layer);
		assert!(result.is_err());
		assert!(result.unwrap_err().to_string().contains("production"));
	}

	#[test]
	fn test_users_enabled_in_development_is_fine() {
		let mut layer = EngineConfigLayer::default();
		layer.email_password.test_users.enabled = Some(true);
		assert!(finalize(layer).is_ok());
	}

	#[test]
	fn section_validation_errors_are_aggregated_across_sections() {
		let mut layer = EngineConfigLayer::default();
		layer.email_password.session_ttl_seconds = Some(0);
		layer.api_key.require_scopes = Some(true);

		let err = finalize(layer).unwrap_err().to_string();
		assert!(err.contains("session_ttl_seconds"));
		assert!(err.contains("allowed_scopes"));
	}
}
