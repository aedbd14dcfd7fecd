// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::layer::EngineConfigLayer;
use crate::sections::{
	AnonymousConfigLayer, ApiKeyConfigLayer, EmailPasswordConfigLayer, Environment, JwksConfigLayer,
	OidcConfigLayer, OidcProviderConfigLayer, PasswordlessConfigLayer, PhonePasswordConfigLayer, SamlConfigLayer,
	SamlProviderConfigLayer, WebauthnConfigLayer,
};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<EngineConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<EngineConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(EngineConfigLayer::default())
	}
}

pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/auth-engine/config.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<EngineConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(EngineConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: EngineConfigLayer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: `AUTH_ENGINE_<SECTION>_<FIELD>`.
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<EngineConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(EngineConfigLayer {
			environment: match env_var("AUTH_ENGINE_ENV") {
				Some(v) => Some(
					Environment::from_str(&v).map_err(|reason| ConfigError::Env { name: "AUTH_ENGINE_ENV".to_string(), reason })?,
				),
				None => None,
			},
			jwks: load_jwks_from_env()?,
			email_password: load_email_password_from_env()?,
			phone_password: load_phone_password_from_env()?,
			passwordless: load_passwordless_from_env()?,
			anonymous: load_anonymous_from_env()?,
			api_key: load_api_key_from_env()?,
			oidc: load_oidc_from_env()?,
			saml: load_saml_from_env()?,
			webauthn: load_webauthn_from_env()?,
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u8(name: &str) -> Result<Option<u8>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u8 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u32 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u64 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_list(name: &str) -> Option<Vec<String>> {
	env_var(name).map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

fn load_jwks_from_env() -> Result<JwksConfigLayer, ConfigError> {
	Ok(JwksConfigLayer {
		key_rotation_interval_days: env_u32("AUTH_ENGINE_JWKS_KEY_ROTATION_INTERVAL_DAYS")?,
		key_grace_period_days: env_u32("AUTH_ENGINE_JWKS_KEY_GRACE_PERIOD_DAYS")?,
		enable_refresh_token_rotation: env_bool("AUTH_ENGINE_JWKS_ENABLE_REFRESH_TOKEN_ROTATION"),
	})
}

fn load_email_password_from_env() -> Result<EmailPasswordConfigLayer, ConfigError> {
	Ok(EmailPasswordConfigLayer {
		verify_email: env_bool("AUTH_ENGINE_EMAIL_PASSWORD_VERIFY_EMAIL"),
		login_on_register: env_bool("AUTH_ENGINE_EMAIL_PASSWORD_LOGIN_ON_REGISTER"),
		session_ttl_seconds: env_u64("AUTH_ENGINE_EMAIL_PASSWORD_SESSION_TTL_SECONDS")?,
		code_length: env_u8("AUTH_ENGINE_EMAIL_PASSWORD_CODE_LENGTH")?,
		verification_code_expires_in_ms: env_u64("AUTH_ENGINE_EMAIL_PASSWORD_VERIFICATION_CODE_EXPIRES_IN_MS")?,
		reset_password_code_expires_in_ms: env_u64(
			"AUTH_ENGINE_EMAIL_PASSWORD_RESET_PASSWORD_CODE_EXPIRES_IN_MS",
		)?,
		max_verification_attempts: env_u32("AUTH_ENGINE_EMAIL_PASSWORD_MAX_VERIFICATION_ATTEMPTS")?,
		..Default::default()
	})
}

fn load_phone_password_from_env() -> Result<PhonePasswordConfigLayer, ConfigError> {
	Ok(PhonePasswordConfigLayer {
		verify_phone: env_bool("AUTH_ENGINE_PHONE_PASSWORD_VERIFY_PHONE"),
		login_on_register: env_bool("AUTH_ENGINE_PHONE_PASSWORD_LOGIN_ON_REGISTER"),
		session_ttl_seconds: env_u64("AUTH_ENGINE_PHONE_PASSWORD_SESSION_TTL_SECONDS")?,
		code_length: env_u8("AUTH_ENGINE_PHONE_PASSWORD_CODE_LENGTH")?,
		verification_code_expires_in_ms: env_u64("AUTH_ENGINE_PHONE_PASSWORD_VERIFICATION_CODE_EXPIRES_IN_MS")?,
		reset_password_code_expires_in_ms: env_u64(
			"AUTH_ENGINE_PHONE_PASSWORD_RESET_PASSWORD_CODE_EXPIRES_IN_MS",
		)?,
		max_verification_attempts: env_u32("AUTH_ENGINE_PHONE_PASSWORD_MAX_VERIFICATION_ATTEMPTS")?,
		require_e164: env_bool("AUTH_ENGINE_PHONE_PASSWORD_REQUIRE_E164"),
		..Default::default()
	})
}

fn load_passwordless_from_env() -> Result<PasswordlessConfigLayer, ConfigError> {
	Ok(PasswordlessConfigLayer {
		magic_links: env_bool("AUTH_ENGINE_PASSWORDLESS_MAGIC_LINKS"),
		verification_codes: env_bool("AUTH_ENGINE_PASSWORDLESS_VERIFICATION_CODES"),
		webauthn: env_bool("AUTH_ENGINE_PASSWORDLESS_WEBAUTHN"),
		code_length: env_u8("AUTH_ENGINE_PASSWORDLESS_CODE_LENGTH")?,
		magic_link_expires_in_ms: env_u64("AUTH_ENGINE_PASSWORDLESS_MAGIC_LINK_EXPIRES_IN_MS")?,
		code_expires_in_ms: env_u64("AUTH_ENGINE_PASSWORDLESS_CODE_EXPIRES_IN_MS")?,
		max_verification_attempts: env_u32("AUTH_ENGINE_PASSWORDLESS_MAX_VERIFICATION_ATTEMPTS")?,
		session_ttl_seconds: env_u64("AUTH_ENGINE_PASSWORDLESS_SESSION_TTL_SECONDS")?,
		rp_id: env_var("AUTH_ENGINE_PASSWORDLESS_RP_ID"),
		rp_name: env_var("AUTH_ENGINE_PASSWORDLESS_RP_NAME"),
		..Default::default()
	})
}

fn load_anonymous_from_env() -> Result<AnonymousConfigLayer, ConfigError> {
	Ok(AnonymousConfigLayer {
		session_ttl_seconds: env_u64("AUTH_ENGINE_ANONYMOUS_SESSION_TTL_SECONDS")?,
		max_guests_per_fingerprint: env_u32("AUTH_ENGINE_ANONYMOUS_MAX_GUESTS_PER_FINGERPRINT")?,
		max_session_extensions: env_u32("AUTH_ENGINE_ANONYMOUS_MAX_SESSION_EXTENSIONS")?,
		allow_session_extension: env_bool("AUTH_ENGINE_ANONYMOUS_ALLOW_SESSION_EXTENSION"),
		fingerprint_required: env_bool("AUTH_ENGINE_ANONYMOUS_FINGERPRINT_REQUIRED"),
		guest_data_retention_days: env_u32("AUTH_ENGINE_ANONYMOUS_GUEST_DATA_RETENTION_DAYS")?,
		allowed_conversion_plugins: env_list("AUTH_ENGINE_ANONYMOUS_ALLOWED_CONVERSION_PLUGINS"),
		..Default::default()
	})
}

fn load_api_key_from_env() -> Result<ApiKeyConfigLayer, ConfigError> {
	Ok(ApiKeyConfigLayer {
		key_length: env_u8("AUTH_ENGINE_API_KEY_KEY_LENGTH")?,
		key_prefix: env_var("AUTH_ENGINE_API_KEY_KEY_PREFIX"),
		max_keys_per_user: env_u32("AUTH_ENGINE_API_KEY_MAX_KEYS_PER_USER")?,
		default_ttl_days: env_u32("AUTH_ENGINE_API_KEY_DEFAULT_TTL_DAYS")?,
		allowed_scopes: env_list("AUTH_ENGINE_API_KEY_ALLOWED_SCOPES"),
		require_scopes: env_bool("AUTH_ENGINE_API_KEY_REQUIRE_SCOPES"),
		enable_usage_tracking: env_bool("AUTH_ENGINE_API_KEY_ENABLE_USAGE_TRACKING"),
	})
}

/// Federation providers are defined via TOML (or the layer API) only — the
/// env source lets the single-provider common case (`..._0_*`) opt in
/// without a config file, same convention the teacher uses for alert
/// recipients lists.
fn load_oidc_from_env() -> Result<OidcConfigLayer, ConfigError> {
	let mut layer = OidcConfigLayer {
		state_ttl_ms: env_u64("AUTH_ENGINE_OIDC_STATE_TTL_MS")?,
		session_ttl_seconds: env_u64("AUTH_ENGINE_OIDC_SESSION_TTL_SECONDS")?,
		..Default::default()
	};

	if let Some(name) = env_var("AUTH_ENGINE_OIDC_DEFAULT_PROVIDER_NAME") {
		layer.providers.insert(
			name,
			OidcProviderConfigLayer {
				client_id: env_var("AUTH_ENGINE_OIDC_DEFAULT_CLIENT_ID"),
				client_secret: env_var("AUTH_ENGINE_OIDC_DEFAULT_CLIENT_SECRET"),
				authorization_endpoint: env_var("AUTH_ENGINE_OIDC_DEFAULT_AUTHORIZATION_ENDPOINT"),
				token_endpoint: env_var("AUTH_ENGINE_OIDC_DEFAULT_TOKEN_ENDPOINT"),
				redirect_uri: env_var("AUTH_ENGINE_OIDC_DEFAULT_REDIRECT_URI"),
				issuer: env_var("AUTH_ENGINE_OIDC_DEFAULT_ISSUER"),
				scopes: env_list("AUTH_ENGINE_OIDC_DEFAULT_SCOPES"),
			},
		);
	}

	Ok(layer)
}

fn load_saml_from_env() -> Result<SamlConfigLayer, ConfigError> {
	let mut layer = SamlConfigLayer {
		request_ttl_ms: env_u64("AUTH_ENGINE_SAML_REQUEST_TTL_MS")?,
		session_ttl_seconds: env_u64("AUTH_ENGINE_SAML_SESSION_TTL_SECONDS")?,
		..Default::default()
	};

	if let Some(name) = env_var("AUTH_ENGINE_SAML_DEFAULT_PROVIDER_NAME") {
		layer.providers.insert(
			name,
			SamlProviderConfigLayer {
				entity_id: env_var("AUTH_ENGINE_SAML_DEFAULT_ENTITY_ID"),
				acs_url: env_var("AUTH_ENGINE_SAML_DEFAULT_ACS_URL"),
				idp_sso_url: env_var("AUTH_ENGINE_SAML_DEFAULT_IDP_SSO_URL"),
				subject_attribute: env_var("AUTH_ENGINE_SAML_DEFAULT_SUBJECT_ATTRIBUTE"),
			},
		);
	}

	Ok(layer)
}

fn load_webauthn_from_env() -> Result<WebauthnConfigLayer, ConfigError> {
	Ok(WebauthnConfigLayer {
		rp_id: env_var("AUTH_ENGINE_WEBAUTHN_RP_ID"),
		rp_name: env_var("AUTH_ENGINE_WEBAUTHN_RP_NAME"),
		rp_origin: env_var("AUTH_ENGINE_WEBAUTHN_RP_ORIGIN"),
		challenge_ttl_ms: env_u64("AUTH_ENGINE_WEBAUTHN_CHALLENGE_TTL_MS")?,
		max_credentials_per_subject: env_u32("AUTH_ENGINE_WEBAUTHN_MAX_CREDENTIALS_PER_SUBJECT")?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_source_round_trips_to_default_layer() {
		assert_eq!(DefaultsSource.load().unwrap(), EngineConfigLayer::default());
	}

	#[test]
	fn toml_source_with_missing_file_falls_back_to_defaults() {
		let source = TomlSource::new("/nonexistent/path/auth-engine.toml");
		assert_eq!(source.load().unwrap(), EngineConfigLayer::default());
	}

	#[test]
	fn precedence_ordering_is_defaults_lowest_env_highest() {
		assert!(Precedence::Defaults < Precedence::ConfigFile);
		assert!(Precedence::ConfigFile < Precedence::Environment);
	}
}
