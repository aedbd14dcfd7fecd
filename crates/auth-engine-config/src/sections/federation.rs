// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `oidc` and `saml` federation plugin configuration. Both plugins support
//! multiple named providers (e.g. two OIDC tenants) keyed by provider name,
//! since the identity a federation login resolves is always keyed
//! `(provider=<provider name>, identifier=sub)`.

use auth_engine_secret::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OidcProviderConfigLayer {
	pub client_id: Option<String>,
	pub client_secret: Option<String>,
	pub authorization_endpoint: Option<String>,
	pub token_endpoint: Option<String>,
	pub redirect_uri: Option<String>,
	pub issuer: Option<String>,
	pub scopes: Option<Vec<String>>,
}

impl OidcProviderConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.client_id.is_some() {
			self.client_id = other.client_id;
		}
		if other.client_secret.is_some() {
			self.client_secret = other.client_secret;
		}
		if other.authorization_endpoint.is_some() {
			self.authorization_endpoint = other.authorization_endpoint;
		}
		if other.token_endpoint.is_some() {
			self.token_endpoint = other.token_endpoint;
		}
		if other.redirect_uri.is_some() {
			self.redirect_uri = other.redirect_uri;
		}
		if other.issuer.is_some() {
			self.issuer = other.issuer;
		}
		if other.scopes.is_some() {
			self.scopes = other.scopes;
		}
	}

	fn finalize(self, provider_name: &str) -> Result<OidcProviderConfig, Vec<String>> {
		let mut errors = Vec::new();
		let require = |field: Option<String>, name: &str, errors: &mut Vec<String>| -> String {
			field.unwrap_or_else(|| {
				errors.push(format!("oidc provider `{provider_name}`: missing required field `{name}`"));
				String::new()
			})
		};

		let client_id = require(self.client_id, "client_id", &mut errors);
		let authorization_endpoint = require(self.authorization_endpoint, "authorization_endpoint", &mut errors);
		let token_endpoint = require(self.token_endpoint, "token_endpoint", &mut errors);
		let redirect_uri = require(self.redirect_uri, "redirect_uri", &mut errors);
		let issuer = require(self.issuer, "issuer", &mut errors);

		if errors.is_empty() {
			Ok(OidcProviderConfig {
				client_id,
				client_secret: self.client_secret.map(SecretString::from),
				authorization_endpoint,
				token_endpoint,
				redirect_uri,
				issuer,
				scopes: self.scopes.unwrap_or_else(|| vec!["openid".to_string()]),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone)]
pub struct OidcProviderConfig {
	pub client_id: String,
	pub client_secret: Option<SecretString>,
	pub authorization_endpoint: String,
	pub token_endpoint: String,
	pub redirect_uri: String,
	pub issuer: String,
	pub scopes: Vec<String>,
}

impl PartialEq for OidcProviderConfig {
	fn eq(&self, other: &Self) -> bool {
		self.client_id == other.client_id
			&& self.authorization_endpoint == other.authorization_endpoint
			&& self.token_endpoint == other.token_endpoint
			&& self.redirect_uri == other.redirect_uri
			&& self.issuer == other.issuer
			&& self.scopes == other.scopes
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OidcConfigLayer {
	pub state_ttl_ms: Option<u64>,
	pub session_ttl_seconds: Option<u64>,
	#[serde(default)]
	pub providers: HashMap<String, OidcProviderConfigLayer>,
}

impl OidcConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.state_ttl_ms.is_some() {
			self.state_ttl_ms = other.state_ttl_ms;
		}
		if other.session_ttl_seconds.is_some() {
			self.session_ttl_seconds = other.session_ttl_seconds;
		}
		for (name, layer) in other.providers {
			self.providers.entry(name).or_default().merge(layer);
		}
	}

	pub fn finalize(self) -> Result<OidcConfig, Vec<String>> {
		let mut errors = Vec::new();
		let mut providers = HashMap::new();
		for (name, layer) in self.providers {
			match layer.finalize(&name) {
				Ok(provider) => {
					providers.insert(name, provider);
				}
				Err(provider_errors) => errors.extend(provider_errors),
			}
		}

		let state_ttl_ms = self.state_ttl_ms.unwrap_or(10 * 60 * 1000);
		if state_ttl_ms > 24 * 3600 * 1000 {
			errors.push(format!("state_ttl_ms must be <= {}, got {state_ttl_ms}", 24 * 3600 * 1000));
		}

		if errors.is_empty() {
			Ok(OidcConfig {
				state_ttl_ms,
				session_ttl_seconds: self.session_ttl_seconds.unwrap_or(30 * 24 * 3600),
				providers,
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct OidcConfig {
	pub state_ttl_ms: u64,
	pub session_ttl_seconds: u64,
	pub providers: HashMap<String, OidcProviderConfig>,
}

impl Default for OidcConfig {
	fn default() -> Self {
		OidcConfigLayer::default()
			.finalize()
			.expect("empty provider map always finalizes")
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamlProviderConfigLayer {
	pub entity_id: Option<String>,
	pub acs_url: Option<String>,
	pub idp_sso_url: Option<String>,
	/// The SAML attribute (or `NameID`) the subject's external identifier is
	/// read from.
	pub subject_attribute: Option<String>,
}

impl SamlProviderConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.entity_id.is_some() {
			self.entity_id = other.entity_id;
		}
		if other.acs_url.is_some() {
			self.acs_url = other.acs_url;
		}
		if other.idp_sso_url.is_some() {
			self.idp_sso_url = other.idp_sso_url;
		}
		if other.subject_attribute.is_some() {
			self.subject_attribute = other.subject_attribute;
		}
	}

	fn finalize(self, provider_name: &str) -> Result<SamlProviderConfig, Vec<String>> {
		let mut errors = Vec::new();
		let require = |field: Option<String>, name: &str, errors: &mut Vec<String>| -> String {
			field.unwrap_or_else(|| {
				errors.push(format!("saml provider `{provider_name}`: missing required field `{name}`"));
				String::new()
			})
		};

		let entity_id = require(self.entity_id, "entity_id", &mut errors);
		let acs_url = require(self.acs_url, "acs_url", &mut errors);
		let idp_sso_url = require(self.idp_sso_url, "idp_sso_url", &mut errors);

		if errors.is_empty() {
			Ok(SamlProviderConfig {
				entity_id,
				acs_url,
				idp_sso_url,
				subject_attribute: self.subject_attribute.unwrap_or_else(|| "NameID".to_string()),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamlProviderConfig {
	pub entity_id: String,
	pub acs_url: String,
	pub idp_sso_url: String,
	pub subject_attribute: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamlConfigLayer {
	pub request_ttl_ms: Option<u64>,
	pub session_ttl_seconds: Option<u64>,
	#[serde(default)]
	pub providers: HashMap<String, SamlProviderConfigLayer>,
}

impl SamlConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.request_ttl_ms.is_some() {
			self.request_ttl_ms = other.request_ttl_ms;
		}
		if other.session_ttl_seconds.is_some() {
			self.session_ttl_seconds = other.session_ttl_seconds;
		}
		for (name, layer) in other.providers {
			self.providers.entry(name).or_default().merge(layer);
		}
	}

	pub fn finalize(self) -> Result<SamlConfig, Vec<String>> {
		let mut errors = Vec::new();
		let mut providers = HashMap::new();
		for (name, layer) in self.providers {
			match layer.finalize(&name) {
				Ok(provider) => {
					providers.insert(name, provider);
				}
				Err(provider_errors) => errors.extend(provider_errors),
			}
		}

		let request_ttl_ms = self.request_ttl_ms.unwrap_or(10 * 60 * 1000);
		if request_ttl_ms > 24 * 3600 * 1000 {
			errors.push(format!("request_ttl_ms must be <= {}, got {request_ttl_ms}", 24 * 3600 * 1000));
		}

		if errors.is_empty() {
			Ok(SamlConfig {
				request_ttl_ms,
				session_ttl_seconds: self.session_ttl_seconds.unwrap_or(30 * 24 * 3600),
				providers,
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamlConfig {
	pub request_ttl_ms: u64,
	pub session_ttl_seconds: u64,
	pub providers: HashMap<String, SamlProviderConfig>,
}

impl Default for SamlConfig {
	fn default() -> Self {
		SamlConfigLayer::default()
			.finalize()
			.expect("empty provider map always finalizes")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn oidc_provider_missing_client_id_is_rejected() {
		let mut providers = HashMap::new();
		providers.insert(
			"google".to_string(),
			OidcProviderConfigLayer {
				authorization_endpoint: Some("https://accounts.google.com/o/oauth2/auth".to_string()),
				token_endpoint: Some("https://oauth2.googleapis.com/token".to_string()),
				redirect_uri: Some("https://app.example.com/callback".to_string()),
				issuer: Some("https://accounts.google.com".to_string()),
				..Default::default()
			},
		);
		let layer = OidcConfigLayer {
			providers,
			..Default::default()
		};
		let errors = layer.finalize().unwrap_err();
		assert!(errors.iter().any(|e| e.contains("client_id")));
	}

	#[test]
	fn saml_provider_with_all_fields_finalizes() {
		let mut providers = HashMap::new();
		providers.insert(
			"okta".to_string(),
			SamlProviderConfigLayer {
				entity_id: Some("urn:auth-engine".to_string()),
				acs_url: Some("https://app.example.com/saml/acs".to_string()),
				idp_sso_url: Some("https://idp.okta.com/sso".to_string()),
				subject_attribute: None,
			},
		);
		let config = SamlConfigLayer {
			providers,
			..Default::default()
		}
		.finalize()
		.unwrap();
		assert_eq!(config.providers["okta"].subject_attribute, "NameID");
	}

	#[test]
	fn empty_provider_maps_default_cleanly() {
		assert!(OidcConfig::default().providers.is_empty());
		assert!(SamlConfig::default().providers.is_empty());
	}
}
