// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The top-level unresolved configuration layer: one optional section per
//! plugin, merged across sources before any section is finalized.

use serde::{Deserialize, Serialize};

use crate::sections::{
	AnonymousConfigLayer, ApiKeyConfigLayer, EmailPasswordConfigLayer, Environment, JwksConfigLayer,
	OidcConfigLayer, PasswordlessConfigLayer, PhonePasswordConfigLayer, SamlConfigLayer, WebauthnConfigLayer,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfigLayer {
	pub environment: Option<Environment>,
	#[serde(default)]
	pub jwks: JwksConfigLayer,
	#[serde(default)]
	pub email_password: EmailPasswordConfigLayer,
	#[serde(default)]
	pub phone_password: PhonePasswordConfigLayer,
	#[serde(default)]
	pub passwordless: PasswordlessConfigLayer,
	#[serde(default)]
	pub anonymous: AnonymousConfigLayer,
	#[serde(default)]
	pub api_key: ApiKeyConfigLayer,
	#[serde(default)]
	pub oidc: OidcConfigLayer,
	#[serde(default)]
	pub saml: SamlConfigLayer,
	#[serde(default)]
	pub webauthn: WebauthnConfigLayer,
}

impl EngineConfigLayer {
	/// Apply `other` on top of `self`, field by field: a `Some` in `other`
	/// always wins, a `None` leaves whatever `self` already had.
	pub fn merge(&mut self, other: Self) {
		if other.environment.is_some() {
			self.environment = other.environment;
		}
		self.jwks.merge(other.jwks);
		self.email_password.merge(other.email_password);
		self.phone_password.merge(other.phone_password);
		self.passwordless.merge(other.passwordless);
		self.anonymous.merge(other.anonymous);
		self.api_key.merge(other.api_key);
		self.oidc.merge(other.oidc);
		self.saml.merge(other.saml);
		self.webauthn.merge(other.webauthn);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_only_overwrites_fields_present_in_the_overlay() {
		let mut base = EngineConfigLayer {
			environment: Some(Environment::Development),
			..Default::default()
		};
		base.email_password.verify_email = Some(false);

		let mut overlay = EngineConfigLayer::default();
		overlay.email_password.verify_email = Some(true);

		base.merge(overlay);
		assert_eq!(base.environment, Some(Environment::Development));
		assert_eq!(base.email_password.verify_email, Some(true));
	}
}
