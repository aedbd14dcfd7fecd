// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `phone-password` plugin: register, login, verify-phone, reset and
//! change password, change phone, logout.
//!
//! Mirrors `auth-engine-plugin-email-password` exactly: the state machine
//! lives in `auth-engine-plugin-password-common`, parameterized by
//! [`ProviderSpec::PHONE`]; this crate wires that machinery to the
//! `Plugin`/`Step` traits, adds E.164 validation in front of the shared
//! register/change flows, and registers the cleanup task that sweeps
//! expired verification and reset codes.

mod cleanup;
mod steps;

use auth_engine_config::PhonePasswordConfig;
use auth_engine_core::data_access::{FindOptions, Predicate};
use auth_engine_core::hasher::{CredentialHasher, NoopPwnedLookup, PwnedLookup};
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{PasswordPolicy, ProviderSpec, SendCodeCallback};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PLUGIN_NAME: &str = "phone-password";

/// Rejects anything that isn't a plausible E.164 number: a leading `+`
/// followed by 8-15 digits. No normalization is attempted here — callers
/// are expected to send an already-normalized number when `require_e164`
/// is enabled.
pub(crate) fn is_e164(value: &str) -> bool {
	let Some(digits) = value.strip_prefix('+') else {
		return false;
	};
	(8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// State shared by every step in this plugin, built once at [`PhonePasswordPlugin::new`].
struct Shared {
	config: PhonePasswordConfig,
	hasher: CredentialHasher,
	send_code: Option<Arc<dyn SendCodeCallback>>,
}

impl Shared {
	fn policy(&self) -> PasswordPolicy {
		PasswordPolicy {
			verify_identity: self.config.verify_phone,
			login_on_register: self.config.login_on_register,
			session_ttl_seconds: self.config.session_ttl_seconds,
			code_length: self.config.code_length,
			verification_code_expires_in_ms: self.config.verification_code_expires_in_ms,
			reset_password_code_expires_in_ms: self.config.reset_password_code_expires_in_ms,
			max_verification_attempts: self.config.max_verification_attempts,
		}
	}

	fn test_user_fixtures(&self) -> Vec<auth_engine_plugin_password_common::TestUserFixture<'_>> {
		self.config
			.test_users
			.users
			.iter()
			.map(|u| auth_engine_plugin_password_common::TestUserFixture {
				identifier: &u.email,
				password: &u.password,
			})
			.collect()
	}
}

pub struct PhonePasswordPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl PhonePasswordPlugin {
	/// Constructs the plugin, failing fast if phone verification is enabled
	/// without a delivery callback.
	pub fn new(
		config: PhonePasswordConfig,
		send_code: Option<Arc<dyn SendCodeCallback>>,
		pwned_lookup: Option<Arc<dyn PwnedLookup>>,
	) -> Result<Self, EngineError> {
		let mut errors = Vec::new();
		if send_code.is_none() {
			errors.push("no send_code callback is configured (required to deliver verification and password-reset codes)".to_string());
		}
		if !errors.is_empty() {
			return Err(EngineError::Config(errors));
		}

		let hasher = CredentialHasher::new(pwned_lookup.unwrap_or_else(|| Arc::new(NoopPwnedLookup)));
		let shared = Arc::new(Shared { config, hasher, send_code });

		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("register".to_string(), Box::new(steps::RegisterStep(Arc::clone(&shared))));
		steps.insert("login".to_string(), Box::new(steps::LoginStep(Arc::clone(&shared))));
		steps.insert("verify-phone".to_string(), Box::new(steps::VerifyPhoneStep(Arc::clone(&shared))));
		steps.insert(
			"send-reset-password".to_string(),
			Box::new(steps::SendResetPasswordStep(Arc::clone(&shared))),
		);
		steps.insert("reset-password".to_string(), Box::new(steps::ResetPasswordStep(Arc::clone(&shared))));
		steps.insert("change-password".to_string(), Box::new(steps::ChangePasswordStep(Arc::clone(&shared))));
		steps.insert("change-phone".to_string(), Box::new(steps::ChangePhoneStep(Arc::clone(&shared))));
		steps.insert(
			"confirm-change-phone".to_string(),
			Box::new(steps::ConfirmChangePhoneStep(Arc::clone(&shared))),
		);
		steps.insert("logout".to_string(), Box::new(steps::LogoutStep));

		Ok(Self { shared, steps })
	}
}

#[async_trait::async_trait]
impl Plugin for PhonePasswordPlugin {
	fn name(&self) -> &str {
		PLUGIN_NAME
	}

	fn steps(&self) -> &HashMap<String, Box<dyn Step>> {
		&self.steps
	}

	async fn initialize(&self, engine: &auth_engine_core::engine::Engine) -> Result<(), EngineError> {
		if self.shared.config.cleanup.enabled {
			engine
				.register_cleanup_task(
					"phone-password-cleanup",
					PLUGIN_NAME,
					Duration::from_secs(self.shared.config.cleanup.interval_minutes * 60),
					true,
					self.shared.config.cleanup.batch_size as u64,
					Arc::new(cleanup::PhonePasswordCleanup),
				)
				.await;
		}
		Ok(())
	}

	async fn get_profile(&self, subject_id: &str, ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		let identity = ctx
			.orm
			.find_first(
				auth_engine_plugin_password_common::IDENTITIES_TABLE,
				FindOptions::new().where_clause(
					Predicate::eq("provider", json!(ProviderSpec::PHONE.provider)).and(Predicate::eq("subject_id", json!(subject_id))),
				),
			)
			.await?;
		Ok(identity.map(|identity| {
			let mut profile = Map::new();
			profile.insert("id".to_string(), json!(subject_id));
			profile.insert("phone".to_string(), identity.get("identifier").cloned().unwrap_or(Value::Null));
			profile.insert("phone_verified".to_string(), identity.get("verified").cloned().unwrap_or(json!(false)));
			profile
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn e164_accepts_plausible_numbers_and_rejects_others() {
		assert!(is_e164("+14155551234"));
		assert!(!is_e164("4155551234"));
		assert!(!is_e164("+1415"));
		assert!(!is_e164("+1-415-555-1234"));
	}
}
