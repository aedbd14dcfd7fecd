// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `email-password` plugin: register, login, verify-email, reset and
//! change password, change email, logout.
//!
//! The state machine itself lives in `auth-engine-plugin-password-common`,
//! parameterized by [`ProviderSpec::EMAIL`]; this crate only wires that
//! machinery to the `Plugin`/`Step` traits, resolves [`EmailPasswordConfig`]
//! into a [`PasswordPolicy`], and registers the cleanup task that sweeps
//! expired verification and reset codes.

mod cleanup;
mod steps;

use auth_engine_config::EmailPasswordConfig;
use auth_engine_core::data_access::{FindOptions, Predicate};
use auth_engine_core::hasher::{CredentialHasher, NoopPwnedLookup, PwnedLookup};
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{PasswordPolicy, ProviderSpec, SendCodeCallback};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PLUGIN_NAME: &str = "email-password";

/// State shared by every step in this plugin, built once at [`EmailPasswordPlugin::new`].
struct Shared {
	config: EmailPasswordConfig,
	hasher: CredentialHasher,
	send_code: Option<Arc<dyn SendCodeCallback>>,
}

impl Shared {
	fn policy(&self) -> PasswordPolicy {
		PasswordPolicy {
			verify_identity: self.config.verify_email,
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

pub struct EmailPasswordPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl EmailPasswordPlugin {
	/// Constructs the plugin, failing fast (aggregated, per the plugin
	/// runtime's config-validation contract) if verification is enabled
	/// without a delivery callback.
	pub fn new(
		config: EmailPasswordConfig,
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
		steps.insert("verify-email".to_string(), Box::new(steps::VerifyEmailStep(Arc::clone(&shared))));
		steps.insert(
			"send-reset-password".to_string(),
			Box::new(steps::SendResetPasswordStep(Arc::clone(&shared))),
		);
		steps.insert("reset-password".to_string(), Box::new(steps::ResetPasswordStep(Arc::clone(&shared))));
		steps.insert("change-password".to_string(), Box::new(steps::ChangePasswordStep(Arc::clone(&shared))));
		steps.insert("change-email".to_string(), Box::new(steps::ChangeEmailStep(Arc::clone(&shared))));
		steps.insert(
			"confirm-change-email".to_string(),
			Box::new(steps::ConfirmChangeEmailStep(Arc::clone(&shared))),
		);
		steps.insert("logout".to_string(), Box::new(steps::LogoutStep));

		Ok(Self { shared, steps })
	}
}

#[async_trait::async_trait]
impl Plugin for EmailPasswordPlugin {
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
					"email-password-cleanup",
					PLUGIN_NAME,
					Duration::from_secs(self.shared.config.cleanup.interval_minutes * 60),
					true,
					self.shared.config.cleanup.batch_size as u64,
					Arc::new(cleanup::EmailPasswordCleanup),
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
					Predicate::eq("provider", json!(ProviderSpec::EMAIL.provider)).and(Predicate::eq("subject_id", json!(subject_id))),
				),
			)
			.await?;
		Ok(identity.map(|identity| {
			let mut profile = Map::new();
			profile.insert("id".to_string(), json!(subject_id));
			profile.insert("email".to_string(), identity.get("identifier").cloned().unwrap_or(Value::Null));
			profile.insert("email_verified".to_string(), identity.get("verified").cloned().unwrap_or(json!(false)));
			profile
		}))
	}
}
