// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `passwordless` plugin: magic links and destination-based
//! verification codes (`phone`/`email`/`whatsapp`, purposes
//! `login`/`register`/`verify`).
//!
//! Unlike `email-password`/`phone-password`, this plugin has no credential
//! of its own — the identity + code/link IS the credential. It shares the
//! `subjects`/`identities` tables with the password plugins
//! (`auth_engine_plugin_password_common::{SUBJECTS_TABLE, IDENTITIES_TABLE}`)
//! so a destination that was verified through one channel is recognized by
//! the others, but keeps its own ephemeral-artifact tables
//! (`magic_links`, `verification_codes`) since those aren't provider-scoped
//! the way `email_identities`/`phone_identities` are.

mod cleanup;
mod code;
mod magic_link;

pub use code::{CodePurpose, Destination, SendPasswordlessCodeCallback};
pub use magic_link::SendMagicLinkCallback;

use auth_engine_config::PasswordlessConfig;
use auth_engine_core::hasher::{CredentialHasher, NoopPwnedLookup, PwnedLookup};
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PLUGIN_NAME: &str = "passwordless";
pub const MAGIC_LINKS_TABLE: &str = "magic_links";
pub const VERIFICATION_CODES_TABLE: &str = "verification_codes";

struct Shared {
	config: PasswordlessConfig,
	hasher: CredentialHasher,
	send_magic_link: Option<Arc<dyn SendMagicLinkCallback>>,
	send_code: Option<Arc<dyn SendPasswordlessCodeCallback>>,
}

pub struct PasswordlessPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl PasswordlessPlugin {
	/// Constructs the plugin, failing fast if an enabled delivery method has
	/// no corresponding callback configured.
	pub fn new(
		config: PasswordlessConfig,
		send_magic_link: Option<Arc<dyn SendMagicLinkCallback>>,
		send_code: Option<Arc<dyn SendPasswordlessCodeCallback>>,
		pwned_lookup: Option<Arc<dyn PwnedLookup>>,
	) -> Result<Self, EngineError> {
		let mut errors = Vec::new();
		if config.magic_links && send_magic_link.is_none() {
			errors.push("magic_links is enabled but no send_magic_link callback is configured".to_string());
		}
		if config.verification_codes && send_code.is_none() {
			errors.push("verification_codes is enabled but no send_code callback is configured".to_string());
		}
		if !errors.is_empty() {
			return Err(EngineError::Config(errors));
		}

		let hasher = CredentialHasher::new(pwned_lookup.unwrap_or_else(|| Arc::new(NoopPwnedLookup)));
		let shared = Arc::new(Shared {
			config,
			hasher,
			send_magic_link,
			send_code,
		});

		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		if shared.config.magic_links {
			steps.insert("send-magic-link".to_string(), Box::new(magic_link::SendMagicLinkStep(Arc::clone(&shared))));
			steps.insert("verify-magic-link".to_string(), Box::new(magic_link::VerifyMagicLinkStep(Arc::clone(&shared))));
		}
		if shared.config.verification_codes {
			steps.insert("send-code".to_string(), Box::new(code::SendCodeStep(Arc::clone(&shared))));
			steps.insert("verify-code".to_string(), Box::new(code::VerifyCodeStep(Arc::clone(&shared))));
		}

		Ok(Self { shared, steps })
	}
}

#[async_trait::async_trait]
impl Plugin for PasswordlessPlugin {
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
					"passwordless-cleanup",
					PLUGIN_NAME,
					Duration::from_secs(self.shared.config.cleanup.interval_minutes * 60),
					true,
					self.shared.config.cleanup.batch_size as u64,
					Arc::new(cleanup::PasswordlessCleanup),
				)
				.await;
		}
		Ok(())
	}

	async fn get_profile(&self, subject_id: &str, ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		use auth_engine_core::data_access::{FindOptions, Predicate};
		use auth_engine_plugin_password_common::IDENTITIES_TABLE;
		use serde_json::json;

		let identities = ctx
			.orm
			.find_many(IDENTITIES_TABLE, FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id))))
			.await?;
		if identities.is_empty() {
			return Ok(None);
		}
		let mut profile = Map::new();
		profile.insert("id".to_string(), json!(subject_id));
		let destinations: Vec<Value> = identities
			.iter()
			.map(|identity| {
				let mut d = Map::new();
				d.insert("provider".to_string(), identity.get("provider").cloned().unwrap_or(Value::Null));
				d.insert("identifier".to_string(), identity.get("identifier").cloned().unwrap_or(Value::Null));
				d.insert("verified".to_string(), identity.get("verified").cloned().unwrap_or(json!(false)));
				Value::Object(d)
			})
			.collect();
		profile.insert("destinations".to_string(), Value::Array(destinations));
		Ok(Some(profile))
	}
}
