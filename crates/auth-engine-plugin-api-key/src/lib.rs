// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `api-key` plugin: long-lived bearer credentials a subject mints for
//! themselves (CI systems, server-to-server integrations) alongside their
//! normal session. `authenticate-api-key` is the only step that doesn't
//! require an existing session — the key itself is the credential.

mod cleanup;
mod steps;

use auth_engine_config::ApiKeyConfig;
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const PLUGIN_NAME: &str = "api-key";
pub const API_KEYS_TABLE: &str = "api_keys";
pub const API_KEY_USAGE_TABLE: &str = "api_key_usage_log";

struct Shared {
	config: ApiKeyConfig,
}

pub struct ApiKeyPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl ApiKeyPlugin {
	pub fn new(config: ApiKeyConfig) -> Self {
		let shared = Arc::new(Shared { config });
		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("create-api-key".to_string(), Box::new(steps::CreateApiKeyStep(Arc::clone(&shared))));
		steps.insert("list-api-keys".to_string(), Box::new(steps::ListApiKeysStep(Arc::clone(&shared))));
		steps.insert("revoke-api-key".to_string(), Box::new(steps::RevokeApiKeyStep(Arc::clone(&shared))));
		steps.insert("update-api-key".to_string(), Box::new(steps::UpdateApiKeyStep(Arc::clone(&shared))));
		steps.insert("authenticate-api-key".to_string(), Box::new(steps::AuthenticateApiKeyStep(Arc::clone(&shared))));
		Self { shared, steps }
	}
}

#[async_trait::async_trait]
impl Plugin for ApiKeyPlugin {
	fn name(&self) -> &str {
		PLUGIN_NAME
	}

	fn steps(&self) -> &HashMap<String, Box<dyn Step>> {
		&self.steps
	}

	/// Unlike the other plugins, `api-key` has no `cleanup` config section —
	/// a key's `expires_at` is per-key (set at creation from
	/// `default_ttl_days` or an explicit override), not a single global
	/// policy, so the sweep always registers rather than being gated by a
	/// toggle.
	async fn initialize(&self, engine: &auth_engine_core::engine::Engine) -> Result<(), EngineError> {
		engine
			.register_cleanup_task("api-key-cleanup", PLUGIN_NAME, std::time::Duration::from_secs(3600), true, 500, Arc::new(cleanup::ApiKeyCleanup))
			.await;
		Ok(())
	}

	async fn get_profile(&self, subject_id: &str, ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		use auth_engine_core::data_access::{FindOptions, Predicate};
		use serde_json::json;

		let active = ctx
			.orm
			.count(
				API_KEYS_TABLE,
				Some(Predicate::eq("subject_id", json!(subject_id)).and(Predicate::eq("is_active", json!(true)))),
			)
			.await?;
		if active == 0 {
			let any = ctx
				.orm
				.find_first(API_KEYS_TABLE, FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id))))
				.await?;
			if any.is_none() {
				return Ok(None);
			}
		}
		let mut profile = Map::new();
		profile.insert("id".to_string(), json!(subject_id));
		profile.insert("active_api_keys".to_string(), json!(active));
		Ok(Some(profile))
	}
}
