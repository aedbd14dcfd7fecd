// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `oidc` plugin: authorization-code login with PKCE against one or more
//! named OIDC providers. All outbound network calls (the token exchange)
//! are expressed through the injected [`ExchangeCodeCallback`] — this
//! crate only generates/validates the protocol artifacts (state, PKCE
//! pair, nonce, claim checks) and resolves the federated identity.
//!
//! Resolved subjects live in the same `subjects`/`identities` tables the
//! password plugins use, keyed `(provider = "oidc:<provider name>",
//! identifier = sub)` so a federated login and a local login never collide
//! even if a deployment reuses a provider name.

mod callback;
mod cleanup;
mod steps;

pub use callback::{ExchangeCodeCallback, OidcTokenResponse};

use auth_engine_config::OidcConfig;
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const PLUGIN_NAME: &str = "oidc";
pub const PENDING_REQUESTS_TABLE: &str = "oidc_pending_requests";

fn provider_tag(provider_name: &str) -> String {
	format!("oidc:{provider_name}")
}

struct Shared {
	config: OidcConfig,
	exchange_code: Arc<dyn ExchangeCodeCallback>,
}

pub struct OidcPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl OidcPlugin {
	pub fn new(config: OidcConfig, exchange_code: Arc<dyn ExchangeCodeCallback>) -> Self {
		let shared = Arc::new(Shared { config, exchange_code });
		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("begin-authorization".to_string(), Box::new(steps::BeginAuthorizationStep(Arc::clone(&shared))));
		steps.insert("callback".to_string(), Box::new(steps::CallbackStep(Arc::clone(&shared))));
		Self { shared, steps }
	}
}

#[async_trait::async_trait]
impl Plugin for OidcPlugin {
	fn name(&self) -> &str {
		PLUGIN_NAME
	}

	fn steps(&self) -> &HashMap<String, Box<dyn Step>> {
		&self.steps
	}

	/// No `cleanup` config section exists for federation (mirrors `api-key`):
	/// sweeping expired, unconsumed authorization requests is an unconditional
	/// hygiene task, not a deployment-tunable policy.
	async fn initialize(&self, engine: &auth_engine_core::engine::Engine) -> Result<(), EngineError> {
		engine
			.register_cleanup_task("oidc-cleanup", PLUGIN_NAME, std::time::Duration::from_secs(600), true, 500, Arc::new(cleanup::OidcCleanup))
			.await;
		Ok(())
	}

	async fn get_profile(&self, subject_id: &str, ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		use auth_engine_core::data_access::{FindOptions, Predicate};
		use auth_engine_plugin_password_common::IDENTITIES_TABLE;
		use serde_json::json;

		let identities = ctx
			.orm
			.find_many(
				IDENTITIES_TABLE,
				FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id)).and(Predicate::like("provider", "oidc:%".to_string()))),
			)
			.await?;
		if identities.is_empty() {
			return Ok(None);
		}
		let mut profile = Map::new();
		profile.insert("id".to_string(), json!(subject_id));
		let providers: Vec<Value> = identities.iter().map(|identity| identity.get("provider").cloned().unwrap_or(Value::Null)).collect();
		profile.insert("providers".to_string(), Value::Array(providers));
		Ok(Some(profile))
	}
}
