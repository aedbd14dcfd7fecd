// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `saml` plugin: SP-initiated SAML 2.0 login against one or more named
//! IdPs. `AuthnRequest` signing and assertion signature verification are
//! both expressed as injected callbacks — this crate only issues/tracks the
//! single-use request artifact and resolves the federated identity out of
//! the validated assertion's attributes.
//!
//! Resolved subjects live in the same `subjects`/`identities` tables the
//! password plugins use, keyed `(provider = "saml:<provider name>",
//! identifier = <subject attribute value>)`.

mod callback;
mod cleanup;
mod steps;

pub use callback::{BuildAuthnRequestCallback, SamlAssertion, SamlAuthnRequest, ValidateAssertionCallback};

use auth_engine_config::SamlConfig;
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const PLUGIN_NAME: &str = "saml";
pub const PENDING_REQUESTS_TABLE: &str = "saml_pending_requests";

fn provider_tag(provider_name: &str) -> String {
	format!("saml:{provider_name}")
}

struct Shared {
	config: SamlConfig,
	build_authn_request: Arc<dyn BuildAuthnRequestCallback>,
	validate_assertion: Arc<dyn ValidateAssertionCallback>,
}

pub struct SamlPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl SamlPlugin {
	pub fn new(config: SamlConfig, build_authn_request: Arc<dyn BuildAuthnRequestCallback>, validate_assertion: Arc<dyn ValidateAssertionCallback>) -> Self {
		let shared = Arc::new(Shared {
			config,
			build_authn_request,
			validate_assertion,
		});
		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("begin-login".to_string(), Box::new(steps::BeginLoginStep(Arc::clone(&shared))));
		steps.insert("acs".to_string(), Box::new(steps::AcsStep(Arc::clone(&shared))));
		Self { shared, steps }
	}
}

#[async_trait::async_trait]
impl Plugin for SamlPlugin {
	fn name(&self) -> &str {
		PLUGIN_NAME
	}

	fn steps(&self) -> &HashMap<String, Box<dyn Step>> {
		&self.steps
	}

	/// No `cleanup` config section exists for federation (mirrors `oidc`):
	/// sweeping expired, unconsumed `AuthnRequest`s is unconditional.
	async fn initialize(&self, engine: &auth_engine_core::engine::Engine) -> Result<(), EngineError> {
		engine
			.register_cleanup_task("saml-cleanup", PLUGIN_NAME, std::time::Duration::from_secs(600), true, 500, Arc::new(cleanup::SamlCleanup))
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
				FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id)).and(Predicate::like("provider", "saml:%".to_string()))),
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
