// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `webauthn` plugin: scaffolding only. Challenge issuance and
//! single-use consumption are real and share the same ephemeral-artifact
//! machinery as magic links and verification codes, but attestation and
//! assertion **cryptographic verification** are deliberately not
//! implemented — `finish-registration`/`finish-authentication` consume
//! their challenge and then return `status: "not_implemented"` rather than
//! accept an unverified credential. Wiring up a real Level 2 verifier is
//! future work, not something this crate fakes.

mod cleanup;
mod steps;

use auth_engine_config::WebauthnConfig;
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const PLUGIN_NAME: &str = "webauthn";
pub const CHALLENGES_TABLE: &str = "webauthn_challenges";

struct Shared {
	config: WebauthnConfig,
}

pub struct WebauthnPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl WebauthnPlugin {
	pub fn new(config: WebauthnConfig) -> Self {
		let shared = Arc::new(Shared { config });
		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("begin-registration".to_string(), Box::new(steps::BeginRegistrationStep(Arc::clone(&shared))));
		steps.insert("finish-registration".to_string(), Box::new(steps::FinishRegistrationStep(Arc::clone(&shared))));
		steps.insert("begin-authentication".to_string(), Box::new(steps::BeginAuthenticationStep(Arc::clone(&shared))));
		steps.insert("finish-authentication".to_string(), Box::new(steps::FinishAuthenticationStep(Arc::clone(&shared))));
		Self { shared, steps }
	}
}

#[async_trait::async_trait]
impl Plugin for WebauthnPlugin {
	fn name(&self) -> &str {
		PLUGIN_NAME
	}

	fn steps(&self) -> &HashMap<String, Box<dyn Step>> {
		&self.steps
	}

	/// No `cleanup` config section exists here either (mirrors `oidc`/`saml`):
	/// sweeping expired, unconsumed challenges is unconditional.
	async fn initialize(&self, engine: &auth_engine_core::engine::Engine) -> Result<(), EngineError> {
		engine
			.register_cleanup_task("webauthn-cleanup", PLUGIN_NAME, std::time::Duration::from_secs(300), true, 500, Arc::new(cleanup::WebauthnCleanup))
			.await;
		Ok(())
	}

	/// No credentials are ever actually persisted (registration is never
	/// completed), so there is nothing to report a profile for.
	async fn get_profile(&self, _subject_id: &str, _ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		Ok(None)
	}
}
