// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Plugin Runtime: plugin/step registration, config validation, and
//! the step execution pipeline.
//!
//! The plugin registry is a `HashMap<String, Box<dyn Plugin>>` built once
//! at `Engine::new` and never mutated afterward, matching the
//! read-only-after-construction shared-state policy for the session
//! resolver registry and the JWKS keyring. Step lookup is a nested
//! `HashMap<String, Box<dyn Step>>` owned by each `Plugin`.

use crate::data_access::DataAccessPort;
use crate::session::SessionService;
use auth_engine_errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A single aggregated configuration problem, collected (not
/// short-circuited) so a misconfigured plugin reports every issue at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
	pub field: String,
	pub reason: String,
}

impl ConfigError {
	pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			reason: reason.into(),
		}
	}
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.field, self.reason)
	}
}

/// Everything a step's `run` needs beyond its typed input: the shared
/// data-access port, the session service, and a handle back to the engine
/// for cross-plugin calls (`anonymous.convert-guest` invokes another
/// plugin's step through this).
pub struct StepContext<'a> {
	pub orm: &'a dyn DataAccessPort,
	pub sessions: &'a SessionService,
	pub engine: &'a crate::engine::Engine,
}

/// The uniform step-output envelope, bit-exact for wire-compatibility:
/// `{success, message, status, token?, subject?, error?, others?}` plus
/// step-specific fields folded into `others`.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
	pub success: bool,
	pub message: String,
	pub status: String,
	pub token: Option<String>,
	pub subject: Option<Map<String, Value>>,
	pub error: Option<Value>,
	pub others: Map<String, Value>,
}

impl StepOutput {
	pub fn ok(status: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			success: true,
			message: message.into(),
			status: status.into(),
			..Default::default()
		}
	}

	pub fn fail(status: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			success: false,
			message: message.into(),
			status: status.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	#[must_use]
	pub fn with_subject(mut self, subject: Map<String, Value>) -> Self {
		self.subject = Some(subject);
		self
	}

	#[must_use]
	pub fn with_error(mut self, error: impl Into<Value>) -> Self {
		self.error = Some(error.into());
		self
	}

	#[must_use]
	pub fn with_other(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.others.insert(key.into(), value.into());
		self
	}
}

/// Advisory HTTP mapping for a step, consumed only by transport adapters —
/// the core never executes HTTP itself.
#[derive(Debug, Clone, Default)]
pub struct HttpProtocol {
	pub method: &'static str,
	/// status code -> status tag, e.g. `200 -> "ok"`, `401 -> "invalid_credentials"`.
	pub codes: HashMap<u16, &'static str>,
}

#[async_trait::async_trait]
pub trait Step: Send + Sync {
	fn name(&self) -> &str;

	/// Recognized input keys, exposed via `Engine::step_inputs` so
	/// transport adapters know which fields to extract from a request.
	fn inputs(&self) -> Vec<&'static str>;

	/// Validates raw input before `run` is invoked. Default accepts
	/// anything; steps with required fields override this.
	fn validate_input(&self, _input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		Ok(())
	}

	/// Validates `run`'s output shape. Invoked only in non-production
	/// builds (a debug assertion on the step author, not a runtime user
	/// guard) — see `Engine::execute_step`.
	fn validate_output(&self, _output: &StepOutput) -> Result<(), String> {
		Ok(())
	}

	fn protocol(&self) -> HttpProtocol {
		HttpProtocol::default()
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError>;
}

pub use auth_engine_errors::FieldViolation;

/// Plugin-level hooks run around every step invocation.
#[async_trait::async_trait]
pub trait RootHooks: Send + Sync {
	async fn before(&self, _step_name: &str, _input: &Map<String, Value>) -> Result<(), EngineError> {
		Ok(())
	}
	async fn after(&self, _step_name: &str, _output: &StepOutput) -> Result<(), EngineError> {
		Ok(())
	}
}

struct NoopHooks;
#[async_trait::async_trait]
impl RootHooks for NoopHooks {}

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
	fn name(&self) -> &str;

	fn steps(&self) -> &HashMap<String, Box<dyn Step>>;

	fn root_hooks(&self) -> &dyn RootHooks {
		&NoopHooks
	}

	/// Called once by `Engine::new`/`EngineBuilder::build`, after the
	/// plugin's own config has already validated successfully — the place
	/// to register this plugin's session resolver and cleanup tasks.
	async fn initialize(&self, _engine: &crate::engine::Engine) -> Result<(), EngineError> {
		Ok(())
	}

	/// Optional profile projection for a subject, used by transport
	/// adapters that expose a "whoami"-shaped endpoint.
	async fn get_profile(
		&self,
		_subject_id: &str,
		_ctx: &StepContext<'_>,
	) -> Result<Option<Map<String, Value>>, EngineError> {
		Ok(None)
	}
}
