// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Engine Facade: the single surface every transport adapter consumes.
//!
//! `Engine` owns the plugin registry (built once by [`EngineBuilder::build`]
//! and never mutated afterward, matching the read-only-after-construction
//! policy for shared state), the [`SessionService`], the data-access port,
//! and the [`CleanupScheduler`]. The step-execution pipeline in
//! [`Engine::execute_step`] follows the plugin runtime's eight-step
//! contract: plugin lookup, step lookup, `before` hook, input validation,
//! `run`, output validation (debug builds only), `after` hook.

use crate::cleanup::{CleanupReport, CleanupRunner, CleanupScheduler};
use crate::data_access::DataAccessPort;
use crate::plugin::{Plugin, StepContext, StepOutput};
use crate::session::{SessionCheck, SessionResolver, SubjectKind};
use crate::token::TokenCodec;
use auth_engine_errors::EngineError;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

pub struct Engine {
	plugins: HashMap<String, Box<dyn Plugin>>,
	orm: Arc<dyn DataAccessPort>,
	sessions: SessionService,
	cleanup: CleanupScheduler,
}

use crate::session::SessionService;

impl Engine {
	/// Looks up a step, runs the full pipeline (before-hook, input
	/// validation, `run`, output validation, after-hook), and returns its
	/// output envelope. A step that panics is caught here and reported as
	/// `EngineError::Internal` rather than unwinding through the caller —
	/// this is the "guard that translates thrown errors into Internal with
	/// safe messages" the error-handling design calls for.
	#[instrument(skip(self, input), fields(plugin = plugin_name, step = step_name))]
	pub async fn execute_step(
		&self,
		plugin_name: &str,
		step_name: &str,
		input: Map<String, Value>,
	) -> Result<StepOutput, EngineError> {
		let plugin = self
			.plugins
			.get(plugin_name)
			.ok_or_else(|| EngineError::NotFound(format!("unknown plugin `{plugin_name}`")))?;
		let step = plugin
			.steps()
			.get(step_name)
			.ok_or_else(|| EngineError::NotFound(format!("unknown step `{step_name}` on plugin `{plugin_name}`")))?;

		let pipeline = async {
			plugin.root_hooks().before(step_name, &input).await?;
			step.validate_input(&input).map_err(EngineError::Validation)?;

			let ctx = StepContext {
				orm: self.orm.as_ref(),
				sessions: &self.sessions,
				engine: self,
			};
			let output = step.run(input, &ctx).await?;

			// Output-schema validation is a debug assertion on the step
			// author, not a runtime guard a caller should pay for in
			// release builds.
			#[cfg(debug_assertions)]
			if let Err(reason) = step.validate_output(&output) {
				warn!(plugin = plugin_name, step = step_name, reason, "step output failed schema validation");
			}

			plugin.root_hooks().after(step_name, &output).await?;
			Ok(output)
		};

		match AssertUnwindSafe(pipeline).catch_unwind().await {
			Ok(result) => result,
			Err(_panic) => {
				warn!(plugin = plugin_name, step = step_name, "step panicked, translating to Internal");
				Err(EngineError::Internal(format!(
					"step `{plugin_name}.{step_name}` panicked"
				)))
			}
		}
	}

	pub fn orm(&self) -> &dyn DataAccessPort {
		self.orm.as_ref()
	}

	pub fn plugin(&self, name: &str) -> Option<&dyn Plugin> {
		self.plugins.get(name).map(|p| p.as_ref())
	}

	/// Recognized input keys for `plugin.step`, exposed so transport
	/// adapters know which fields to extract from a request.
	pub fn step_inputs(&self, plugin_name: &str, step_name: &str) -> Vec<String> {
		self.plugins
			.get(plugin_name)
			.and_then(|p| p.steps().get(step_name))
			.map(|s| s.inputs().into_iter().map(str::to_string).collect())
			.unwrap_or_default()
	}

	#[instrument(skip(self))]
	pub async fn create_session_for(
		&self,
		kind: SubjectKind,
		subject_id: &str,
		ttl_seconds: u64,
	) -> Result<String, EngineError> {
		self.sessions.create_session_for(kind, subject_id, ttl_seconds).await
	}

	/// Same as [`Self::create_session_for`] but mints a JWT instead of an
	/// opaque bearer token.
	pub async fn create_jwt_session_for(
		&self,
		kind: SubjectKind,
		subject_id: &str,
		ttl_seconds: u64,
	) -> Result<String, EngineError> {
		self.sessions.create_jwt_session_for(kind, subject_id, ttl_seconds).await
	}

	pub async fn check_session(&self, token: &str) -> Result<SessionCheck, EngineError> {
		self.sessions.check_session(token).await
	}

	pub async fn destroy_session(&self, token: &str) -> Result<(), EngineError> {
		self.sessions.destroy_session(token).await
	}

	pub async fn destroy_all_sessions_for(&self, subject_id: &str) -> Result<u64, EngineError> {
		self.sessions.destroy_all_for_subject(subject_id).await
	}

	pub async fn register_session_resolver(
		&self,
		kind: SubjectKind,
		resolver: Arc<dyn SessionResolver>,
	) -> Result<(), EngineError> {
		self.sessions.register_session_resolver(kind, resolver).await
	}

	pub fn cleanup_scheduler(&self) -> &CleanupScheduler {
		&self.cleanup
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn register_cleanup_task(
		&self,
		name: impl Into<String>,
		plugin_name: impl Into<String>,
		interval: Duration,
		enabled: bool,
		batch_size: u64,
		runner: Arc<dyn CleanupRunner>,
	) {
		self.cleanup
			.register_cleanup_task(name, plugin_name, interval, enabled, batch_size, runner)
			.await
	}

	pub async fn run_cleanup_once(&self, task_name: &str) -> Result<CleanupReport, EngineError> {
		self.cleanup.run_once(task_name).await
	}

	/// Starts every registered, enabled cleanup task's timer loop. Expected
	/// to be called once by the host after `build()`.
	pub async fn start_cleanup_scheduler(&self) {
		self.cleanup.start().await
	}

	pub async fn shutdown(&self) {
		self.cleanup.shutdown().await
	}

	/// Optional profile projection for `subject_id`, delegated to the named
	/// plugin's `get_profile` (e.g. a transport adapter's "whoami" route).
	pub async fn get_profile(&self, plugin_name: &str, subject_id: &str) -> Result<Option<Map<String, Value>>, EngineError> {
		let Some(plugin) = self.plugins.get(plugin_name) else {
			return Ok(None);
		};
		let ctx = StepContext {
			orm: self.orm.as_ref(),
			sessions: &self.sessions,
			engine: self,
		};
		plugin.get_profile(subject_id, &ctx).await
	}

	pub fn plugin_names(&self) -> Vec<String> {
		self.plugins.keys().cloned().collect()
	}
}

/// Assembles an [`Engine`]: registers plugins, constructs the shared
/// session service and cleanup scheduler over the supplied data-access
/// port, then runs each plugin's `initialize(&engine)` once the registry is
/// fully built (so a plugin's `initialize` can register its own session
/// resolver and cleanup tasks, and can reach sibling plugins through
/// `engine.plugin(name)` for things like `anonymous.convert-guest`'s
/// cross-plugin dispatch).
pub struct EngineBuilder {
	orm: Arc<dyn DataAccessPort>,
	codec: Arc<TokenCodec>,
	plugins: Vec<Box<dyn Plugin>>,
}

impl EngineBuilder {
	pub fn new(orm: Arc<dyn DataAccessPort>, codec: Arc<TokenCodec>) -> Self {
		Self {
			orm,
			codec,
			plugins: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
		self.plugins.push(plugin);
		self
	}

	pub async fn build(self) -> Result<Engine, EngineError> {
		let mut plugins = HashMap::new();
		for plugin in self.plugins {
			if plugins.contains_key(plugin.name()) {
				return Err(EngineError::Config(vec![format!(
					"duplicate plugin name `{}`",
					plugin.name()
				)]));
			}
			plugins.insert(plugin.name().to_string(), plugin);
		}

		let engine = Engine {
			plugins,
			orm: Arc::clone(&self.orm),
			sessions: SessionService::new(Arc::clone(&self.orm), Arc::clone(&self.codec)),
			cleanup: CleanupScheduler::new(Arc::clone(&self.orm)),
		};

		for plugin in engine.plugins.values() {
			plugin.initialize(&engine).await?;
		}

		Ok(engine)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data_access::SqliteDataAccessPort;
	use crate::plugin::HttpProtocol;
	use async_trait::async_trait;
	use std::collections::HashMap as StdHashMap;

	struct EchoStep;
	#[async_trait]
	impl crate::plugin::Step for EchoStep {
		fn name(&self) -> &str {
			"echo"
		}
		fn inputs(&self) -> Vec<&'static str> {
			vec!["value"]
		}
		fn protocol(&self) -> HttpProtocol {
			HttpProtocol::default()
		}
		async fn run(&self, input: Map<String, Value>, _ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
			Ok(StepOutput::ok("ok", "echoed").with_other("value", input.get("value").cloned().unwrap_or(Value::Null)))
		}
	}

	struct PanickingStep;
	#[async_trait]
	impl crate::plugin::Step for PanickingStep {
		fn name(&self) -> &str {
			"boom"
		}
		fn inputs(&self) -> Vec<&'static str> {
			vec![]
		}
		async fn run(&self, _input: Map<String, Value>, _ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
			panic!("simulated step bug");
		}
	}

	struct TestPlugin {
		steps: StdHashMap<String, Box<dyn crate::plugin::Step>>,
	}

	#[async_trait]
	impl Plugin for TestPlugin {
		fn name(&self) -> &str {
			"test-plugin"
		}
		fn steps(&self) -> &StdHashMap<String, Box<dyn crate::plugin::Step>> {
			&self.steps
		}
	}

	async fn builder() -> EngineBuilder {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		EngineBuilder::new(orm, codec)
	}

	fn test_plugin() -> Box<dyn Plugin> {
		let mut steps: StdHashMap<String, Box<dyn crate::plugin::Step>> = StdHashMap::new();
		steps.insert("echo".to_string(), Box::new(EchoStep));
		steps.insert("boom".to_string(), Box::new(PanickingStep));
		Box::new(TestPlugin { steps })
	}

	#[tokio::test]
	async fn unknown_plugin_is_not_found() {
		let engine = builder().await.build().await.unwrap();
		let result = engine.execute_step("does-not-exist", "x", Map::new()).await;
		assert!(matches!(result, Err(EngineError::NotFound(_))));
	}

	#[tokio::test]
	async fn unknown_step_is_not_found() {
		let engine = builder().await.with_plugin(test_plugin()).build().await.unwrap();
		let result = engine.execute_step("test-plugin", "does-not-exist", Map::new()).await;
		assert!(matches!(result, Err(EngineError::NotFound(_))));
	}

	#[tokio::test]
	async fn execute_step_runs_and_returns_output() {
		let engine = builder().await.with_plugin(test_plugin()).build().await.unwrap();
		let mut input = Map::new();
		input.insert("value".to_string(), Value::String("hi".to_string()));
		let output = engine.execute_step("test-plugin", "echo", input).await.unwrap();
		assert!(output.success);
		assert_eq!(output.others.get("value").unwrap(), "hi");
	}

	#[tokio::test]
	async fn a_panicking_step_is_reported_as_internal_not_a_crash() {
		let engine = builder().await.with_plugin(test_plugin()).build().await.unwrap();
		let result = engine.execute_step("test-plugin", "boom", Map::new()).await;
		assert!(matches!(result, Err(EngineError::Internal(_))));
	}

	#[tokio::test]
	async fn step_inputs_reports_the_step_declared_keys() {
		let engine = builder().await.with_plugin(test_plugin()).build().await.unwrap();
		assert_eq!(engine.step_inputs("test-plugin", "echo"), vec!["value".to_string()]);
	}

	#[tokio::test]
	async fn duplicate_plugin_names_fail_construction() {
		let result = builder().await.with_plugin(test_plugin()).with_plugin(test_plugin()).build().await;
		assert!(matches!(result, Err(EngineError::Config(_))));
	}

	#[tokio::test]
	async fn create_and_check_session_round_trips_through_the_facade() {
		struct FixedResolver;
		#[async_trait]
		impl SessionResolver for FixedResolver {
			async fn get_by_id(&self, id: &str) -> Result<Option<crate::session::Subject>, EngineError> {
				Ok(Some(crate::session::Subject {
					id: id.to_string(),
					fields: StdHashMap::new(),
				}))
			}
			fn sanitize(&self, subject: &crate::session::Subject) -> crate::session::PublicSubject {
				let mut map = StdHashMap::new();
				map.insert("id".to_string(), Value::String(subject.id.clone()));
				map
			}
		}

		let engine = builder().await.build().await.unwrap();
		engine
			.register_session_resolver(SubjectKind::subject(), Arc::new(FixedResolver))
			.await
			.unwrap();
		let token = engine.create_session_for(SubjectKind::subject(), "sub-1", 3600).await.unwrap();
		let check = engine.check_session(&token).await.unwrap();
		assert!(check.valid);
	}
}
