// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `anonymous` plugin: device-fingerprinted guest sessions, bounded
//! extension, and guarded conversion to a permanent subject via another
//! plugin's registration step.
//!
//! Guests live entirely outside the `subjects`/`identities` tables the
//! password and federation plugins share — a guest is only ever a row in
//! `anonymous_subjects` plus `anonymous_sessions`, both owned by this
//! plugin, so cleanup of an abandoned guest never touches permanent data.

mod cleanup;
mod steps;

use auth_engine_config::AnonymousConfig;
use auth_engine_core::plugin::{Plugin, Step, StepContext};
use auth_engine_errors::EngineError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const PLUGIN_NAME: &str = "anonymous";
pub const ANONYMOUS_SUBJECTS_TABLE: &str = "anonymous_subjects";
pub const ANONYMOUS_SESSIONS_TABLE: &str = "anonymous_sessions";

struct Shared {
	config: AnonymousConfig,
}

pub struct AnonymousPlugin {
	shared: Arc<Shared>,
	steps: HashMap<String, Box<dyn Step>>,
}

impl AnonymousPlugin {
	pub fn new(config: AnonymousConfig) -> Self {
		let shared = Arc::new(Shared { config });
		let mut steps: HashMap<String, Box<dyn Step>> = HashMap::new();
		steps.insert("create-guest".to_string(), Box::new(steps::CreateGuestStep(Arc::clone(&shared))));
		steps.insert("extend-guest".to_string(), Box::new(steps::ExtendGuestStep(Arc::clone(&shared))));
		steps.insert("convert-guest".to_string(), Box::new(steps::ConvertGuestStep(Arc::clone(&shared))));
		Self { shared, steps }
	}
}

#[async_trait::async_trait]
impl Plugin for AnonymousPlugin {
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
					"anonymous-cleanup",
					PLUGIN_NAME,
					Duration::from_secs(self.shared.config.cleanup.interval_minutes * 60),
					true,
					self.shared.config.cleanup.batch_size as u64,
					Arc::new(cleanup::AnonymousCleanup),
				)
				.await;
		}
		Ok(())
	}

	async fn get_profile(&self, subject_id: &str, ctx: &StepContext<'_>) -> Result<Option<Map<String, Value>>, EngineError> {
		use auth_engine_core::data_access::{field_str, FindOptions, Predicate};

		let record = ctx
			.orm
			.find_first(ANONYMOUS_SUBJECTS_TABLE, FindOptions::new().where_clause(Predicate::eq("id", json!(subject_id))))
			.await?;
		let Some(record) = record else {
			return Ok(None);
		};
		let mut profile = Map::new();
		profile.insert("id".to_string(), json!(field_str(&record, "id")?));
		profile.insert("kind".to_string(), json!("guest"));
		Ok(Some(profile))
	}
}
