// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::API_KEYS_TABLE;
use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, record, DataAccessPort, FindOptions, Predicate, UpdateOptions};
use auth_engine_errors::EngineError;
use chrono::Utc;
use serde_json::json;

/// Flips expired, still-active keys to `is_active = false` rather than
/// deleting them — revocation is a soft delete everywhere in this plugin
/// so the audit trail (`create-api-key`/`revoke-api-key` history) survives.
pub struct ApiKeyCleanup;

#[async_trait::async_trait]
impl CleanupRunner for ApiKeyCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired = orm
			.find_many(
				API_KEYS_TABLE,
				FindOptions::new()
					.where_clause(Predicate::eq("is_active", json!(true)).and(Predicate::lt("expires_at", now)))
					.limit(batch_size),
			)
			.await?;
		if expired.is_empty() {
			return Ok(report);
		}

		let ids: Vec<_> = expired.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
		let affected = orm
			.update_many(
				API_KEYS_TABLE,
				UpdateOptions {
					where_: Some(Predicate::in_("id", ids)),
					set: record([("is_active", json!(false))]),
				},
			)
			.await?;
		report.cleaned += affected;
		report.per_table_counters.insert(API_KEYS_TABLE.to_string(), affected);
		Ok(report)
	}
}
