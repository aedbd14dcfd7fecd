// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::CHALLENGES_TABLE;
use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use auth_engine_errors::EngineError;
use chrono::Utc;
use serde_json::json;

/// Sweeps expired, unconsumed registration/authentication challenges.
pub struct WebauthnCleanup;

#[async_trait::async_trait]
impl CleanupRunner for WebauthnCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired = orm
			.find_many(CHALLENGES_TABLE, FindOptions::new().where_clause(Predicate::lt("expires_at", now)).limit(batch_size))
			.await?;
		if expired.is_empty() {
			return Ok(report);
		}

		let ids: Vec<_> = expired.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
		let removed = orm
			.delete_many(
				CHALLENGES_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
		report.cleaned += removed;
		report.per_table_counters.insert(CHALLENGES_TABLE.to_string(), removed);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use auth_engine_core::data_access::{record, SqliteDataAccessPort};
	use std::sync::Arc;

	#[tokio::test]
	async fn sweeps_expired_challenges_but_leaves_live_ones() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let past = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
		let future = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();

		orm.create(
			CHALLENGES_TABLE,
			record([
				("challenge_hash", json!("expired-hash")),
				("purpose", json!("registration")),
				("subject_id", json!("subj-1")),
				("rp_id", json!("localhost")),
				("expires_at", json!(past)),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();
		orm.create(
			CHALLENGES_TABLE,
			record([
				("challenge_hash", json!("live-hash")),
				("purpose", json!("authentication")),
				("subject_id", json!(Option::<String>::None)),
				("rp_id", json!("localhost")),
				("expires_at", json!(future)),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();

		let report = WebauthnCleanup.run(orm.as_ref(), &PluginConfig::new(), 500).await.unwrap();
		assert_eq!(report.cleaned, 1);

		let remaining = orm.find_many(CHALLENGES_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(field_str(&remaining[0], "challenge_hash").unwrap(), "live-hash");
	}
}
