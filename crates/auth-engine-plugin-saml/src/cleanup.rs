// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::PENDING_REQUESTS_TABLE;
use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use auth_engine_errors::EngineError;
use chrono::Utc;
use serde_json::json;

/// Sweeps expired, unconsumed `AuthnRequest`s.
pub struct SamlCleanup;

#[async_trait::async_trait]
impl CleanupRunner for SamlCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired = orm
			.find_many(PENDING_REQUESTS_TABLE, FindOptions::new().where_clause(Predicate::lt("expires_at", now)).limit(batch_size))
			.await?;
		if expired.is_empty() {
			return Ok(report);
		}

		let ids: Vec<_> = expired.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
		let removed = orm
			.delete_many(
				PENDING_REQUESTS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
		report.cleaned += removed;
		report.per_table_counters.insert(PENDING_REQUESTS_TABLE.to_string(), removed);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use auth_engine_core::data_access::{record, SqliteDataAccessPort};
	use std::sync::Arc;

	#[tokio::test]
	async fn sweeps_expired_requests_but_leaves_live_ones() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let past = (Utc::now() - chrono::Duration::minutes(15)).to_rfc3339();
		let future = (Utc::now() + chrono::Duration::minutes(15)).to_rfc3339();

		orm.create(
			PENDING_REQUESTS_TABLE,
			record([
				("request_id", json!("_expired")),
				("provider", json!("okta")),
				("relay_state", json!(Option::<String>::None)),
				("expires_at", json!(past)),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();
		orm.create(
			PENDING_REQUESTS_TABLE,
			record([
				("request_id", json!("_live")),
				("provider", json!("okta")),
				("relay_state", json!(Option::<String>::None)),
				("expires_at", json!(future)),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();

		let report = SamlCleanup.run(orm.as_ref(), &PluginConfig::new(), 500).await.unwrap();
		assert_eq!(report.cleaned, 1);

		let remaining = orm.find_many(PENDING_REQUESTS_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(field_str(&remaining[0], "request_id").unwrap(), "_live");
	}
}
