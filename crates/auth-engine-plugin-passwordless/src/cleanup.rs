// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{MAGIC_LINKS_TABLE, VERIFICATION_CODES_TABLE};
use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use auth_engine_errors::EngineError;
use chrono::Utc;
use serde_json::json;

/// Sweeps expired magic links and verification codes, bounded by
/// `batch_size` per table per tick.
pub struct PasswordlessCleanup;

#[async_trait::async_trait]
impl CleanupRunner for PasswordlessCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired_links = orm
			.find_many(MAGIC_LINKS_TABLE, FindOptions::new().where_clause(Predicate::lt("expires_at", now.clone())).limit(batch_size))
			.await?;
		if !expired_links.is_empty() {
			let ids: Vec<_> = expired_links.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
			let cleaned = ids.len() as u64;
			orm.delete_many(
				MAGIC_LINKS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
			report.cleaned += cleaned;
			report.per_table_counters.insert(MAGIC_LINKS_TABLE.to_string(), cleaned);
		}

		let expired_codes = orm
			.find_many(VERIFICATION_CODES_TABLE, FindOptions::new().where_clause(Predicate::lt("expires_at", now)).limit(batch_size))
			.await?;
		if !expired_codes.is_empty() {
			let ids: Vec<_> = expired_codes.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
			let cleaned = ids.len() as u64;
			orm.delete_many(
				VERIFICATION_CODES_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
			report.cleaned += cleaned;
			report.per_table_counters.insert(VERIFICATION_CODES_TABLE.to_string(), cleaned);
		}

		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use auth_engine_core::data_access::{record, SqliteDataAccessPort};
	use std::sync::Arc;

	#[tokio::test]
	async fn sweeps_expired_magic_links_and_codes_but_leaves_unexpired_ones() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let past = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
		let future = (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();

		orm.create(
			MAGIC_LINKS_TABLE,
			record([
				("subject_id", json!("subj-1")),
				("token_hash", json!("h1")),
				("identifier", json!("a@x.com")),
				("expires_at", json!(past.clone())),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();
		orm.create(
			MAGIC_LINKS_TABLE,
			record([
				("subject_id", json!("subj-2")),
				("token_hash", json!("h2")),
				("identifier", json!("b@x.com")),
				("expires_at", json!(future.clone())),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await
		.unwrap();
		orm.create(
			VERIFICATION_CODES_TABLE,
			record([
				("subject_id", json!(Option::<String>::None)),
				("code_hash", json!("h")),
				("destination", json!("+14155551234")),
				("destination_type", json!("phone")),
				("purpose", json!("register")),
				("expires_at", json!(past)),
				("used_at", json!(Option::<String>::None)),
				("attempts", json!(0)),
				("max_attempts", json!(5)),
			]),
		)
		.await
		.unwrap();

		let report = PasswordlessCleanup.run(orm.as_ref(), &PluginConfig::new(), 500).await.unwrap();
		assert_eq!(report.cleaned, 2);

		let remaining_links = orm.find_many(MAGIC_LINKS_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining_links.len(), 1);
		let remaining_codes = orm.find_many(VERIFICATION_CODES_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining_codes.len(), 0);
	}
}
