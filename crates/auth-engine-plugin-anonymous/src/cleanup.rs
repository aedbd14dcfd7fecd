// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{ANONYMOUS_SESSIONS_TABLE, ANONYMOUS_SUBJECTS_TABLE};
use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use auth_engine_errors::EngineError;
use chrono::Utc;
use serde_json::json;

/// Sweeps expired guest sessions and the orphaned `anonymous_subjects` rows
/// they leave behind, bounded by `batch_size` per table per tick.
pub struct AnonymousCleanup;

#[async_trait::async_trait]
impl CleanupRunner for AnonymousCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired_sessions = orm
			.find_many(ANONYMOUS_SESSIONS_TABLE, FindOptions::new().where_clause(Predicate::lt("expires_at", now)).limit(batch_size))
			.await?;
		if expired_sessions.is_empty() {
			return Ok(report);
		}

		let subject_ids: Vec<String> = expired_sessions.iter().filter_map(|r| field_str(r, "subject_id").ok()).collect();
		let session_ids: Vec<_> = expired_sessions.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
		let cleaned = session_ids.len() as u64;
		orm.delete_many(
			ANONYMOUS_SESSIONS_TABLE,
			DeleteOptions {
				where_: Some(Predicate::in_("id", session_ids)),
			},
		)
		.await?;
		report.cleaned += cleaned;
		report.per_table_counters.insert(ANONYMOUS_SESSIONS_TABLE.to_string(), cleaned);

		let subject_id_values: Vec<_> = subject_ids.into_iter().map(|id| json!(id)).collect();
		let removed_subjects = orm
			.delete_many(
				ANONYMOUS_SUBJECTS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", subject_id_values)),
				},
			)
			.await?;
		report.cleaned += removed_subjects;
		report.per_table_counters.insert(ANONYMOUS_SUBJECTS_TABLE.to_string(), removed_subjects);

		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use auth_engine_core::data_access::{record, SqliteDataAccessPort};
	use std::sync::Arc;

	#[tokio::test]
	async fn sweeps_expired_guest_sessions_and_their_subjects() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let past = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
		let future = (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();

		orm.create(ANONYMOUS_SUBJECTS_TABLE, record([("id", json!("guest-expired")), ("fingerprint_hash", json!("fp1")), ("created_at", json!(past.clone()))]))
			.await
			.unwrap();
		orm.create(
			ANONYMOUS_SESSIONS_TABLE,
			record([
				("subject_id", json!("guest-expired")),
				("fingerprint_hash", json!("fp1")),
				("expires_at", json!(past)),
				("extension_count", json!(0)),
				("metadata", json!({})),
			]),
		)
		.await
		.unwrap();
		orm.create(ANONYMOUS_SUBJECTS_TABLE, record([("id", json!("guest-live")), ("fingerprint_hash", json!("fp2")), ("created_at", json!(future.clone()))]))
			.await
			.unwrap();
		orm.create(
			ANONYMOUS_SESSIONS_TABLE,
			record([
				("subject_id", json!("guest-live")),
				("fingerprint_hash", json!("fp2")),
				("expires_at", json!(future)),
				("extension_count", json!(0)),
				("metadata", json!({})),
			]),
		)
		.await
		.unwrap();

		let report = AnonymousCleanup.run(orm.as_ref(), &PluginConfig::new(), 500).await.unwrap();
		assert_eq!(report.cleaned, 2);

		let remaining_sessions = orm.find_many(ANONYMOUS_SESSIONS_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining_sessions.len(), 1);
		let remaining_subjects = orm.find_many(ANONYMOUS_SUBJECTS_TABLE, FindOptions::new()).await.unwrap();
		assert_eq!(remaining_subjects.len(), 1);
	}
}
