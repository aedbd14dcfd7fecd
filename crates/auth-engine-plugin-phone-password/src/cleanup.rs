// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use auth_engine_core::cleanup::{CleanupReport, CleanupRunner, PluginConfig};
use auth_engine_core::data_access::{field_str, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{ProviderSpec, PASSWORD_RESET_CODES_TABLE};
use chrono::Utc;
use serde_json::json;

/// Sweeps expired phone-verification codes and expired password-reset
/// codes, bounded by `batch_size` per table per tick.
pub struct PhonePasswordCleanup;

#[async_trait::async_trait]
impl CleanupRunner for PhonePasswordCleanup {
	async fn run(&self, orm: &dyn DataAccessPort, _config: &PluginConfig, batch_size: u64) -> Result<CleanupReport, EngineError> {
		let mut report = CleanupReport::default();
		let now = json!(Utc::now().to_rfc3339());

		let expired_codes = orm
			.find_many(
				ProviderSpec::PHONE.metadata_table,
				FindOptions::new().where_clause(Predicate::lt("code_expires_at", now.clone())).limit(batch_size),
			)
			.await?;
		if !expired_codes.is_empty() {
			let ids: Vec<_> = expired_codes.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
			let cleaned = ids.len() as u64;
			orm.delete_many(
				ProviderSpec::PHONE.metadata_table,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
			report.cleaned += cleaned;
			report.per_table_counters.insert(ProviderSpec::PHONE.metadata_table.to_string(), cleaned);
		}

		let expired_resets = orm
			.find_many(
				PASSWORD_RESET_CODES_TABLE,
				FindOptions::new().where_clause(Predicate::lt("expires_at", now)).limit(batch_size),
			)
			.await?;
		if !expired_resets.is_empty() {
			let ids: Vec<_> = expired_resets.iter().filter_map(|r| field_str(r, "id").ok()).map(|id| json!(id)).collect();
			let cleaned = ids.len() as u64;
			orm.delete_many(
				PASSWORD_RESET_CODES_TABLE,
				DeleteOptions {
					where_: Some(Predicate::in_("id", ids)),
				},
			)
			.await?;
			report.cleaned += cleaned;
			report.per_table_counters.insert(PASSWORD_RESET_CODES_TABLE.to_string(), cleaned);
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
	async fn sweeps_expired_verification_codes_but_leaves_unexpired_ones() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let past = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
		let future = (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();

		orm.create(
			ProviderSpec::PHONE.metadata_table,
			record([
				("identity_id", json!("expired-identity")),
				("code_hash", json!("h")),
				("code_expires_at", json!(past)),
				("code_attempts", json!(0)),
			]),
		)
		.await
		.unwrap();
		orm.create(
			ProviderSpec::PHONE.metadata_table,
			record([
				("identity_id", json!("live-identity")),
				("code_hash", json!("h")),
				("code_expires_at", json!(future)),
				("code_attempts", json!(0)),
			]),
		)
		.await
		.unwrap();

		let report = PhonePasswordCleanup.run(orm.as_ref(), &PluginConfig::new(), 500).await.unwrap();
		assert_eq!(report.cleaned, 1);

		let remaining = orm
			.find_many(ProviderSpec::PHONE.metadata_table, FindOptions::new())
			.await
			.unwrap();
		assert_eq!(remaining.len(), 1);
	}
}
