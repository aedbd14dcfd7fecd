// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{Shared, API_KEYS_TABLE};
use auth_engine_core::data_access::{field_bool, field_opt_str, field_str, record, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::token::hash_token;
use auth_engine_errors::EngineError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn input_str(input: &Map<String, Value>, field: &str) -> Option<String> {
	input.get(field).and_then(Value::as_str).map(str::to_string)
}

fn require(input: &Map<String, Value>, fields: &[&str]) -> Result<(), Vec<FieldViolation>> {
	let violations: Vec<FieldViolation> = fields
		.iter()
		.filter(|field| !matches!(input.get(**field), Some(Value::String(s)) if !s.is_empty()))
		.map(|field| FieldViolation {
			field: field.to_string(),
			reason: "required".to_string(),
		})
		.collect();
	if violations.is_empty() {
		Ok(())
	} else {
		Err(violations)
	}
}

fn fail(err: EngineError) -> Result<StepOutput, EngineError> {
	if err.is_internal() {
		return Err(err);
	}
	Ok(StepOutput::fail(err.status_tag(), err.to_string()))
}

fn generate_raw_key(prefix: &str, length: u8) -> String {
	let mut bytes = vec![0u8; length as usize];
	rand::thread_rng().fill_bytes(&mut bytes);
	format!("{prefix}_{}", URL_SAFE_NO_PAD.encode(bytes))
}

async fn require_session(ctx: &StepContext<'_>, token: &str) -> Result<String, EngineError> {
	let check = ctx.sessions.check_session(token).await?;
	if !check.valid {
		return Err(EngineError::Unauthorized);
	}
	check
		.subject
		.as_ref()
		.and_then(|s| s.get("id"))
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| EngineError::Internal("valid session has no resolvable subject id".to_string()))
}

fn scopes_from(input: &Map<String, Value>) -> Vec<String> {
	input
		.get("scopes")
		.and_then(Value::as_array)
		.map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
		.unwrap_or_default()
}

pub struct CreateApiKeyStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for CreateApiKeyStep {
	fn name(&self) -> &str {
		"create-api-key"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "name", "scopes", "ttl_days"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "name"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let name = input_str(&input, "name").unwrap_or_default();
		let scopes = scopes_from(&input);

		let subject_id = match require_session(ctx, &token).await {
			Ok(id) => id,
			Err(err) => return fail(err),
		};

		let config = &self.0.config;
		if config.require_scopes && scopes.is_empty() {
			return Ok(StepOutput::fail("validation", "at least one scope is required"));
		}
		if let Some(unknown) = scopes.iter().find(|s| !config.allowed_scopes.is_empty() && !config.allowed_scopes.contains(s)) {
			return Ok(StepOutput::fail("validation", format!("scope `{unknown}` is not allowed")));
		}

		let active_count = ctx
			.orm
			.count(
				API_KEYS_TABLE,
				Some(Predicate::eq("subject_id", json!(subject_id)).and(Predicate::eq("is_active", json!(true)))),
			)
			.await?;
		if active_count >= config.max_keys_per_user as u64 {
			return fail(EngineError::RateLimited(format!("subject already has {active_count} active api key(s)")));
		}

		let existing = ctx
			.orm
			.find_first(
				API_KEYS_TABLE,
				FindOptions::new().where_clause(
					Predicate::eq("subject_id", json!(subject_id)).and(Predicate::eq("name", json!(name))).and(Predicate::eq("is_active", json!(true))),
				),
			)
			.await?;
		if existing.is_some() {
			return fail(EngineError::Conflict(format!("an active api key named `{name}` already exists")));
		}

		let ttl_days = input.get("ttl_days").and_then(Value::as_i64).or(config.default_ttl_days.map(|d| d as i64));
		let expires_at = ttl_days.map(|days| (Utc::now() + ChronoDuration::days(days)).to_rfc3339());

		let raw_key = generate_raw_key(&config.key_prefix, config.key_length);
		let key_hash = hash_token(&raw_key);
		let now = Utc::now().to_rfc3339();

		let created = ctx
			.orm
			.create(
				API_KEYS_TABLE,
				record([
					("subject_id", json!(subject_id)),
					("name", json!(name)),
					("key_hash", json!(key_hash)),
					("prefix", json!(config.key_prefix)),
					("scopes", json!(scopes)),
					("is_active", json!(true)),
					("expires_at", json!(expires_at)),
					("last_used_at", json!(Option::<String>::None)),
					("created_at", json!(now)),
				]),
			)
			.await?;

		let mut out = StepOutput::ok("ok", "api key created").with_other("api_key", json!(raw_key));
		out = out.with_other("id", created.get("id").cloned().unwrap_or(Value::Null));
		out = out.with_other("name", json!(name));
		Ok(out)
	}
}

pub struct ListApiKeysStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ListApiKeysStep {
	fn name(&self) -> &str {
		"list-api-keys"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let subject_id = match require_session(ctx, &token).await {
			Ok(id) => id,
			Err(err) => return fail(err),
		};

		let keys = ctx
			.orm
			.find_many(API_KEYS_TABLE, FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id))))
			.await?;
		let entries: Vec<Value> = keys
			.into_iter()
			.map(|key| {
				let mut entry = Map::new();
				entry.insert("id".to_string(), key.get("id").cloned().unwrap_or(Value::Null));
				entry.insert("name".to_string(), key.get("name").cloned().unwrap_or(Value::Null));
				entry.insert("scopes".to_string(), key.get("scopes").cloned().unwrap_or(json!([])));
				entry.insert("is_active".to_string(), key.get("is_active").cloned().unwrap_or(json!(false)));
				entry.insert("expires_at".to_string(), key.get("expires_at").cloned().unwrap_or(Value::Null));
				entry.insert("last_used_at".to_string(), key.get("last_used_at").cloned().unwrap_or(Value::Null));
				Value::Object(entry)
			})
			.collect();
		Ok(StepOutput::ok("ok", "api keys listed").with_other("api_keys", Value::Array(entries)))
	}
}

pub struct RevokeApiKeyStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for RevokeApiKeyStep {
	fn name(&self) -> &str {
		"revoke-api-key"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "id"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "id"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let id = input_str(&input, "id").unwrap_or_default();
		let subject_id = match require_session(ctx, &token).await {
			Ok(id) => id,
			Err(err) => return fail(err),
		};

		let key = ctx
			.orm
			.find_first(API_KEYS_TABLE, FindOptions::new().where_clause(Predicate::eq("id", json!(id)).and(Predicate::eq("subject_id", json!(subject_id)))))
			.await?;
		if key.is_none() {
			return fail(EngineError::NotFound(format!("api key `{id}`")));
		}

		ctx.orm
			.update_many(
				API_KEYS_TABLE,
				UpdateOptions {
					where_: Some(Predicate::eq("id", json!(id))),
					set: record([("is_active", json!(false))]),
				},
			)
			.await?;
		Ok(StepOutput::ok("ok", "api key revoked"))
	}
}

pub struct UpdateApiKeyStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for UpdateApiKeyStep {
	fn name(&self) -> &str {
		"update-api-key"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "id", "name", "scopes"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "id"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let id = input_str(&input, "id").unwrap_or_default();
		let subject_id = match require_session(ctx, &token).await {
			Ok(id) => id,
			Err(err) => return fail(err),
		};

		let key = ctx
			.orm
			.find_first(API_KEYS_TABLE, FindOptions::new().where_clause(Predicate::eq("id", json!(id)).and(Predicate::eq("subject_id", json!(subject_id)))))
			.await?;
		if key.is_none() {
			return fail(EngineError::NotFound(format!("api key `{id}`")));
		}

		let mut set = Map::new();
		if let Some(name) = input_str(&input, "name") {
			set.insert("name".to_string(), json!(name));
		}
		if input.contains_key("scopes") {
			let scopes = scopes_from(&input);
			if let Some(unknown) = scopes.iter().find(|s| !self.0.config.allowed_scopes.is_empty() && !self.0.config.allowed_scopes.contains(s)) {
				return Ok(StepOutput::fail("validation", format!("scope `{unknown}` is not allowed")));
			}
			set.insert("scopes".to_string(), json!(scopes));
		}
		if set.is_empty() {
			return Ok(StepOutput::ok("ok", "nothing to update"));
		}

		ctx.orm
			.update_many(API_KEYS_TABLE, UpdateOptions { where_: Some(Predicate::eq("id", json!(id))), set })
			.await?;
		Ok(StepOutput::ok("ok", "api key updated"))
	}
}

pub struct AuthenticateApiKeyStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for AuthenticateApiKeyStep {
	fn name(&self) -> &str {
		"authenticate-api-key"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["api_key"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["api_key"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let api_key = input_str(&input, "api_key").unwrap_or_default();
		let key_hash = hash_token(&api_key);

		let key_record = ctx
			.orm
			.find_first(API_KEYS_TABLE, FindOptions::new().where_clause(Predicate::eq("key_hash", json!(key_hash))))
			.await?;
		let Some(key_record) = key_record else {
			return fail(EngineError::Unauthorized);
		};
		if !field_bool(&key_record, "is_active")? {
			return fail(EngineError::Unauthorized);
		}
		if let Some(expires_at) = field_opt_str(&key_record, "expires_at") {
			let expires_at = chrono::DateTime::parse_from_rfc3339(&expires_at).map_err(|e| EngineError::Internal(e.to_string()))?;
			if Utc::now() >= expires_at {
				return fail(EngineError::Unauthorized);
			}
		}

		let key_id = field_str(&key_record, "id")?;
		let subject_id = field_str(&key_record, "subject_id")?;
		if self.0.config.enable_usage_tracking {
			ctx.orm
				.update_many(
					API_KEYS_TABLE,
					UpdateOptions {
						where_: Some(Predicate::eq("id", json!(key_id))),
						set: record([("last_used_at", json!(Utc::now().to_rfc3339()))]),
					},
				)
				.await?;
		}

		let scopes = key_record.get("scopes").cloned().unwrap_or(json!([]));
		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "authenticated").with_subject(subject).with_other("scopes", scopes))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ApiKeyPlugin;
	use auth_engine_config::{ApiKeyConfig, ApiKeyConfigLayer};
	use auth_engine_core::data_access::{DataAccessPort, SqliteDataAccessPort};
	use auth_engine_core::engine::EngineBuilder;
	use auth_engine_core::session::{PublicSubject, SessionResolver, Subject, SubjectKind};
	use auth_engine_core::token::TokenCodec;
	use std::collections::HashMap as StdHashMap;

	struct FixedResolver;
	#[async_trait::async_trait]
	impl SessionResolver for FixedResolver {
		async fn get_by_id(&self, id: &str) -> Result<Option<Subject>, EngineError> {
			Ok(Some(Subject {
				id: id.to_string(),
				fields: StdHashMap::new(),
			}))
		}
		fn sanitize(&self, subject: &Subject) -> PublicSubject {
			let mut map = PublicSubject::new();
			map.insert("id".to_string(), json!(subject.id));
			map
		}
	}

	async fn engine_with_api_keys(config: ApiKeyConfig) -> (auth_engine_core::engine::Engine, String) {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let plugin = ApiKeyPlugin::new(config);
		let engine = EngineBuilder::new(orm, codec).with_plugin(Box::new(plugin)).build().await.unwrap();
		engine.register_session_resolver(SubjectKind::subject(), Arc::new(FixedResolver)).await.unwrap();
		let token = engine.create_session_for(SubjectKind::subject(), "subj-1", 3600).await.unwrap();
		(engine, token)
	}

	#[tokio::test]
	async fn duplicate_active_name_conflicts_then_authenticate_and_list_succeed() {
		let (engine, token) = engine_with_api_keys(ApiKeyConfigLayer { max_keys_per_user: Some(2), ..Default::default() }.finalize().unwrap()).await;

		let mut input = Map::new();
		input.insert("token".to_string(), json!(token));
		input.insert("name".to_string(), json!("CI"));
		let out = engine.execute_step("api-key", "create-api-key", input).await.unwrap();
		assert!(out.success);
		let raw_key = out.others.get("api_key").and_then(Value::as_str).unwrap().to_string();

		let mut input = Map::new();
		input.insert("token".to_string(), json!(token.clone()));
		input.insert("name".to_string(), json!("CI"));
		let dup = engine.execute_step("api-key", "create-api-key", input).await.unwrap();
		assert!(!dup.success);

		let mut input = Map::new();
		input.insert("api_key".to_string(), json!(raw_key));
		let auth = engine.execute_step("api-key", "authenticate-api-key", input).await.unwrap();
		assert!(auth.success);
		assert_eq!(auth.subject.unwrap().get("id").unwrap(), "subj-1");

		let mut input = Map::new();
		input.insert("token".to_string(), json!(token));
		let listing = engine.execute_step("api-key", "list-api-keys", input).await.unwrap();
		assert_eq!(listing.others.get("api_keys").unwrap().as_array().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn revoked_key_no_longer_authenticates() {
		let (engine, token) = engine_with_api_keys(ApiKeyConfig::default()).await;
		let mut input = Map::new();
		input.insert("token".to_string(), json!(token.clone()));
		input.insert("name".to_string(), json!("laptop"));
		let out = engine.execute_step("api-key", "create-api-key", input).await.unwrap();
		let raw_key = out.others.get("api_key").and_then(Value::as_str).unwrap().to_string();
		let id = out.others.get("id").and_then(Value::as_str).unwrap().to_string();

		let mut input = Map::new();
		input.insert("token".to_string(), json!(token));
		input.insert("id".to_string(), json!(id));
		engine.execute_step("api-key", "revoke-api-key", input).await.unwrap();

		let mut input = Map::new();
		input.insert("api_key".to_string(), json!(raw_key));
		let out = engine.execute_step("api-key", "authenticate-api-key", input).await.unwrap();
		assert!(!out.success);
	}
}
