// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{Shared, ANONYMOUS_SESSIONS_TABLE, ANONYMOUS_SUBJECTS_TABLE};
use auth_engine_core::data_access::{field_i64, field_str, record, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::session::{self, SubjectKind};
use auth_engine_core::token::{generate_opaque_token, hash_token};
use auth_engine_errors::EngineError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
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

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, EngineError> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| EngineError::Internal(format!("malformed timestamp `{value}`: {e}")))
}

/// Looks up the live guest session behind a presented bearer token without
/// going through a registered `SessionResolver` — this plugin is the only
/// one that ever needs to resolve the `guest` kind, and it already owns
/// `anonymous_sessions`, so there's no resolver to register against.
async fn load_guest_session(orm: &dyn auth_engine_core::data_access::DataAccessPort, token: &str) -> Result<Option<(String, auth_engine_core::data_access::Record)>, EngineError> {
	let hash = hash_token(token);
	let session_row = orm
		.find_first(
			session::SESSIONS_TABLE,
			FindOptions::new().where_clause(Predicate::eq("token_hash", json!(hash)).and(Predicate::eq("subject_kind", json!("guest")))),
		)
		.await?;
	let Some(session_row) = session_row else {
		return Ok(None);
	};
	let expires_at = parse_rfc3339(&field_str(&session_row, "expires_at")?)?;
	if Utc::now() >= expires_at {
		return Ok(None);
	}
	let subject_id = field_str(&session_row, "subject_id")?;
	let guest = orm
		.find_first(ANONYMOUS_SESSIONS_TABLE, FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id))))
		.await?;
	Ok(guest.map(|guest| (subject_id, guest)))
}

pub struct CreateGuestStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for CreateGuestStep {
	fn name(&self) -> &str {
		"create-guest"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["fingerprint", "metadata"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		if self.0.config.fingerprint_required {
			return require(input, &["fingerprint"]);
		}
		Ok(())
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let fingerprint_hash = match input_str(&input, "fingerprint") {
			Some(fingerprint) => hash_token(&fingerprint),
			None => hash_token(&generate_opaque_token()),
		};
		let metadata = input.get("metadata").cloned().unwrap_or(Value::Object(Map::new()));

		let active_guests = ctx
			.orm
			.count(
				ANONYMOUS_SESSIONS_TABLE,
				Some(Predicate::eq("fingerprint_hash", json!(fingerprint_hash)).and(Predicate::gt("expires_at", json!(Utc::now().to_rfc3339())))),
			)
			.await?;
		if active_guests >= self.0.config.max_guests_per_fingerprint as u64 {
			return fail(EngineError::RateLimited(format!(
				"fingerprint already has {active_guests} active guest session(s)"
			)));
		}

		let subject_id = uuid::Uuid::new_v4().to_string();
		let now = Utc::now().to_rfc3339();
		let expires_at = Utc::now() + ChronoDuration::seconds(self.0.config.session_ttl_seconds as i64);

		ctx.orm
			.create(
				ANONYMOUS_SUBJECTS_TABLE,
				record([("id", json!(subject_id)), ("fingerprint_hash", json!(fingerprint_hash)), ("created_at", json!(now))]),
			)
			.await?;
		ctx.orm
			.create(
				ANONYMOUS_SESSIONS_TABLE,
				record([
					("subject_id", json!(subject_id)),
					("fingerprint_hash", json!(fingerprint_hash)),
					("expires_at", json!(expires_at.to_rfc3339())),
					("extension_count", json!(0)),
					("metadata", metadata),
				]),
			)
			.await?;

		let token = ctx.sessions.create_session_for(SubjectKind::guest(), &subject_id, self.0.config.session_ttl_seconds).await?;
		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "guest session created").with_subject(subject).with_token(token))
	}
}

pub struct ExtendGuestStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ExtendGuestStep {
	fn name(&self) -> &str {
		"extend-guest"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		if !self.0.config.allow_session_extension {
			return fail(EngineError::Forbidden("guest session extension is disabled".to_string()));
		}
		let token = input_str(&input, "token").unwrap_or_default();
		let Some((subject_id, guest)) = load_guest_session(ctx.orm, &token).await? else {
			return fail(EngineError::Unauthorized);
		};

		let extension_count = field_i64(&guest, "extension_count")?;
		if extension_count >= self.0.config.max_session_extensions as i64 {
			return fail(EngineError::RateLimited(format!(
				"guest session already extended {extension_count} time(s)"
			)));
		}

		let new_expiry = Utc::now() + ChronoDuration::seconds(self.0.config.session_ttl_seconds as i64);
		ctx.orm
			.update_many(
				ANONYMOUS_SESSIONS_TABLE,
				UpdateOptions {
					where_: Some(Predicate::eq("subject_id", json!(subject_id))),
					set: record([("expires_at", json!(new_expiry.to_rfc3339())), ("extension_count", json!(extension_count + 1))]),
				},
			)
			.await?;

		ctx.sessions.destroy_session(&token).await?;
		let new_token = ctx.sessions.create_session_for(SubjectKind::guest(), &subject_id, self.0.config.session_ttl_seconds).await?;

		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "guest session extended").with_subject(subject).with_token(new_token))
	}
}

pub struct ConvertGuestStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ConvertGuestStep {
	fn name(&self) -> &str {
		"convert-guest"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "target_plugin", "conversion_data"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "target_plugin"])
	}

	/// Guard rails: `target_plugin` must be allow-listed and have a
	/// configured target definition. If the dispatched step fails, no guest
	/// cleanup happens — the original guest session remains usable.
	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let target_plugin = input_str(&input, "target_plugin").unwrap_or_default();
		let conversion_data = match input.get("conversion_data") {
			Some(Value::Object(map)) => map.clone(),
			_ => Map::new(),
		};

		if !self.0.config.allowed_conversion_plugins.iter().any(|p| p == &target_plugin) {
			return fail(EngineError::Forbidden(format!("`{target_plugin}` is not an allowed conversion target")));
		}
		let Some(target) = self.0.config.conversion_targets.get(&target_plugin) else {
			return fail(EngineError::Forbidden(format!("no conversion target configured for `{target_plugin}`")));
		};

		// input_validation: declared required fields must be present before
		// the target plugin is ever invoked.
		let missing: Vec<FieldViolation> = target
			.required_fields
			.iter()
			.filter(|field| !matches!(conversion_data.get(field.as_str()), Some(Value::String(s)) if !s.is_empty()))
			.map(|field| FieldViolation {
				field: field.clone(),
				reason: "required".to_string(),
			})
			.collect();
		if !missing.is_empty() {
			return Ok(StepOutput::fail("validation", format!("conversion_data is missing required field(s) for `{target_plugin}`")));
		}

		// map_input: rename conversion_data keys onto the keys the target
		// step expects, per the target's declared `{target_key: source_key}`
		// mapping. Unmapped keys pass through unchanged.
		let mut mapped_input = conversion_data.clone();
		for (target_key, source_key) in &target.map_input {
			if let Some(value) = conversion_data.get(source_key) {
				mapped_input.insert(target_key.clone(), value.clone());
			}
		}

		let Some((guest_subject_id, _guest)) = load_guest_session(ctx.orm, &token).await? else {
			return fail(EngineError::Unauthorized);
		};

		let output = ctx.engine.execute_step(&target_plugin, &target.step, mapped_input).await?;
		if !output.success {
			return Ok(output);
		}

		// extract: prefer the target's declared `others` field, falling back
		// to the envelope's standard `subject.id`.
		let new_subject_id = target
			.extract_subject_id_field
			.as_deref()
			.and_then(|field| output.others.get(field))
			.and_then(Value::as_str)
			.or_else(|| output.subject.as_ref().and_then(|s| s.get("id")).and_then(Value::as_str))
			.map(str::to_string)
			.ok_or_else(|| EngineError::Internal(format!("conversion target `{target_plugin}.{}` did not return a subject id", target.step)))?;

		ctx.orm
			.delete_many(
				ANONYMOUS_SESSIONS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("subject_id", json!(guest_subject_id))),
				},
			)
			.await?;
		ctx.orm
			.delete_many(
				ANONYMOUS_SUBJECTS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("id", json!(guest_subject_id))),
				},
			)
			.await?;
		ctx.sessions.destroy_all_for_subject(&guest_subject_id).await?;

		let extracted_token = target
			.extract_token_field
			.as_deref()
			.and_then(|field| output.others.get(field))
			.and_then(Value::as_str)
			.map(str::to_string)
			.or_else(|| output.token.clone());
		let token = match extracted_token {
			Some(token) => token,
			None => ctx.sessions.create_session_for(SubjectKind::subject(), &new_subject_id, self.0.config.session_ttl_seconds).await?,
		};

		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(new_subject_id));
		Ok(StepOutput::ok("ok", "guest converted").with_subject(subject).with_token(token))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::AnonymousPlugin;
	use auth_engine_config::{AnonymousConfigLayer, ConversionTargetLayer};
	use auth_engine_core::data_access::{DataAccessPort, SqliteDataAccessPort};
	use auth_engine_core::engine::EngineBuilder;
	use auth_engine_core::token::TokenCodec;
	use auth_engine_plugin_email_password::EmailPasswordPlugin;
	use std::collections::HashMap as StdHashMap;

	async fn engine_with_anonymous(max_guests: u32) -> auth_engine_core::engine::Engine {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let config = AnonymousConfigLayer {
			max_guests_per_fingerprint: Some(max_guests),
			..Default::default()
		}
		.finalize()
		.unwrap();
		let plugin = AnonymousPlugin::new(config);
		EngineBuilder::new(orm, codec).with_plugin(Box::new(plugin)).build().await.unwrap()
	}

	#[tokio::test]
	async fn create_guest_mints_a_session() {
		let engine = engine_with_anonymous(3).await;
		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-1"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());
	}

	#[tokio::test]
	async fn fourth_guest_for_the_same_fingerprint_is_rate_limited() {
		let engine = engine_with_anonymous(3).await;
		for _ in 0..3 {
			let mut input = Map::new();
			input.insert("fingerprint".to_string(), json!("fp-shared"));
			let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
			assert!(out.success);
		}
		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-shared"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		assert!(!out.success);
	}

	#[tokio::test]
	async fn extend_guest_rotates_the_token_and_bumps_extension_count() {
		let engine = engine_with_anonymous(3).await;
		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-2"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		let token = out.token.unwrap();

		let mut input = Map::new();
		input.insert("token".to_string(), json!(token));
		let out = engine.execute_step("anonymous", "extend-guest", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());
	}

	async fn engine_with_guest_to_email_password_conversion_target(target: ConversionTargetLayer) -> auth_engine_core::engine::Engine {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));

		let mut targets = StdHashMap::new();
		targets.insert("email-password".to_string(), target);
		let anon_config = AnonymousConfigLayer {
			allowed_conversion_plugins: Some(vec!["email-password".to_string()]),
			conversion_targets: targets,
			..Default::default()
		}
		.finalize()
		.unwrap();
		let anon_plugin = AnonymousPlugin::new(anon_config);

		let send_code = Arc::new(NoopSendCode);
		let email_plugin = EmailPasswordPlugin::new(Default::default(), Some(send_code), None).unwrap();

		EngineBuilder::new(orm, codec)
			.with_plugin(Box::new(anon_plugin))
			.with_plugin(Box::new(email_plugin))
			.build()
			.await
			.unwrap()
	}

	async fn engine_with_guest_to_email_password_conversion() -> auth_engine_core::engine::Engine {
		engine_with_guest_to_email_password_conversion_target(ConversionTargetLayer {
			step: "register".to_string(),
			..Default::default()
		})
		.await
	}

	struct NoopSendCode;
	impl auth_engine_plugin_password_common::SendCodeCallback for NoopSendCode {
		fn send<'a>(
			&'a self,
			_identifier: &'a str,
			_code: &'a str,
			_purpose: auth_engine_plugin_password_common::CodePurpose,
		) -> futures::future::BoxFuture<'a, Result<(), EngineError>> {
			Box::pin(async move { Ok(()) })
		}
	}

	#[tokio::test]
	async fn guest_converts_to_an_email_password_subject() {
		let engine = engine_with_guest_to_email_password_conversion().await;

		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-3"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		let guest_token = out.token.unwrap();

		let mut conversion_data = Map::new();
		conversion_data.insert("email".to_string(), json!("converted@x.com"));
		conversion_data.insert("password".to_string(), json!("Horse-Battery-9"));
		let mut input = Map::new();
		input.insert("token".to_string(), json!(guest_token.clone()));
		input.insert("target_plugin".to_string(), json!("email-password"));
		input.insert("conversion_data".to_string(), Value::Object(conversion_data));
		let out = engine.execute_step("anonymous", "convert-guest", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());

		let check = engine.check_session(&guest_token).await.unwrap();
		assert!(!check.valid);
	}

	#[tokio::test]
	async fn convert_guest_applies_map_input_before_dispatching_the_target_step() {
		let mut map_input = StdHashMap::new();
		map_input.insert("email".to_string(), "guest_email".to_string());
		let engine = engine_with_guest_to_email_password_conversion_target(ConversionTargetLayer {
			step: "register".to_string(),
			map_input,
			..Default::default()
		})
		.await;

		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-map"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		let guest_token = out.token.unwrap();

		// the guest payload only has `guest_email`, which `register` doesn't
		// know about — map_input renames it to `email` before dispatch.
		let mut conversion_data = Map::new();
		conversion_data.insert("guest_email".to_string(), json!("mapped@x.com"));
		conversion_data.insert("password".to_string(), json!("Horse-Battery-9"));
		let mut input = Map::new();
		input.insert("token".to_string(), json!(guest_token));
		input.insert("target_plugin".to_string(), json!("email-password"));
		input.insert("conversion_data".to_string(), Value::Object(conversion_data));
		let out = engine.execute_step("anonymous", "convert-guest", input).await.unwrap();
		assert!(out.success);
	}

	#[tokio::test]
	async fn convert_guest_rejects_missing_required_fields_before_dispatch() {
		let engine = engine_with_guest_to_email_password_conversion_target(ConversionTargetLayer {
			step: "register".to_string(),
			required_fields: vec!["email".to_string(), "password".to_string()],
			..Default::default()
		})
		.await;

		let mut input = Map::new();
		input.insert("fingerprint".to_string(), json!("fp-required"));
		let out = engine.execute_step("anonymous", "create-guest", input).await.unwrap();
		let guest_token = out.token.unwrap();

		// `password` is missing; the target step must never be invoked.
		let mut conversion_data = Map::new();
		conversion_data.insert("email".to_string(), json!("incomplete@x.com"));
		let mut input = Map::new();
		input.insert("token".to_string(), json!(guest_token.clone()));
		input.insert("target_plugin".to_string(), json!("email-password"));
		input.insert("conversion_data".to_string(), Value::Object(conversion_data));
		let out = engine.execute_step("anonymous", "convert-guest", input).await.unwrap();
		assert!(!out.success);

		// the guest session must still be usable since dispatch never happened.
		let check = engine.check_session(&guest_token).await.unwrap();
		assert!(check.valid);
	}
}
