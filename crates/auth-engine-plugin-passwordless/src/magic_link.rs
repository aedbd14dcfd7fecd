// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{Shared, MAGIC_LINKS_TABLE};
use auth_engine_core::data_access::{field_opt_str, field_str, record, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::session::SubjectKind;
use auth_engine_core::token::{generate_opaque_token, hash_token};
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::IDENTITIES_TABLE;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Injected magic-link delivery. Implementations are transport-specific
/// (SMTP, SMS gateway) and out of scope for this core.
pub trait SendMagicLinkCallback: Send + Sync {
	fn send<'a>(&'a self, identifier: &'a str, token: &'a str) -> BoxFuture<'a, Result<(), EngineError>>;
}

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

pub struct SendMagicLinkStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for SendMagicLinkStep {
	fn name(&self) -> &str {
		"send-magic-link"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email"])
	}

	/// Silently succeeds (sending nothing) when the identity doesn't exist —
	/// the anti-enumeration contract requires `send-magic-link` never reveal
	/// whether an address is registered. Per the Resolved open question,
	/// this never creates a subject as a side effect of sending.
	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();

		let identity = ctx
			.orm
			.find_first(
				IDENTITIES_TABLE,
				FindOptions::new().where_clause(Predicate::eq("provider", json!("email")).and(Predicate::eq("identifier", json!(email)))),
			)
			.await?;
		let Some(identity) = identity else {
			return Ok(StepOutput::ok("ok", "if the account exists, a magic link has been sent"));
		};
		let subject_id = field_str(&identity, "subject_id")?;

		let token = generate_opaque_token();
		let token_hash = hash_token(&token);
		let expires_at = Utc::now() + ChronoDuration::milliseconds(self.0.config.magic_link_expires_in_ms as i64);

		ctx.orm
			.create(
				MAGIC_LINKS_TABLE,
				record([
					("subject_id", json!(subject_id)),
					("token_hash", json!(token_hash)),
					("identifier", json!(email)),
					("expires_at", json!(expires_at.to_rfc3339())),
					("used_at", json!(Option::<String>::None)),
				]),
			)
			.await?;

		let send = self.0.send_magic_link.as_deref().expect("send_magic_link is required and validated at construction");
		send.send(&email, &token).await?;
		Ok(StepOutput::ok("ok", "if the account exists, a magic link has been sent"))
	}
}

pub struct VerifyMagicLinkStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for VerifyMagicLinkStep {
	fn name(&self) -> &str {
		"verify-magic-link"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["magic_token"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["magic_token"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "magic_token").unwrap_or_default();
		let token_hash = hash_token(&token);

		let link = ctx
			.orm
			.find_first(MAGIC_LINKS_TABLE, FindOptions::new().where_clause(Predicate::eq("token_hash", json!(token_hash))))
			.await?;
		let Some(link) = link else {
			return fail(EngineError::InvalidCredentials);
		};

		if field_opt_str(&link, "used_at").is_some() {
			return fail(EngineError::Expired);
		}
		let expires_at = parse_rfc3339(&field_str(&link, "expires_at")?)?;
		if Utc::now() >= expires_at {
			return fail(EngineError::Expired);
		}

		let link_id = field_str(&link, "id")?;
		ctx.orm
			.update_many(
				MAGIC_LINKS_TABLE,
				UpdateOptions {
					where_: Some(Predicate::eq("id", json!(link_id))),
					set: record([("used_at", json!(Utc::now().to_rfc3339()))]),
				},
			)
			.await?;
		ctx.orm
			.delete_many(
				MAGIC_LINKS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("id", json!(link_id))),
				},
			)
			.await
			.ok();

		let subject_id = field_str(&link, "subject_id")?;
		let token = ctx
			.sessions
			.create_session_for(SubjectKind::subject(), &subject_id, self.0.config.session_ttl_seconds)
			.await?;

		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "logged in").with_subject(subject).with_token(token))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::PasswordlessPlugin;
	use auth_engine_config::PasswordlessConfig;
	use auth_engine_core::data_access::{DataAccessPort, SqliteDataAccessPort};
	use auth_engine_core::engine::EngineBuilder;
	use auth_engine_core::token::TokenCodec;
	use tokio::sync::Mutex;

	struct RecordingSendMagicLink {
		sent: Mutex<Vec<(String, String)>>,
	}
	impl SendMagicLinkCallback for RecordingSendMagicLink {
		fn send<'a>(&'a self, identifier: &'a str, token: &'a str) -> BoxFuture<'a, Result<(), EngineError>> {
			Box::pin(async move {
				self.sent.lock().await.push((identifier.to_string(), token.to_string()));
				Ok(())
			})
		}
	}

	async fn engine_with_magic_links() -> (auth_engine_core::engine::Engine, Arc<dyn DataAccessPort>, Arc<RecordingSendMagicLink>) {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let sender = Arc::new(RecordingSendMagicLink { sent: Mutex::new(Vec::new()) });
		let plugin = PasswordlessPlugin::new(PasswordlessConfig::default(), Some(sender.clone() as Arc<dyn SendMagicLinkCallback>), None, None).unwrap();
		let engine = EngineBuilder::new(Arc::clone(&orm), codec).with_plugin(Box::new(plugin)).build().await.unwrap();
		(engine, orm, sender)
	}

	#[tokio::test]
	async fn magic_link_is_single_use() {
		let (engine, orm, sender) = engine_with_magic_links().await;
		orm.create(
			IDENTITIES_TABLE,
			record([
				("subject_id", json!("subj-1")),
				("provider", json!("email")),
				("identifier", json!("b@x.com")),
				("verified", json!(true)),
			]),
		)
		.await
		.unwrap();

		let mut input = Map::new();
		input.insert("email".to_string(), json!("b@x.com"));
		engine.execute_step("passwordless", "send-magic-link", input).await.unwrap();

		let (_, token) = sender.sent.lock().await.last().cloned().unwrap();

		let mut input = Map::new();
		input.insert("magic_token".to_string(), json!(token.clone()));
		let out = engine.execute_step("passwordless", "verify-magic-link", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());

		let mut input = Map::new();
		input.insert("magic_token".to_string(), json!(token));
		let out2 = engine.execute_step("passwordless", "verify-magic-link", input).await.unwrap();
		assert!(!out2.success);
	}

	#[tokio::test]
	async fn send_magic_link_for_unknown_address_sends_nothing() {
		let (engine, _orm, sender) = engine_with_magic_links().await;
		let mut input = Map::new();
		input.insert("email".to_string(), json!("ghost@x.com"));
		let out = engine.execute_step("passwordless", "send-magic-link", input).await.unwrap();
		assert!(out.success);
		assert!(sender.sent.lock().await.is_empty());
	}
}
