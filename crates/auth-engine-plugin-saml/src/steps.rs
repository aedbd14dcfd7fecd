// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{provider_tag, Shared, PENDING_REQUESTS_TABLE};
use auth_engine_core::data_access::{field_opt_str, field_str, record, DataAccessPort, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::session::SubjectKind;
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{IDENTITIES_TABLE, SUBJECTS_TABLE};
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

pub struct BeginLoginStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for BeginLoginStep {
	fn name(&self) -> &str {
		"begin-login"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["provider", "relay_state"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["provider"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let provider_name = input_str(&input, "provider").unwrap_or_default();
		let Some(provider) = self.0.config.providers.get(&provider_name) else {
			return fail(EngineError::NotFound(format!("saml provider `{provider_name}`")));
		};
		let relay_state = input_str(&input, "relay_state");

		let request_id = format!("_{}", uuid::Uuid::new_v4());
		let expires_at = Utc::now() + ChronoDuration::milliseconds(self.0.config.request_ttl_ms as i64);

		ctx.orm
			.create(
				PENDING_REQUESTS_TABLE,
				record([
					("request_id", json!(request_id)),
					("provider", json!(provider_name)),
					("relay_state", json!(relay_state.clone())),
					("expires_at", json!(expires_at.to_rfc3339())),
					("used_at", json!(Option::<String>::None)),
				]),
			)
			.await?;

		let artifact = self.0.build_authn_request.build(provider, &request_id).await?;

		Ok(StepOutput::ok("ok", "authn request issued")
			.with_other("sso_url", json!(provider.idp_sso_url))
			.with_other("saml_request", json!(artifact.encoded_request))
			.with_other("relay_state", json!(relay_state)))
	}
}

pub struct AcsStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for AcsStep {
	fn name(&self) -> &str {
		"acs"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["provider", "saml_response"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["provider", "saml_response"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let provider_name = input_str(&input, "provider").unwrap_or_default();
		let Some(provider) = self.0.config.providers.get(&provider_name) else {
			return fail(EngineError::NotFound(format!("saml provider `{provider_name}`")));
		};
		let raw_response = input_str(&input, "saml_response").unwrap_or_default();

		let assertion = self.0.validate_assertion.validate(provider, &raw_response).await?;

		let pending = ctx
			.orm
			.find_first(
				PENDING_REQUESTS_TABLE,
				FindOptions::new().where_clause(Predicate::eq("request_id", json!(assertion.in_response_to.clone())).and(Predicate::eq("provider", json!(provider_name)))),
			)
			.await?;
		let Some(pending) = pending else {
			return fail(EngineError::InvalidCredentials);
		};
		if field_opt_str(&pending, "used_at").is_some() {
			return fail(EngineError::Expired);
		}
		let expires_at = parse_rfc3339(&field_str(&pending, "expires_at")?)?;
		if Utc::now() >= expires_at {
			return fail(EngineError::Expired);
		}

		let pending_id = field_str(&pending, "id")?;
		ctx.orm
			.update_many(
				PENDING_REQUESTS_TABLE,
				UpdateOptions {
					where_: Some(Predicate::eq("id", json!(pending_id.clone()))),
					set: record([("used_at", json!(Utc::now().to_rfc3339()))]),
				},
			)
			.await?;
		ctx.orm
			.delete_many(
				PENDING_REQUESTS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("id", json!(pending_id))),
				},
			)
			.await
			.ok();

		let Some(subject_identifier) = assertion.attributes.get(&provider.subject_attribute).and_then(Value::as_str) else {
			return fail(EngineError::InvalidCredentials);
		};

		let tag = provider_tag(&provider_name);
		let identity = ctx
			.orm
			.find_first(
				IDENTITIES_TABLE,
				FindOptions::new().where_clause(Predicate::eq("provider", json!(tag.clone())).and(Predicate::eq("identifier", json!(subject_identifier)))),
			)
			.await?;

		let subject_id = match identity {
			Some(identity) => field_str(&identity, "subject_id")?,
			None => {
				let subject_id = uuid::Uuid::new_v4().to_string();
				let now = Utc::now().to_rfc3339();
				ctx.orm.create(SUBJECTS_TABLE, record([("id", json!(subject_id)), ("created_at", json!(now))])).await?;
				ctx.orm
					.create(
						IDENTITIES_TABLE,
						record([
							("subject_id", json!(subject_id)),
							("provider", json!(tag)),
							("identifier", json!(subject_identifier)),
							("verified", json!(true)),
							("created_at", json!(now)),
							("updated_at", json!(now)),
						]),
					)
					.await?;
				subject_id
			}
		};

		let token = ctx.sessions.create_session_for(SubjectKind::subject(), &subject_id, self.0.config.session_ttl_seconds).await?;

		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "logged in").with_subject(subject).with_token(token))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::callback::{BuildAuthnRequestCallback, SamlAssertion, SamlAuthnRequest, ValidateAssertionCallback};
	use crate::SamlPlugin;
	use auth_engine_config::{SamlConfig, SamlConfigLayer, SamlProviderConfigLayer};
	use auth_engine_core::data_access::SqliteDataAccessPort;
	use auth_engine_core::engine::EngineBuilder;
	use auth_engine_core::token::TokenCodec;
	use futures::future::BoxFuture;
	use std::collections::HashMap;

	fn test_config() -> SamlConfig {
		let mut providers = HashMap::new();
		providers.insert(
			"okta".to_string(),
			SamlProviderConfigLayer {
				entity_id: Some("urn:auth-engine".to_string()),
				acs_url: Some("https://app.example.com/saml/acs".to_string()),
				idp_sso_url: Some("https://idp.okta.com/sso".to_string()),
				subject_attribute: None,
			},
		);
		SamlConfigLayer { providers, ..Default::default() }.finalize().unwrap()
	}

	struct FixedBuilder;
	impl BuildAuthnRequestCallback for FixedBuilder {
		fn build<'a>(&'a self, _provider: &'a auth_engine_config::SamlProviderConfig, request_id: &'a str) -> BoxFuture<'a, Result<SamlAuthnRequest, EngineError>> {
			let request_id = request_id.to_string();
			Box::pin(async move { Ok(SamlAuthnRequest { encoded_request: format!("signed-request-for-{request_id}") }) })
		}
	}

	struct RecordingValidator;
	impl ValidateAssertionCallback for RecordingValidator {
		fn validate<'a>(&'a self, _provider: &'a auth_engine_config::SamlProviderConfig, raw_response: &'a str) -> BoxFuture<'a, Result<SamlAssertion, EngineError>> {
			let raw_response = raw_response.to_string();
			Box::pin(async move {
				let mut attributes = Map::new();
				attributes.insert("NameID".to_string(), json!("employee-7"));
				Ok(SamlAssertion { in_response_to: raw_response, attributes })
			})
		}
	}

	async fn engine_with(validator: Arc<RecordingValidator>) -> auth_engine_core::engine::Engine {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let plugin = SamlPlugin::new(test_config(), Arc::new(FixedBuilder), validator);
		EngineBuilder::new(Arc::clone(&orm), codec).with_plugin(Box::new(plugin)).build().await.unwrap()
	}

	#[tokio::test]
	async fn begin_then_acs_mints_a_session_for_a_new_federated_subject() {
		let validator = Arc::new(RecordingValidator);
		let engine = engine_with(validator).await;

		let mut input = Map::new();
		input.insert("provider".to_string(), json!("okta"));
		let begin = engine.execute_step("saml", "begin-login", input).await.unwrap();
		assert!(begin.success);
		let saml_request = begin.others.get("saml_request").and_then(Value::as_str).unwrap().to_string();
		let request_id = saml_request.strip_prefix("signed-request-for-").unwrap().to_string();

		let mut input = Map::new();
		input.insert("provider".to_string(), json!("okta"));
		input.insert("saml_response".to_string(), json!(request_id.clone()));
		let out = engine.execute_step("saml", "acs", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());

		// the same assertion's request_id cannot be replayed
		let mut input = Map::new();
		input.insert("provider".to_string(), json!("okta"));
		input.insert("saml_response".to_string(), json!(request_id));
		let out2 = engine.execute_step("saml", "acs", input).await.unwrap();
		assert!(!out2.success);
	}

	#[tokio::test]
	async fn acs_with_unknown_request_id_fails() {
		let validator = Arc::new(RecordingValidator);
		let engine = engine_with(validator).await;

		let mut input = Map::new();
		input.insert("provider".to_string(), json!("okta"));
		input.insert("saml_response".to_string(), json!("never-issued"));
		let out = engine.execute_step("saml", "acs", input).await.unwrap();
		assert!(!out.success);
	}
}
