// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{provider_tag, Shared, PENDING_REQUESTS_TABLE};
use auth_engine_core::data_access::{field_opt_str, field_str, record, DataAccessPort, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::session::SubjectKind;
use auth_engine_core::token::generate_opaque_token;
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{IDENTITIES_TABLE, SUBJECTS_TABLE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
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

fn code_challenge_for(verifier: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(verifier.as_bytes());
	URL_SAFE_NO_PAD.encode(hasher.finalize())
}

pub struct BeginAuthorizationStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for BeginAuthorizationStep {
	fn name(&self) -> &str {
		"begin-authorization"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["provider", "redirect_uri"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["provider"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let provider_name = input_str(&input, "provider").unwrap_or_default();
		let Some(provider) = self.0.config.providers.get(&provider_name) else {
			return fail(EngineError::NotFound(format!("oidc provider `{provider_name}`")));
		};
		let redirect_uri = input_str(&input, "redirect_uri").unwrap_or_else(|| provider.redirect_uri.clone());

		let state = generate_opaque_token();
		let nonce = generate_opaque_token();
		let code_verifier = generate_opaque_token();
		let code_challenge = code_challenge_for(&code_verifier);
		let expires_at = Utc::now() + ChronoDuration::milliseconds(self.0.config.state_ttl_ms as i64);

		ctx.orm
			.create(
				PENDING_REQUESTS_TABLE,
				record([
					("state", json!(state)),
					("provider", json!(provider_name)),
					("code_verifier", json!(code_verifier)),
					("nonce", json!(nonce.clone())),
					("redirect_uri", json!(redirect_uri.clone())),
					("expires_at", json!(expires_at.to_rfc3339())),
					("used_at", json!(Option::<String>::None)),
				]),
			)
			.await?;

		let scope = provider.scopes.join("%20");
		let authorization_url = format!(
			"{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&nonce={}&code_challenge={}&code_challenge_method=S256",
			provider.authorization_endpoint, provider.client_id, redirect_uri, scope, state, nonce, code_challenge
		);

		Ok(StepOutput::ok("ok", "authorization url issued")
			.with_other("authorization_url", json!(authorization_url))
			.with_other("state", json!(state)))
	}
}

pub struct CallbackStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for CallbackStep {
	fn name(&self) -> &str {
		"callback"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["code", "state"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["code", "state"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let code = input_str(&input, "code").unwrap_or_default();
		let state = input_str(&input, "state").unwrap_or_default();

		let pending = ctx.orm.find_first(PENDING_REQUESTS_TABLE, FindOptions::new().where_clause(Predicate::eq("state", json!(state)))).await?;
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

		let provider_name = field_str(&pending, "provider")?;
		let Some(provider) = self.0.config.providers.get(&provider_name) else {
			return Err(EngineError::Internal(format!("oidc provider `{provider_name}` vanished from config between begin and callback")));
		};
		let code_verifier = field_str(&pending, "code_verifier")?;
		let nonce = field_str(&pending, "nonce")?;
		let redirect_uri = field_str(&pending, "redirect_uri")?;

		let response = self.0.exchange_code.exchange(provider, &code, &code_verifier, &redirect_uri).await?;
		let claims = response.id_token_claims;

		let issuer = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
		if issuer != provider.issuer {
			return fail(EngineError::InvalidCredentials);
		}
		let audience = claims.get("aud").and_then(Value::as_str).unwrap_or_default();
		if audience != provider.client_id {
			return fail(EngineError::InvalidCredentials);
		}
		let claimed_nonce = claims.get("nonce").and_then(Value::as_str).unwrap_or_default();
		if claimed_nonce != nonce {
			return fail(EngineError::InvalidCredentials);
		}
		let exp = claims.get("exp").and_then(Value::as_i64).unwrap_or(0);
		if exp <= Utc::now().timestamp() {
			return fail(EngineError::Expired);
		}
		let Some(subject_identifier) = claims.get("sub").and_then(Value::as_str) else {
			return fail(EngineError::InvalidCredentials);
		};

		let provider_tag = provider_tag(&provider_name);
		let identity = ctx
			.orm
			.find_first(
				IDENTITIES_TABLE,
				FindOptions::new().where_clause(Predicate::eq("provider", json!(provider_tag.clone())).and(Predicate::eq("identifier", json!(subject_identifier)))),
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
							("provider", json!(provider_tag)),
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
	use crate::OidcPlugin;
	use auth_engine_config::{OidcConfig, OidcConfigLayer, OidcProviderConfigLayer};
	use auth_engine_core::data_access::SqliteDataAccessPort;
	use auth_engine_core::engine::EngineBuilder;
	use auth_engine_core::token::TokenCodec;
	use futures::future::BoxFuture;
	use std::collections::HashMap;

	fn test_config() -> OidcConfig {
		let mut providers = HashMap::new();
		providers.insert(
			"google".to_string(),
			OidcProviderConfigLayer {
				client_id: Some("client-1".to_string()),
				client_secret: Some("shh".to_string()),
				authorization_endpoint: Some("https://idp.example.com/authorize".to_string()),
				token_endpoint: Some("https://idp.example.com/token".to_string()),
				redirect_uri: Some("https://app.example.com/callback".to_string()),
				issuer: Some("https://idp.example.com".to_string()),
				scopes: None,
			},
		);
		OidcConfigLayer { providers, ..Default::default() }.finalize().unwrap()
	}

	struct FixedExchange;
	impl ExchangeCodeCallback for FixedExchange {
		fn exchange<'a>(
			&'a self,
			provider: &'a auth_engine_config::OidcProviderConfig,
			_code: &'a str,
			_code_verifier: &'a str,
			_redirect_uri: &'a str,
		) -> BoxFuture<'a, Result<OidcTokenResponse, EngineError>> {
			let issuer = provider.issuer.clone();
			let client_id = provider.client_id.clone();
			Box::pin(async move {
				let mut claims = Map::new();
				claims.insert("iss".to_string(), json!(issuer));
				claims.insert("aud".to_string(), json!(client_id));
				claims.insert("sub".to_string(), json!("user-42"));
				claims.insert("exp".to_string(), json!(Utc::now().timestamp() + 300));
				Ok(OidcTokenResponse { id_token_claims: claims, access_token: None })
			})
		}
	}

	struct WrongNonceExchange;
	impl ExchangeCodeCallback for WrongNonceExchange {
		fn exchange<'a>(
			&'a self,
			provider: &'a auth_engine_config::OidcProviderConfig,
			_code: &'a str,
			_code_verifier: &'a str,
			_redirect_uri: &'a str,
		) -> BoxFuture<'a, Result<OidcTokenResponse, EngineError>> {
			let issuer = provider.issuer.clone();
			let client_id = provider.client_id.clone();
			Box::pin(async move {
				let mut claims = Map::new();
				claims.insert("iss".to_string(), json!(issuer));
				claims.insert("aud".to_string(), json!(client_id));
				claims.insert("sub".to_string(), json!("user-42"));
				claims.insert("nonce".to_string(), json!("not-the-real-nonce"));
				claims.insert("exp".to_string(), json!(Utc::now().timestamp() + 300));
				Ok(OidcTokenResponse { id_token_claims: claims, access_token: None })
			})
		}
	}

	use crate::callback::{ExchangeCodeCallback, OidcTokenResponse};

	async fn engine_with(exchange: Arc<dyn ExchangeCodeCallback>) -> auth_engine_core::engine::Engine {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let plugin = OidcPlugin::new(test_config(), exchange);
		EngineBuilder::new(Arc::clone(&orm), codec).with_plugin(Box::new(plugin)).build().await.unwrap()
	}

	#[tokio::test]
	async fn begin_then_callback_mints_a_session_for_a_new_federated_subject() {
		let engine = engine_with(Arc::new(FixedExchange)).await;

		let mut input = Map::new();
		input.insert("provider".to_string(), json!("google"));
		let begin = engine.execute_step("oidc", "begin-authorization", input).await.unwrap();
		assert!(begin.success);
		let state = begin.others.get("state").and_then(Value::as_str).unwrap().to_string();

		let mut input = Map::new();
		input.insert("code".to_string(), json!("auth-code-1"));
		input.insert("state".to_string(), json!(state.clone()));
		let out = engine.execute_step("oidc", "callback", input).await.unwrap();
		assert!(out.success);
		assert!(out.token.is_some());
		let subject_id = out.subject.unwrap().get("id").and_then(Value::as_str).unwrap().to_string();

		let identity = engine
			.orm()
			.find_first(IDENTITIES_TABLE, FindOptions::new().where_clause(Predicate::eq("identifier", json!("user-42"))))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(field_str(&identity, "subject_id").unwrap(), subject_id);

		// state is single-use
		let mut input = Map::new();
		input.insert("code".to_string(), json!("auth-code-1"));
		input.insert("state".to_string(), json!(state));
		let out2 = engine.execute_step("oidc", "callback", input).await.unwrap();
		assert!(!out2.success);
	}

	#[tokio::test]
	async fn callback_with_unknown_state_fails() {
		let engine = engine_with(Arc::new(FixedExchange)).await;
		let mut input = Map::new();
		input.insert("code".to_string(), json!("c"));
		input.insert("state".to_string(), json!("never-issued"));
		let out = engine.execute_step("oidc", "callback", input).await.unwrap();
		assert!(!out.success);
	}

	#[tokio::test]
	async fn callback_with_mismatched_nonce_is_rejected() {
		let engine = engine_with(Arc::new(WrongNonceExchange)).await;
		let mut input = Map::new();
		input.insert("provider".to_string(), json!("google"));
		let begin = engine.execute_step("oidc", "begin-authorization", input).await.unwrap();
		let state = begin.others.get("state").and_then(Value::as_str).unwrap().to_string();

		let mut input = Map::new();
		input.insert("code".to_string(), json!("c"));
		input.insert("state".to_string(), json!(state));
		let out = engine.execute_step("oidc", "callback", input).await.unwrap();
		assert!(!out.success);
	}
}
