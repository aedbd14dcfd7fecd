// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{Shared, CHALLENGES_TABLE};
use auth_engine_core::data_access::{field_opt_str, field_str, record, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
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

async fn issue_challenge(shared: &Shared, ctx: &StepContext<'_>, purpose: &str, subject_id: Option<&str>) -> Result<StepOutput, EngineError> {
	let challenge = generate_opaque_token();
	let challenge_hash = hash_token(&challenge);
	let expires_at = Utc::now() + ChronoDuration::milliseconds(shared.config.challenge_ttl_ms as i64);

	ctx.orm
		.create(
			CHALLENGES_TABLE,
			record([
				("challenge_hash", json!(challenge_hash)),
				("purpose", json!(purpose)),
				("subject_id", json!(subject_id)),
				("rp_id", json!(shared.config.rp_id)),
				("expires_at", json!(expires_at.to_rfc3339())),
				("used_at", json!(Option::<String>::None)),
			]),
		)
		.await?;

	Ok(StepOutput::ok("ok", "challenge issued")
		.with_other("challenge", json!(challenge))
		.with_other("rp_id", json!(shared.config.rp_id))
		.with_other("rp_name", json!(shared.config.rp_name)))
}

/// Consumes (single-use) a pending challenge of the expected `purpose`,
/// returning the error the caller should surface on a miss/expiry/reuse.
async fn consume_challenge(ctx: &StepContext<'_>, purpose: &str, challenge: &str) -> Result<Result<(), EngineError>, EngineError> {
	let challenge_hash = hash_token(challenge);
	let row = ctx
		.orm
		.find_first(
			CHALLENGES_TABLE,
			FindOptions::new().where_clause(Predicate::eq("challenge_hash", json!(challenge_hash)).and(Predicate::eq("purpose", json!(purpose)))),
		)
		.await?;
	let Some(row) = row else {
		return Ok(Err(EngineError::InvalidCredentials));
	};
	if field_opt_str(&row, "used_at").is_some() {
		return Ok(Err(EngineError::Expired));
	}
	let expires_at = parse_rfc3339(&field_str(&row, "expires_at")?)?;
	if Utc::now() >= expires_at {
		return Ok(Err(EngineError::Expired));
	}

	let row_id = field_str(&row, "id")?;
	ctx.orm
		.update_many(
			CHALLENGES_TABLE,
			UpdateOptions {
				where_: Some(Predicate::eq("id", json!(row_id.clone()))),
				set: record([("used_at", json!(Utc::now().to_rfc3339()))]),
			},
		)
		.await?;
	ctx.orm
		.delete_many(
			CHALLENGES_TABLE,
			DeleteOptions {
				where_: Some(Predicate::eq("id", json!(row_id))),
			},
		)
		.await
		.ok();
	Ok(Ok(()))
}

pub struct BeginRegistrationStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for BeginRegistrationStep {
	fn name(&self) -> &str {
		"begin-registration"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["subject_id"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["subject_id"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let subject_id = input_str(&input, "subject_id").unwrap_or_default();
		issue_challenge(&self.0, ctx, "registration", Some(&subject_id)).await
	}
}

pub struct FinishRegistrationStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for FinishRegistrationStep {
	fn name(&self) -> &str {
		"finish-registration"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["subject_id", "challenge", "attestation_object", "client_data_json"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["challenge", "attestation_object", "client_data_json"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let challenge = input_str(&input, "challenge").unwrap_or_default();
		match consume_challenge(ctx, "registration", &challenge).await? {
			Ok(()) => Ok(StepOutput::fail("not_implemented", "attestation verification is not implemented")),
			Err(err) => fail(err),
		}
	}
}

pub struct BeginAuthenticationStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for BeginAuthenticationStep {
	fn name(&self) -> &str {
		"begin-authentication"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["subject_id"]
	}

	fn validate_input(&self, _input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		Ok(())
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let subject_id = input_str(&input, "subject_id");
		issue_challenge(&self.0, ctx, "authentication", subject_id.as_deref()).await
	}
}

pub struct FinishAuthenticationStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for FinishAuthenticationStep {
	fn name(&self) -> &str {
		"finish-authentication"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["challenge", "authenticator_data", "client_data_json", "signature"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["challenge", "authenticator_data", "client_data_json", "signature"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let challenge = input_str(&input, "challenge").unwrap_or_default();
		match consume_challenge(ctx, "authentication", &challenge).await? {
			Ok(()) => Ok(StepOutput::fail("not_implemented", "assertion verification is not implemented")),
			Err(err) => fail(err),
		}
	}
}
