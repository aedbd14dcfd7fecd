// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{Shared, VERIFICATION_CODES_TABLE};
use auth_engine_core::data_access::{field_i64, field_opt_str, field_str, record, DeleteOptions, FindOptions, Predicate, UpdateOptions};
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_core::session::SubjectKind;
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common::{IDENTITIES_TABLE, SUBJECTS_TABLE};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
	Phone,
	Email,
	WhatsApp,
}

impl Destination {
	fn as_str(self) -> &'static str {
		match self {
			Destination::Phone => "phone",
			Destination::Email => "email",
			Destination::WhatsApp => "whatsapp",
		}
	}

	fn parse(value: &str) -> Option<Self> {
		match value {
			"phone" => Some(Destination::Phone),
			"email" => Some(Destination::Email),
			"whatsapp" => Some(Destination::WhatsApp),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
	Login,
	Register,
	Verify,
}

impl CodePurpose {
	fn as_str(self) -> &'static str {
		match self {
			CodePurpose::Login => "login",
			CodePurpose::Register => "register",
			CodePurpose::Verify => "verify",
		}
	}

	fn parse(value: &str) -> Option<Self> {
		match value {
			"login" => Some(CodePurpose::Login),
			"register" => Some(CodePurpose::Register),
			"verify" => Some(CodePurpose::Verify),
			_ => None,
		}
	}
}

/// Injected notification delivery for passwordless codes, routed by
/// destination channel and purpose.
pub trait SendPasswordlessCodeCallback: Send + Sync {
	fn send<'a>(&'a self, destination: &'a str, destination_type: Destination, code: &'a str, purpose: CodePurpose) -> BoxFuture<'a, Result<(), EngineError>>;
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

fn generate_code(length: u8) -> String {
	let mut rng = rand::thread_rng();
	(0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}

async fn find_identity(orm: &dyn auth_engine_core::data_access::DataAccessPort, destination_type: Destination, destination: &str) -> Result<Option<auth_engine_core::data_access::Record>, EngineError> {
	orm.find_first(
		IDENTITIES_TABLE,
		FindOptions::new().where_clause(Predicate::eq("provider", json!(destination_type.as_str())).and(Predicate::eq("identifier", json!(destination)))),
	)
	.await
}

pub struct SendCodeStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for SendCodeStep {
	fn name(&self) -> &str {
		"send-code"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["destination", "destination_type", "purpose"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["destination", "destination_type", "purpose"])?;
		let mut violations = Vec::new();
		if let Some(dt) = input_str(input, "destination_type") {
			if Destination::parse(&dt).is_none() {
				violations.push(FieldViolation {
					field: "destination_type".to_string(),
					reason: "must be one of phone, email, whatsapp".to_string(),
				});
			}
		}
		if let Some(p) = input_str(input, "purpose") {
			if CodePurpose::parse(&p).is_none() {
				violations.push(FieldViolation {
					field: "purpose".to_string(),
					reason: "must be one of login, register, verify".to_string(),
				});
			}
		}
		if violations.is_empty() {
			Ok(())
		} else {
			Err(violations)
		}
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let destination = input_str(&input, "destination").unwrap_or_default();
		let destination_type = Destination::parse(&input_str(&input, "destination_type").unwrap_or_default()).expect("validated");
		let purpose = CodePurpose::parse(&input_str(&input, "purpose").unwrap_or_default()).expect("validated");
		let send_code = self.0.send_code.as_deref().expect("send_code is required and validated at construction");

		let identity = find_identity(ctx.orm, destination_type, &destination).await?;

		let subject_id = match (purpose, &identity) {
			(CodePurpose::Login, None) => {
				// Anti-enumeration: report success but send nothing.
				return Ok(StepOutput::ok("ok", "if the destination is registered, a code has been sent"));
			}
			(CodePurpose::Login, Some(identity)) => Some(field_str(identity, "subject_id")?),
			(CodePurpose::Verify, None) => return fail(EngineError::NotFound(destination_type.as_str().to_string())),
			(CodePurpose::Verify, Some(identity)) => Some(field_str(identity, "subject_id")?),
			(CodePurpose::Register, Some(_)) => {
				return fail(EngineError::Conflict(format!("{destination} is already registered")));
			}
			(CodePurpose::Register, None) => None,
		};

		let code = generate_code(self.0.config.code_length);
		let code_hash = self.0.hasher.hash(code.clone().into()).await?;
		let expires_at = Utc::now() + ChronoDuration::milliseconds(self.0.config.code_expires_in_ms as i64);

		ctx.orm
			.create(
				VERIFICATION_CODES_TABLE,
				record([
					("subject_id", json!(subject_id)),
					("code_hash", json!(code_hash)),
					("destination", json!(destination)),
					("destination_type", json!(destination_type.as_str())),
					("purpose", json!(purpose.as_str())),
					("expires_at", json!(expires_at.to_rfc3339())),
					("used_at", json!(Option::<String>::None)),
					("attempts", json!(0)),
					("max_attempts", json!(self.0.config.max_verification_attempts)),
				]),
			)
			.await?;

		send_code.send(&destination, destination_type, &code, purpose).await?;
		Ok(StepOutput::ok("ok", "if the destination is registered, a code has been sent"))
	}
}

pub struct VerifyCodeStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for VerifyCodeStep {
	fn name(&self) -> &str {
		"verify-code"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["destination", "destination_type", "code"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["destination", "destination_type", "code"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let destination = input_str(&input, "destination").unwrap_or_default();
		let destination_type_str = input_str(&input, "destination_type").unwrap_or_default();
		let Some(destination_type) = Destination::parse(&destination_type_str) else {
			return Ok(StepOutput::fail("validation", "destination_type must be one of phone, email, whatsapp"));
		};
		let code = input_str(&input, "code").unwrap_or_default();

		let candidates = ctx
			.orm
			.find_many(
				VERIFICATION_CODES_TABLE,
				FindOptions::new().where_clause(
					Predicate::eq("destination", json!(destination))
						.and(Predicate::eq("destination_type", json!(destination_type.as_str())))
						.and(Predicate::eq("used_at", Value::Null)),
				),
			)
			.await?;

		let mut matched = None;
		for candidate in candidates {
			let expires_at = parse_rfc3339(&field_str(&candidate, "expires_at")?)?;
			if Utc::now() >= expires_at {
				continue;
			}
			let attempts = field_i64(&candidate, "attempts")?;
			let max_attempts = field_i64(&candidate, "max_attempts")?;
			if attempts >= max_attempts {
				continue;
			}
			matched = Some(candidate);
			break;
		}
		let Some(candidate) = matched else {
			return fail(EngineError::InvalidCredentials);
		};

		let candidate_id = field_str(&candidate, "id")?;
		let code_hash = field_str(&candidate, "code_hash")?;
		if !self.0.hasher.verify(code.into(), code_hash).await? {
			let attempts = field_i64(&candidate, "attempts")?;
			ctx.orm
				.update_many(
					VERIFICATION_CODES_TABLE,
					UpdateOptions {
						where_: Some(Predicate::eq("id", json!(candidate_id))),
						set: record([("attempts", json!(attempts + 1))]),
					},
				)
				.await?;
			return fail(EngineError::InvalidCredentials);
		}

		ctx.orm
			.update_many(
				VERIFICATION_CODES_TABLE,
				UpdateOptions {
					where_: Some(Predicate::eq("id", json!(candidate_id))),
					set: record([("used_at", json!(Utc::now().to_rfc3339()))]),
				},
			)
			.await?;
		ctx.orm
			.delete_many(
				VERIFICATION_CODES_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("id", json!(candidate_id))),
				},
			)
			.await
			.ok();

		let purpose = CodePurpose::parse(&field_str(&candidate, "purpose")?);
		let subject_id = match field_opt_str(&candidate, "subject_id") {
			Some(subject_id) => {
				if purpose == Some(CodePurpose::Verify) {
					ctx.orm
						.update_many(
							IDENTITIES_TABLE,
							UpdateOptions {
								where_: Some(Predicate::eq("provider", json!(destination_type.as_str())).and(Predicate::eq("subject_id", json!(subject_id)))),
								set: record([("verified", json!(true)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
							},
						)
						.await?;
				}
				subject_id
			}
			None => {
				let new_subject_id = uuid::Uuid::new_v4().to_string();
				let now = Utc::now().to_rfc3339();
				ctx.orm.create(SUBJECTS_TABLE, record([("id", json!(new_subject_id)), ("created_at", json!(now.clone()))])).await?;
				ctx.orm
					.create(
						IDENTITIES_TABLE,
						record([
							("subject_id", json!(new_subject_id)),
							("provider", json!(destination_type.as_str())),
							("identifier", json!(destination)),
							("verified", json!(true)),
							("created_at", json!(now.clone())),
							("updated_at", json!(now)),
						]),
					)
					.await?;
				new_subject_id
			}
		};

		let token = ctx.sessions.create_session_for(SubjectKind::subject(), &subject_id, self.0.config.session_ttl_seconds).await?;
		let mut subject = Map::new();
		subject.insert("id".to_string(), json!(subject_id));
		Ok(StepOutput::ok("ok", "verified").with_subject(subject).with_token(token))
	}
}
