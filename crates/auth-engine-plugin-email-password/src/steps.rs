// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::Shared;
use auth_engine_core::plugin::{FieldViolation, Step, StepContext, StepOutput};
use auth_engine_errors::EngineError;
use auth_engine_plugin_password_common as common;
use auth_engine_plugin_password_common::ProviderSpec;
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

/// Turns an expected `EngineError` into the uniform step-output envelope;
/// only genuinely internal failures (bugs, infra) propagate as `Err` past
/// a step's `run`, per the plugin runtime's convention.
fn fail(err: EngineError, friendly: Option<&str>) -> Result<StepOutput, EngineError> {
	if err.is_internal() {
		return Err(err);
	}
	let message = match (&err, friendly) {
		(EngineError::InvalidCredentials | EngineError::NotFound(_), Some(friendly)) => friendly.to_string(),
		_ => err.to_string(),
	};
	Ok(StepOutput::fail(err.status_tag(), message))
}

pub struct RegisterStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for RegisterStep {
	fn name(&self) -> &str {
		"register"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email", "password"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email", "password"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();
		let password = input_str(&input, "password").unwrap_or_default();
		let policy = self.0.policy();

		let outcome = common::register(
			ctx.orm,
			&self.0.hasher,
			ctx.sessions,
			&ProviderSpec::EMAIL,
			&policy,
			&email,
			password.into(),
			self.0.send_code.as_deref(),
		)
		.await;

		match outcome {
			Ok(outcome) => {
				let mut subject = Map::new();
				subject.insert("id".to_string(), json!(outcome.subject_id));
				subject.insert("email".to_string(), json!(email));
				subject.insert("email_verified".to_string(), json!(outcome.verified));
				let status = if outcome.verified { "ok" } else { "verification_required" };
				let mut out = StepOutput::ok(status, "registered").with_subject(subject);
				if let Some(token) = outcome.token {
					out = out.with_token(token);
				}
				Ok(out)
			}
			Err(err) => fail(err, None),
		}
	}
}

pub struct LoginStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for LoginStep {
	fn name(&self) -> &str {
		"login"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email", "password"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email", "password"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();
		let password: auth_engine_secret::SecretString = input_str(&input, "password").unwrap_or_default().into();
		let policy = self.0.policy();
		let fixtures = self.0.test_user_fixtures();

		let outcome = common::login(ctx.orm, &self.0.hasher, ctx.sessions, &ProviderSpec::EMAIL, &policy, &fixtures, &email, &password).await;

		match outcome {
			Ok(common::LoginOutcome::Success { subject_id, token }) => {
				let mut subject = Map::new();
				subject.insert("id".to_string(), json!(subject_id));
				Ok(StepOutput::ok("ok", "logged in").with_subject(subject).with_token(token))
			}
			Ok(common::LoginOutcome::VerificationRequired { subject_id }) => {
				let mut subject = Map::new();
				subject.insert("id".to_string(), json!(subject_id));
				Ok(StepOutput::fail("verification_required", "email verification required").with_subject(subject))
			}
			Err(err) => fail(err, Some("Invalid email or password")),
		}
	}
}

pub struct VerifyEmailStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for VerifyEmailStep {
	fn name(&self) -> &str {
		"verify-email"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email", "code"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email", "code"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();
		let code = input_str(&input, "code").unwrap_or_default();
		let policy = self.0.policy();

		match common::verify_code(ctx.orm, &self.0.hasher, &ProviderSpec::EMAIL, &policy, &email, &code).await {
			Ok(()) => Ok(StepOutput::ok("ok", "email verified")),
			Err(err) => fail(err, Some("Invalid or expired code")),
		}
	}
}

pub struct SendResetPasswordStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for SendResetPasswordStep {
	fn name(&self) -> &str {
		"send-reset-password"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();
		let policy = self.0.policy();
		let send_code = self.0.send_code.as_deref().expect("send_code is required and validated at construction");

		match common::send_reset_password(ctx.orm, &self.0.hasher, &ProviderSpec::EMAIL, &policy, &email, send_code).await {
			Ok(()) => Ok(StepOutput::ok("ok", "if the account exists, a reset code has been sent")),
			Err(err) => fail(err, None),
		}
	}
}

pub struct ResetPasswordStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ResetPasswordStep {
	fn name(&self) -> &str {
		"reset-password"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["email", "code", "new_password"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["email", "code", "new_password"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let email = input_str(&input, "email").unwrap_or_default();
		let code = input_str(&input, "code").unwrap_or_default();
		let new_password = input_str(&input, "new_password").unwrap_or_default();

		match common::reset_password(ctx.orm, &self.0.hasher, &ProviderSpec::EMAIL, &email, &code, new_password.into()).await {
			Ok(()) => Ok(StepOutput::ok("ok", "password reset")),
			Err(err) => fail(err, Some("Invalid or expired code")),
		}
	}
}

pub struct ChangePasswordStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ChangePasswordStep {
	fn name(&self) -> &str {
		"change-password"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "current_password", "new_password"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "current_password", "new_password"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let current_password = input_str(&input, "current_password").unwrap_or_default();
		let new_password = input_str(&input, "new_password").unwrap_or_default();

		let check = ctx.sessions.check_session(&token).await?;
		if !check.valid {
			return Ok(StepOutput::fail("unauth", "session is not valid"));
		}
		let subject_id = check
			.subject
			.as_ref()
			.and_then(|s| s.get("id"))
			.and_then(Value::as_str)
			.map(str::to_string)
			.ok_or_else(|| EngineError::Internal("valid session has no resolvable subject id".to_string()))?;

		match common::change_password(ctx.orm, &self.0.hasher, &subject_id, current_password.into(), new_password.into()).await {
			Ok(()) => Ok(StepOutput::ok("ok", "password changed")),
			Err(err) => fail(err, Some("current password is incorrect")),
		}
	}
}

pub struct ChangeEmailStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ChangeEmailStep {
	fn name(&self) -> &str {
		"change-email"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "current_password", "new_email"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "current_password", "new_email"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let current_password = input_str(&input, "current_password").unwrap_or_default();
		let new_email = input_str(&input, "new_email").unwrap_or_default();
		let policy = self.0.policy();

		let check = ctx.sessions.check_session(&token).await?;
		if !check.valid {
			return Ok(StepOutput::fail("unauth", "session is not valid"));
		}
		let subject_id = check
			.subject
			.as_ref()
			.and_then(|s| s.get("id"))
			.and_then(Value::as_str)
			.map(str::to_string)
			.ok_or_else(|| EngineError::Internal("valid session has no resolvable subject id".to_string()))?;

		if self.0.config.verify_email {
			let send_code = self.0.send_code.as_deref().expect("send_code is required and validated at construction");
			match common::begin_identifier_change(
				ctx.orm,
				&self.0.hasher,
				&ProviderSpec::EMAIL,
				&policy,
				&subject_id,
				current_password.into(),
				&new_email,
				send_code,
			)
			.await
			{
				Ok(()) => Ok(StepOutput::ok("verification_required", "confirmation code sent to the new address")),
				Err(err) => fail(err, None),
			}
		} else {
			match common::change_identifier_unverified(ctx.orm, &self.0.hasher, &ProviderSpec::EMAIL, &subject_id, current_password.into(), &new_email).await {
				Ok(()) => Ok(StepOutput::ok("ok", "email changed")),
				Err(err) => fail(err, None),
			}
		}
	}
}

pub struct ConfirmChangeEmailStep(pub Arc<Shared>);

#[async_trait::async_trait]
impl Step for ConfirmChangeEmailStep {
	fn name(&self) -> &str {
		"confirm-change-email"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token", "code"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token", "code"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		let code = input_str(&input, "code").unwrap_or_default();

		let check = ctx.sessions.check_session(&token).await?;
		if !check.valid {
			return Ok(StepOutput::fail("unauth", "session is not valid"));
		}
		let subject_id = check
			.subject
			.as_ref()
			.and_then(|s| s.get("id"))
			.and_then(Value::as_str)
			.map(str::to_string)
			.ok_or_else(|| EngineError::Internal("valid session has no resolvable subject id".to_string()))?;

		match common::confirm_identifier_change(ctx.orm, &self.0.hasher, &ProviderSpec::EMAIL, &subject_id, &code).await {
			Ok(()) => Ok(StepOutput::ok("ok", "email changed")),
			Err(err) => fail(err, Some("Invalid or expired code")),
		}
	}
}

pub struct LogoutStep;

#[async_trait::async_trait]
impl Step for LogoutStep {
	fn name(&self) -> &str {
		"logout"
	}

	fn inputs(&self) -> Vec<&'static str> {
		vec!["token"]
	}

	fn validate_input(&self, input: &Map<String, Value>) -> Result<(), Vec<FieldViolation>> {
		require(input, &["token"])
	}

	async fn run(&self, input: Map<String, Value>, ctx: &StepContext<'_>) -> Result<StepOutput, EngineError> {
		let token = input_str(&input, "token").unwrap_or_default();
		// Idempotent and never leaks whether the token was valid.
		ctx.sessions.destroy_session(&token).await?;
		Ok(StepOutput::ok("ok", "logged out"))
	}
}
