// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Credential machinery shared by the `email-password` and `phone-password`
//! plugins: register, login, verify, reset, change-password, and
//! change-identifier, parameterized over which provider (`email` or
//! `phone`) owns the identifier.
//!
//! Both plugins mirror the same state machine (register -> verify ->
//! login -> change/reset) with only the identifier's validation rule and
//! the provider tag differing, so the machinery lives here once and each
//! plugin crate supplies its own identifier validator, step wiring, and
//! config section.

use auth_engine_core::data_access::{
	field_bool, field_i64, field_opt_str, field_str, record, DataAccessPort, DeleteOptions, FindOptions, Predicate,
	Record, UpdateOptions, UpsertOptions,
};
use auth_engine_core::hasher::CredentialHasher;
use auth_engine_core::session::{SessionService, SubjectKind};
use auth_engine_errors::EngineError;
use auth_engine_secret::SecretString;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::json;

pub const SUBJECTS_TABLE: &str = "subjects";
pub const IDENTITIES_TABLE: &str = "identities";
pub const CREDENTIALS_TABLE: &str = "credentials";
pub const PASSWORD_RESET_CODES_TABLE: &str = "password_reset_codes";

/// Which provider this instantiation of the shared machinery is running
/// for, and the name of its provider-metadata table.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
	pub provider: &'static str,
	pub metadata_table: &'static str,
}

impl ProviderSpec {
	pub const EMAIL: ProviderSpec = ProviderSpec {
		provider: "email",
		metadata_table: "email_identities",
	};
	pub const PHONE: ProviderSpec = ProviderSpec {
		provider: "phone",
		metadata_table: "phone_identities",
	};

	/// Normalizes an identifier the way it is compared/stored, per the
	/// data-access port's "case-insensitive identifier comparisons for
	/// providers named email/username" ordering rule: lower-cased for
	/// `email`/`username`, left untouched for everything else (`phone`
	/// numbers are not case-folded).
	pub fn normalize_identifier(&self, identifier: &str) -> String {
		if self.provider == "email" || self.provider == "username" {
			identifier.to_lowercase()
		} else {
			identifier.to_string()
		}
	}
}

/// The policy knobs both plugins resolve from their own config section into
/// this shared shape.
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
	pub verify_identity: bool,
	pub login_on_register: bool,
	pub session_ttl_seconds: u64,
	pub code_length: u8,
	pub verification_code_expires_in_ms: u64,
	pub reset_password_code_expires_in_ms: u64,
	pub max_verification_attempts: u32,
}

/// What a code is being sent for, passed to the injected delivery callback
/// so a single callback can route by purpose (different template/channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
	Verification,
	Reset,
	ChangeIdentifier,
}

/// Injected notification delivery. Implementations are transport-specific
/// (SMTP, SMS gateway) and out of scope for this core; this crate only
/// ever calls it bounded by the caller-supplied timeout.
pub trait SendCodeCallback: Send + Sync {
	fn send<'a>(&'a self, identifier: &'a str, code: &'a str, purpose: CodePurpose) -> BoxFuture<'a, Result<(), EngineError>>;
}

fn generate_numeric_code(length: u8) -> String {
	let mut rng = rand::thread_rng();
	(0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}

fn expiry_from_ms(ms: u64) -> DateTime<Utc> {
	Utc::now() + ChronoDuration::milliseconds(ms as i64)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, EngineError> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| EngineError::Internal(format!("malformed timestamp `{value}`: {e}")))
}

/// Looks up an identity by `(provider, identifier)`. `identifier` is
/// normalized per [`ProviderSpec::normalize_identifier`] before comparison,
/// matching the same normalization applied to the stored value at
/// creation/update time, so `A@x.com` and `a@x.com` resolve to the same row.
async fn find_identity(orm: &dyn DataAccessPort, spec: &ProviderSpec, identifier: &str) -> Result<Option<Record>, EngineError> {
	let identifier = spec.normalize_identifier(identifier);
	orm.find_first(
		IDENTITIES_TABLE,
		FindOptions::new().where_clause(
			Predicate::eq("provider", json!(spec.provider)).and(Predicate::eq("identifier", json!(identifier))),
		),
	)
	.await
}

async fn find_metadata(orm: &dyn DataAccessPort, spec: &ProviderSpec, identity_id: &str) -> Result<Option<Record>, EngineError> {
	orm.find_first(
		spec.metadata_table,
		FindOptions::new().where_clause(Predicate::eq("identity_id", json!(identity_id))),
	)
	.await
}

async fn find_credential(orm: &dyn DataAccessPort, subject_id: &str) -> Result<Record, EngineError> {
	orm.find_first(CREDENTIALS_TABLE, FindOptions::new().where_clause(Predicate::eq("subject_id", json!(subject_id))))
		.await?
		.ok_or_else(|| EngineError::Internal(format!("subject `{subject_id}` has no credential row")))
}

/// Outcome of a successful `register` call.
pub struct RegisterOutcome {
	pub subject_id: String,
	pub token: Option<String>,
	pub verified: bool,
}

/// `register`: create subject + credential + unverified identity, optionally
/// send a verification code and/or mint a session. See module docs for the
/// shared flow both plugins drive through here.
#[allow(clippy::too_many_arguments)]
pub async fn register(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	sessions: &SessionService,
	spec: &ProviderSpec,
	policy: &PasswordPolicy,
	identifier: &str,
	password: SecretString,
	send_code: Option<&dyn SendCodeCallback>,
) -> Result<RegisterOutcome, EngineError> {
	if policy.verify_identity && send_code.is_none() {
		return Err(EngineError::Config(vec![format!(
			"{} verification is enabled but no send_code callback is configured",
			spec.provider
		)]));
	}

	let identifier = spec.normalize_identifier(identifier);
	let identifier = identifier.as_str();
	if find_identity(orm, spec, identifier).await?.is_some() {
		return Err(EngineError::Conflict(format!("{} `{identifier}` is already registered", spec.provider)));
	}

	if hasher.check_password_safety(password.expose_str()).await? {
		return Err(EngineError::InvalidCredentials);
	}

	let subject_id = uuid::Uuid::new_v4().to_string();
	let now = Utc::now().to_rfc3339();
	orm.create(SUBJECTS_TABLE, record([("id", json!(subject_id)), ("created_at", json!(now))]))
		.await?;

	let password_hash = hasher.hash(password).await?;
	orm.create(
		CREDENTIALS_TABLE,
		record([
			("subject_id", json!(subject_id)),
			("password_hash", json!(password_hash)),
			("created_at", json!(now)),
			("updated_at", json!(now)),
		]),
	)
	.await?;

	let identity = orm
		.create(
			IDENTITIES_TABLE,
			record([
				("subject_id", json!(subject_id)),
				("provider", json!(spec.provider)),
				("identifier", json!(identifier)),
				("verified", json!(false)),
				("created_at", json!(now)),
				("updated_at", json!(now)),
			]),
		)
		.await?;

	if policy.verify_identity {
		let identity_id = field_str(&identity, "id")?;
		let code = generate_numeric_code(policy.code_length);
		let code_hash = hasher.hash(code.clone().into()).await?;
		orm.create(
			spec.metadata_table,
			record([
				("identity_id", json!(identity_id)),
				("code_hash", json!(code_hash)),
				("code_expires_at", json!(expiry_from_ms(policy.verification_code_expires_in_ms).to_rfc3339())),
				("code_attempts", json!(0)),
			]),
		)
		.await?;
		if let Some(callback) = send_code {
			callback.send(identifier, &code, CodePurpose::Verification).await?;
		}
	}

	let token = if policy.login_on_register {
		Some(
			sessions
				.create_session_for(SubjectKind::subject(), &subject_id, policy.session_ttl_seconds)
				.await?,
		)
	} else {
		None
	};

	Ok(RegisterOutcome {
		subject_id,
		token,
		verified: !policy.verify_identity,
	})
}

pub enum LoginOutcome {
	Success { subject_id: String, token: String },
	VerificationRequired { subject_id: String },
}

/// A development-only fixture credential, checked before any data-access
/// lookup. Plaintext comparison is acceptable here: these only exist
/// outside `production` (enforced at config-construction time).
pub struct TestUserFixture<'a> {
	pub identifier: &'a str,
	pub password: &'a str,
}

/// `login`: test-user fixtures first, then identity + credential lookup,
/// constant-time password verification, and either a fresh verification
/// code (`VerificationRequired`) or a minted session (`Success`).
///
/// Any lookup miss and any password mismatch both surface as
/// `EngineError::InvalidCredentials` — the anti-enumeration contract is
/// enforced by the caller mapping both to the same `"ip"` status tag, not
/// by this function distinguishing them.
pub async fn login(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	sessions: &SessionService,
	spec: &ProviderSpec,
	policy: &PasswordPolicy,
	test_users: &[TestUserFixture<'_>],
	identifier: &str,
	password: &SecretString,
) -> Result<LoginOutcome, EngineError> {
	let identifier = spec.normalize_identifier(identifier);
	let identifier = identifier.as_str();
	if let Some(fixture) = test_users.iter().find(|u| spec.normalize_identifier(u.identifier) == identifier) {
		if fixture.password == password.expose_str() {
			let subject_id = format!("test-user:{identifier}");
			let token = sessions
				.create_session_for(SubjectKind::subject(), &subject_id, policy.session_ttl_seconds)
				.await?;
			return Ok(LoginOutcome::Success { subject_id, token });
		}
		return Err(EngineError::InvalidCredentials);
	}

	let identity = find_identity(orm, spec, identifier).await?.ok_or(EngineError::InvalidCredentials)?;
	let subject_id = field_str(&identity, "subject_id")?;
	let credential = find_credential(orm, &subject_id).await?;
	let password_hash = field_str(&credential, "password_hash")?;

	if !hasher.verify(password.clone(), password_hash).await? {
		return Err(EngineError::InvalidCredentials);
	}

	let verified = field_bool(&identity, "verified")?;
	if policy.verify_identity && !verified {
		let identity_id = field_str(&identity, "id")?;
		let code = generate_numeric_code(policy.code_length);
		let code_hash = hasher.hash(code.into()).await?;
		orm.upsert(
			spec.metadata_table,
			UpsertOptions {
				where_: Predicate::eq("identity_id", json!(identity_id)),
				create: record([
					("identity_id", json!(identity_id)),
					("code_hash", json!(code_hash.clone())),
					("code_expires_at", json!(expiry_from_ms(policy.verification_code_expires_in_ms).to_rfc3339())),
					("code_attempts", json!(0)),
				]),
				update: record([
					("code_hash", json!(code_hash)),
					("code_expires_at", json!(expiry_from_ms(policy.verification_code_expires_in_ms).to_rfc3339())),
					("code_attempts", json!(0)),
				]),
			},
		)
		.await?;
		return Ok(LoginOutcome::VerificationRequired { subject_id });
	}

	let token = sessions
		.create_session_for(SubjectKind::subject(), &subject_id, policy.session_ttl_seconds)
		.await?;
	Ok(LoginOutcome::Success { subject_id, token })
}

/// `verify-email` / `verify-phone`: compares the presented code against the
/// stored hash, bumping `code_attempts` on every failed attempt and
/// rejecting once `max_attempts` is reached.
pub async fn verify_code(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	policy: &PasswordPolicy,
	identifier: &str,
	code: &str,
) -> Result<(), EngineError> {
	let identity = find_identity(orm, spec, identifier).await?.ok_or_else(|| EngineError::NotFound(spec.provider.to_string()))?;
	let identity_id = field_str(&identity, "id")?;
	let metadata = find_metadata(orm, spec, &identity_id).await?.ok_or(EngineError::Expired)?;

	let attempts = field_i64(&metadata, "code_attempts")?;
	if attempts >= policy.max_verification_attempts as i64 {
		return Err(EngineError::RateLimited("verification attempts exhausted".to_string()));
	}

	let expires_at = parse_rfc3339(&field_str(&metadata, "code_expires_at")?)?;
	if Utc::now() >= expires_at {
		return Err(EngineError::Expired);
	}

	let code_hash = field_str(&metadata, "code_hash")?;
	if !hasher.verify(code.to_string().into(), code_hash).await? {
		orm.update_many(
			spec.metadata_table,
			UpdateOptions {
				where_: Some(Predicate::eq("identity_id", json!(identity_id))),
				set: record([("code_attempts", json!(attempts + 1))]),
			},
		)
		.await?;
		return Err(EngineError::InvalidCredentials);
	}

	orm.update_many(
		IDENTITIES_TABLE,
		UpdateOptions {
			where_: Some(Predicate::eq("id", json!(identity_id))),
			set: record([("verified", json!(true)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
		},
	)
	.await?;
	orm.delete_many(
		spec.metadata_table,
		DeleteOptions {
			where_: Some(Predicate::eq("identity_id", json!(identity_id))),
		},
	)
	.await?;
	Ok(())
}

/// `send-reset-password`: silently succeeds (sending nothing) when the
/// identifier doesn't exist, per the anti-enumeration contract — callers
/// must not branch on this function's `Ok`/`Err` to decide what to tell the
/// caller; always report success upward.
pub async fn send_reset_password(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	policy: &PasswordPolicy,
	identifier: &str,
	send_code: &dyn SendCodeCallback,
) -> Result<(), EngineError> {
	let Some(identity) = find_identity(orm, spec, identifier).await? else {
		return Ok(());
	};
	let subject_id = field_str(&identity, "subject_id")?;
	let code = generate_numeric_code(policy.code_length);
	let code_hash = hasher.hash(code.clone().into()).await?;

	orm.create(
		PASSWORD_RESET_CODES_TABLE,
		record([
			("subject_id", json!(subject_id)),
			("code_hash", json!(code_hash)),
			("expires_at", json!(expiry_from_ms(policy.reset_password_code_expires_in_ms).to_rfc3339())),
			("used_at", json!(Option::<String>::None)),
		]),
	)
	.await?;

	send_code.send(identifier, &code, CodePurpose::Reset).await
}

/// `reset-password`: consumes a still-valid, unused reset code and sets a
/// new password hash in one step.
pub async fn reset_password(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	identifier: &str,
	code: &str,
	new_password: SecretString,
) -> Result<(), EngineError> {
	let identity = find_identity(orm, spec, identifier).await?.ok_or(EngineError::InvalidCredentials)?;
	let subject_id = field_str(&identity, "subject_id")?;

	let candidates = orm
		.find_many(
			PASSWORD_RESET_CODES_TABLE,
			FindOptions::new().where_clause(
				Predicate::eq("subject_id", json!(subject_id)).and(Predicate::eq("used_at", serde_json::Value::Null)),
			),
		)
		.await?;

	let mut matched = None;
	for candidate in candidates {
		let expires_at = parse_rfc3339(&field_str(&candidate, "expires_at")?)?;
		if Utc::now() >= expires_at {
			continue;
		}
		let code_hash = field_str(&candidate, "code_hash")?;
		if hasher.verify(code.to_string().into(), code_hash).await? {
			matched = Some(candidate);
			break;
		}
	}
	let reset_record = matched.ok_or(EngineError::InvalidCredentials)?;

	if hasher.check_password_safety(new_password.expose_str()).await? {
		return Err(EngineError::InvalidCredentials);
	}

	let password_hash = hasher.hash(new_password).await?;
	orm.update_many(
		CREDENTIALS_TABLE,
		UpdateOptions {
			where_: Some(Predicate::eq("subject_id", json!(subject_id))),
			set: record([("password_hash", json!(password_hash)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
		},
	)
	.await?;

	let reset_id = field_opt_str(&reset_record, "id");
	if let Some(reset_id) = reset_id {
		orm.update_many(
			PASSWORD_RESET_CODES_TABLE,
			UpdateOptions {
				where_: Some(Predicate::eq("id", json!(reset_id))),
				set: record([("used_at", json!(Utc::now().to_rfc3339()))]),
			},
		)
		.await?;
	}
	Ok(())
}

/// `change-password`: requires the caller to already have re-verified a
/// valid session (done by the invoking step via `ctx.sessions.check_session`
/// before this is ever called) and re-checks the current password.
pub async fn change_password(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	subject_id: &str,
	current_password: SecretString,
	new_password: SecretString,
) -> Result<(), EngineError> {
	let credential = find_credential(orm, subject_id).await?;
	let password_hash = field_str(&credential, "password_hash")?;
	if !hasher.verify(current_password, password_hash).await? {
		return Err(EngineError::InvalidCredentials);
	}
	if hasher.check_password_safety(new_password.expose_str()).await? {
		return Err(EngineError::InvalidCredentials);
	}
	let new_hash = hasher.hash(new_password).await?;
	orm.update_many(
		CREDENTIALS_TABLE,
		UpdateOptions {
			where_: Some(Predicate::eq("subject_id", json!(subject_id))),
			set: record([("password_hash", json!(new_hash)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
		},
	)
	.await?;
	Ok(())
}

/// `change-email` / `change-phone`, verification-enabled path: stages the
/// new identifier and a fresh code in provider-metadata rather than
/// committing immediately; [`confirm_identifier_change`] applies it.
#[allow(clippy::too_many_arguments)]
pub async fn begin_identifier_change(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	policy: &PasswordPolicy,
	subject_id: &str,
	current_password: SecretString,
	new_identifier: &str,
	send_code: &dyn SendCodeCallback,
) -> Result<(), EngineError> {
	let credential = find_credential(orm, subject_id).await?;
	let password_hash = field_str(&credential, "password_hash")?;
	if !hasher.verify(current_password, password_hash).await? {
		return Err(EngineError::InvalidCredentials);
	}
	let new_identifier = spec.normalize_identifier(new_identifier);
	let new_identifier = new_identifier.as_str();
	if find_identity(orm, spec, new_identifier).await?.is_some() {
		return Err(EngineError::Conflict(format!("{} `{new_identifier}` is already in use", spec.provider)));
	}

	let identity = orm
		.find_first(
			IDENTITIES_TABLE,
			FindOptions::new().where_clause(Predicate::eq("provider", json!(spec.provider)).and(Predicate::eq("subject_id", json!(subject_id)))),
		)
		.await?
		.ok_or_else(|| EngineError::Internal(format!("subject `{subject_id}` has no {} identity", spec.provider)))?;
	let identity_id = field_str(&identity, "id")?;

	let code = generate_numeric_code(policy.code_length);
	let code_hash = hasher.hash(code.clone().into()).await?;
	orm.upsert(
		spec.metadata_table,
		UpsertOptions {
			where_: Predicate::eq("identity_id", json!(identity_id)),
			create: record([
				("identity_id", json!(identity_id)),
				("pending_identifier", json!(new_identifier)),
				("pending_code_hash", json!(code_hash.clone())),
				("pending_code_expires_at", json!(expiry_from_ms(policy.verification_code_expires_in_ms).to_rfc3339())),
			]),
			update: record([
				("pending_identifier", json!(new_identifier)),
				("pending_code_hash", json!(code_hash)),
				("pending_code_expires_at", json!(expiry_from_ms(policy.verification_code_expires_in_ms).to_rfc3339())),
			]),
		},
	)
	.await?;

	send_code.send(new_identifier, &code, CodePurpose::ChangeIdentifier).await
}

/// Commits a staged identifier change once the user supplies the code sent
/// to the new address/number.
pub async fn confirm_identifier_change(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	subject_id: &str,
	code: &str,
) -> Result<(), EngineError> {
	let identity = orm
		.find_first(
			IDENTITIES_TABLE,
			FindOptions::new().where_clause(Predicate::eq("provider", json!(spec.provider)).and(Predicate::eq("subject_id", json!(subject_id)))),
		)
		.await?
		.ok_or_else(|| EngineError::Internal(format!("subject `{subject_id}` has no {} identity", spec.provider)))?;
	let identity_id = field_str(&identity, "id")?;
	let metadata = find_metadata(orm, spec, &identity_id).await?.ok_or(EngineError::Expired)?;

	let expires_at = parse_rfc3339(&field_str(&metadata, "pending_code_expires_at")?)?;
	if Utc::now() >= expires_at {
		return Err(EngineError::Expired);
	}
	let pending_hash = field_str(&metadata, "pending_code_hash")?;
	if !hasher.verify(code.to_string().into(), pending_hash).await? {
		return Err(EngineError::InvalidCredentials);
	}
	let new_identifier = field_str(&metadata, "pending_identifier")?;

	orm.update_many(
		IDENTITIES_TABLE,
		UpdateOptions {
			where_: Some(Predicate::eq("id", json!(identity_id))),
			set: record([("identifier", json!(new_identifier)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
		},
	)
	.await?;
	orm.delete_many(
		spec.metadata_table,
		DeleteOptions {
			where_: Some(Predicate::eq("identity_id", json!(identity_id))),
		},
	)
	.await?;
	Ok(())
}

/// Applied immediately when verification is disabled for this provider —
/// no staging, no code.
pub async fn change_identifier_unverified(
	orm: &dyn DataAccessPort,
	hasher: &CredentialHasher,
	spec: &ProviderSpec,
	subject_id: &str,
	current_password: SecretString,
	new_identifier: &str,
) -> Result<(), EngineError> {
	let credential = find_credential(orm, subject_id).await?;
	let password_hash = field_str(&credential, "password_hash")?;
	if !hasher.verify(current_password, password_hash).await? {
		return Err(EngineError::InvalidCredentials);
	}
	let new_identifier = spec.normalize_identifier(new_identifier);
	let new_identifier = new_identifier.as_str();
	if find_identity(orm, spec, new_identifier).await?.is_some() {
		return Err(EngineError::Conflict(format!("{} `{new_identifier}` is already in use", spec.provider)));
	}
	orm.update_many(
		IDENTITIES_TABLE,
		UpdateOptions {
			where_: Some(Predicate::eq("provider", json!(spec.provider)).and(Predicate::eq("subject_id", json!(subject_id)))),
			set: record([("identifier", json!(new_identifier)), ("updated_at", json!(Utc::now().to_rfc3339()))]),
		},
	)
	.await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use auth_engine_core::data_access::SqliteDataAccessPort;
	use auth_engine_core::token::TokenCodec;
	use std::sync::Arc;

	fn policy() -> PasswordPolicy {
		PasswordPolicy {
			verify_identity: false,
			login_on_register: true,
			session_ttl_seconds: 3600,
			code_length: 6,
			verification_code_expires_in_ms: 15 * 60 * 1000,
			reset_password_code_expires_in_ms: 15 * 60 * 1000,
			max_verification_attempts: 5,
		}
	}

	async fn harness() -> (Arc<dyn DataAccessPort>, CredentialHasher, SessionService) {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let hasher = CredentialHasher::default();
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let sessions = SessionService::new(Arc::clone(&orm), codec);
		(orm, hasher, sessions)
	}

	#[tokio::test]
	async fn register_then_login_succeeds() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();

		let outcome = register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "a@x.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();
		assert!(outcome.token.is_some());
		assert!(outcome.verified);

		let login_result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "a@x.com", &"Hunter2-is-fine".into())
			.await
			.unwrap();
		assert!(matches!(login_result, LoginOutcome::Success { .. }));
	}

	#[tokio::test]
	async fn login_with_wrong_password_is_invalid_credentials() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "a@x.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();

		let result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "a@x.com", &"wrong".into()).await;
		assert!(matches!(result, Err(EngineError::InvalidCredentials)));
	}

	#[tokio::test]
	async fn login_for_unknown_identifier_is_invalid_credentials_not_not_found() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();

		let result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "nobody@x.com", &"whatever".into()).await;
		assert!(matches!(result, Err(EngineError::InvalidCredentials)));
	}

	#[tokio::test]
	async fn registering_the_same_identifier_twice_conflicts() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "dup@x.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();
		let result = register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "dup@x.com", "Other-pass1".into(), None).await;
		assert!(matches!(result, Err(EngineError::Conflict(_))));
	}

	#[tokio::test]
	async fn email_identifier_comparisons_are_case_insensitive() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "Mixed@X.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();

		// same identifier, different case, conflicts at register...
		let result = register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "mixed@x.COM", "Other-pass1".into(), None).await;
		assert!(matches!(result, Err(EngineError::Conflict(_))));

		// ...and resolves to the same identity at login.
		let login_result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "MIXED@x.com", &"Hunter2-is-fine".into())
			.await
			.unwrap();
		assert!(matches!(login_result, LoginOutcome::Success { .. }));
	}

	#[tokio::test]
	async fn phone_identifiers_are_not_case_folded() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::PHONE;
		let policy = policy();
		register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "+15551234567", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();
		assert_eq!(spec.normalize_identifier("+15551234567"), "+15551234567");
	}

	struct RecordingSendCode {
		sent: tokio::sync::Mutex<Vec<(String, String)>>,
	}
	impl SendCodeCallback for RecordingSendCode {
		fn send<'a>(&'a self, identifier: &'a str, code: &'a str, _purpose: CodePurpose) -> BoxFuture<'a, Result<(), EngineError>> {
			Box::pin(async move {
				self.sent.lock().await.push((identifier.to_string(), code.to_string()));
				Ok(())
			})
		}
	}

	#[tokio::test]
	async fn verification_required_registration_then_verify_then_login() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let mut policy = policy();
		policy.verify_identity = true;
		let sender = RecordingSendCode { sent: tokio::sync::Mutex::new(Vec::new()) };

		let outcome = register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "v@x.com", "Hunter2-is-fine".into(), Some(&sender))
			.await
			.unwrap();
		assert!(!outcome.verified);

		let login_before_verify = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "v@x.com", &"Hunter2-is-fine".into())
			.await
			.unwrap();
		assert!(matches!(login_before_verify, LoginOutcome::VerificationRequired { .. }));

		let (_, code) = sender.sent.lock().await.last().cloned().unwrap();
		verify_code(orm.as_ref(), &hasher, &spec, &policy, "v@x.com", &code).await.unwrap();

		let login_after_verify = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "v@x.com", &"Hunter2-is-fine".into())
			.await
			.unwrap();
		assert!(matches!(login_after_verify, LoginOutcome::Success { .. }));
	}

	#[tokio::test]
	async fn reusing_an_already_used_reset_code_fails() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "r@x.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();
		let sender = RecordingSendCode { sent: tokio::sync::Mutex::new(Vec::new()) };
		send_reset_password(orm.as_ref(), &hasher, &spec, &policy, "r@x.com", &sender).await.unwrap();
		let (_, code) = sender.sent.lock().await.last().cloned().unwrap();

		reset_password(orm.as_ref(), &hasher, &spec, "r@x.com", &code, "New-password1".into()).await.unwrap();
		let second = reset_password(orm.as_ref(), &hasher, &spec, "r@x.com", &code, "Another-pass2".into()).await;
		assert!(matches!(second, Err(EngineError::InvalidCredentials)));
	}

	#[tokio::test]
	async fn send_reset_password_for_unknown_identifier_is_silently_ok() {
		let (orm, hasher, _sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		let sender = RecordingSendCode { sent: tokio::sync::Mutex::new(Vec::new()) };
		send_reset_password(orm.as_ref(), &hasher, &spec, &policy, "ghost@x.com", &sender).await.unwrap();
		assert!(sender.sent.lock().await.is_empty());
	}

	#[tokio::test]
	async fn change_password_requires_the_current_password() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		let outcome = register(orm.as_ref(), &hasher, &sessions, &spec, &policy, "cp@x.com", "Hunter2-is-fine".into(), None)
			.await
			.unwrap();

		let result = change_password(orm.as_ref(), &hasher, &outcome.subject_id, "wrong".into(), "New-password1".into()).await;
		assert!(matches!(result, Err(EngineError::InvalidCredentials)));

		change_password(orm.as_ref(), &hasher, &outcome.subject_id, "Hunter2-is-fine".into(), "New-password1".into())
			.await
			.unwrap();
		let login_result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &[], "cp@x.com", &"New-password1".into())
			.await
			.unwrap();
		assert!(matches!(login_result, LoginOutcome::Success { .. }));
	}

	#[tokio::test]
	async fn test_user_fixture_logs_in_without_a_stored_credential() {
		let (orm, hasher, sessions) = harness().await;
		let spec = ProviderSpec::EMAIL;
		let policy = policy();
		let fixtures = vec![TestUserFixture {
			identifier: "dev@example.com",
			password: "dev-password",
		}];

		let result = login(orm.as_ref(), &hasher, &sessions, &spec, &policy, &fixtures, "dev@example.com", &"dev-password".into())
			.await
			.unwrap();
		assert!(matches!(result, LoginOutcome::Success { .. }));
	}
}
