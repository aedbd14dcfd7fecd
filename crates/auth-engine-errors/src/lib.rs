// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy shared by every crate in the authentication engine.
//!
//! [`EngineError`] is the single failure type steps, the plugin runtime, the
//! session service, and the cleanup scheduler propagate. It is intentionally
//! coarse-grained — a small, closed set of *kinds* rather than one variant per
//! failure site — so that transport adapters built on top of this engine can
//! make a uniform decision about wire status and log level without needing to
//! understand every plugin's internals.

use http::StatusCode;
use thiserror::Error;

/// A field-and-reason pair describing one validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldViolation {
	pub field: String,
	pub reason: String,
}

impl FieldViolation {
	pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			reason: reason.into(),
		}
	}
}

/// Errors raised anywhere in the authentication engine.
///
/// Every variant here corresponds to one of the error *kinds* in the engine's
/// error handling design: input validation, missing/invalid credentials,
/// expiry, rate limiting, conflicts, authorization, and infrastructure
/// failures. Steps translate this into the `{success, status, message}`
/// output envelope rather than letting it escape as a wire-level exception;
/// `EngineError` only crosses a step boundary as a `Result::Err` for the
/// plugin runtime to catch and classify (see `is_internal`/`status_code`).
#[derive(Debug, Error)]
pub enum EngineError {
	/// Input failed schema validation. Never retried as-is.
	#[error("validation failed: {0:?}")]
	Validation(Vec<FieldViolation>),

	/// The requested entity does not exist. For authentication lookups this
	/// is deliberately conflated with `InvalidCredentials` at the step layer
	/// to avoid leaking which identities exist.
	#[error("not found: {0}")]
	NotFound(String),

	/// Credentials presented did not match (password mismatch, wrong code,
	/// reused single-use artifact).
	#[error("invalid credentials")]
	InvalidCredentials,

	/// The artifact (code, token, magic link, session) is past its
	/// `expires_at`.
	#[error("expired")]
	Expired,

	/// A per-fingerprint or per-subject quota was exceeded.
	#[error("rate limited: {0}")]
	RateLimited(String),

	/// A uniqueness constraint was violated (duplicate identity, key name
	/// reuse, org name collision).
	#[error("conflict: {0}")]
	Conflict(String),

	/// The caller is authenticated but not entitled to this operation.
	#[error("forbidden: {0}")]
	Forbidden(String),

	/// No session, or an invalid/expired one, was presented where one is
	/// required.
	#[error("unauthorized")]
	Unauthorized,

	/// An injected callback (notification delivery, breach-corpus lookup,
	/// federation HTTP call) exceeded its bounded timeout.
	#[error("upstream timeout: {0}")]
	UpstreamTimeout(String),

	/// Discovered only at plugin/engine construction time; never at
	/// runtime. Carries every violation found, since configuration
	/// validation is aggregated rather than fail-fast on the first error.
	#[error("configuration error: {0:?}")]
	Config(Vec<String>),

	/// Underlying data-access-port failure.
	#[error("data access error: {0}")]
	DataAccess(String),

	/// Password/token hashing or verification failure (not a credential
	/// mismatch — an actual primitive failure, e.g. malformed stored hash).
	#[error("hashing error: {0}")]
	Hashing(String),

	/// A bug, or an unexpected failure with no more specific kind. Logged
	/// with full detail; surfaced to callers as a generic message.
	#[error("internal error: {0}")]
	Internal(String),
}

impl EngineError {
	/// Returns true if this error represents a bug or infrastructure fault
	/// that should be logged at `error!` level with full detail, as opposed
	/// to an expected, user-facing outcome logged at `debug!`/`info!`.
	pub fn is_internal(&self) -> bool {
		matches!(
			self,
			EngineError::DataAccess(_) | EngineError::Hashing(_) | EngineError::Internal(_)
		)
	}

	/// Maps this error to an advisory HTTP status. Transport adapters (out
	/// of scope for this crate) use this to answer wire requests; the core
	/// never emits HTTP itself.
	pub fn status_code(&self) -> StatusCode {
		match self {
			EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
			EngineError::NotFound(_) => StatusCode::NOT_FOUND,
			EngineError::InvalidCredentials => StatusCode::UNAUTHORIZED,
			EngineError::Expired => StatusCode::UNAUTHORIZED,
			EngineError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
			EngineError::Conflict(_) => StatusCode::CONFLICT,
			EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
			EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
			EngineError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
			EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::DataAccess(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::Hashing(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The short machine-readable status lexicon steps place in their output
	/// envelope's `status` field (distinct from the HTTP status — this is
	/// the advisory code `protocol.http.codes` maps from).
	pub fn status_tag(&self) -> &'static str {
		match self {
			EngineError::Validation(_) => "validation_error",
			EngineError::NotFound(_) | EngineError::InvalidCredentials => "ip",
			EngineError::Expired => "ex",
			EngineError::RateLimited(_) => "rate_limited",
			EngineError::Conflict(_) => "conflict",
			EngineError::Forbidden(_) => "forbidden",
			EngineError::Unauthorized => "unauth",
			EngineError::UpstreamTimeout(_) => "upstream-timeout",
			EngineError::Config(_) => "config_error",
			EngineError::DataAccess(_) | EngineError::Hashing(_) | EngineError::Internal(_) => {
				"internal"
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn invalid_credentials_is_401() {
		assert_eq!(
			EngineError::InvalidCredentials.status_code(),
			StatusCode::UNAUTHORIZED
		);
	}

	#[test]
	fn not_found_and_invalid_credentials_share_status_tag() {
		// Anti-enumeration: a lookup miss must be indistinguishable from a
		// credential mismatch at the step-output layer.
		assert_eq!(
			EngineError::NotFound("identity".into()).status_tag(),
			EngineError::InvalidCredentials.status_tag()
		);
	}

	#[test]
	fn conflict_is_409() {
		assert_eq!(
			EngineError::Conflict("name taken".into()).status_code(),
			StatusCode::CONFLICT
		);
	}

	#[test]
	fn rate_limited_is_429() {
		assert_eq!(
			EngineError::RateLimited("fingerprint".into()).status_code(),
			StatusCode::TOO_MANY_REQUESTS
		);
	}

	#[test]
	fn internal_errors_are_flagged() {
		assert!(EngineError::Internal("bug".into()).is_internal());
		assert!(EngineError::DataAccess("pool exhausted".into()).is_internal());
		assert!(EngineError::Hashing("bad salt".into()).is_internal());
		assert!(!EngineError::Forbidden("not owner".into()).is_internal());
		assert!(!EngineError::Config(vec!["bad ttl".into()]).is_internal());
	}

	#[test]
	fn config_errors_are_500_but_not_logged_as_bugs() {
		let err = EngineError::Config(vec!["sendCode required".into()]);
		assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
	}
}
