// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Credential Hasher: memory-hard password/code hashing, constant-time
//! verification, and breach-corpus lookup.
//!
//! One Argon2id instance (see [`argon2_instance`]) backs every single-use
//! secret in the engine — passwords, API keys, magic-link tokens,
//! verification and reset codes — so there is exactly one place to tune
//! cost parameters. Hashing and verification are CPU-bound; both are
//! off-loaded onto [`tokio::task::spawn_blocking`] so a slow hash never
//! stalls the async runtime's worker threads.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
#[cfg(test)]
use argon2::{Algorithm, Params, Version};
use auth_engine_errors::EngineError;
use auth_engine_secret::SecretString;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Returns an Argon2 instance configured for the build context: strong
/// defaults outside tests, fast/insecure parameters under `#[cfg(test)]` so
/// the workspace's test suite (which hashes dozens of passwords and codes)
/// stays fast. Test parameters must never be reachable outside `cfg(test)`.
#[inline]
pub(crate) fn argon2_instance() -> Argon2<'static> {
	#[cfg(test)]
	{
		let params = Params::new(1024, 1, 1, None).expect("valid Argon2 params for tests");
		Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
	}

	#[cfg(not(test))]
	{
		Argon2::default()
	}
}

/// An injected callback that checks whether a plaintext password has been
/// observed in a breach corpus (e.g. a k-anonymity HaveIBeenPwned lookup).
/// Invoked only at password-set time, never at login. Implementations MUST
/// fail open (return `Ok(false)`, i.e. "not observed") on a network hiccup
/// rather than block registration — this trait's bound already encodes a
/// timeout via [`CredentialHasher::check_password_safety`]'s wrapper.
pub trait PwnedLookup: Send + Sync {
	fn check(&self, password: &str) -> BoxFuture<'_, Result<bool, EngineError>>;
}

/// A `PwnedLookup` that always reports "not observed" — the default when no
/// breach-corpus integration is wired in.
pub struct NoopPwnedLookup;

impl PwnedLookup for NoopPwnedLookup {
	fn check(&self, _password: &str) -> BoxFuture<'_, Result<bool, EngineError>> {
		Box::pin(async { Ok(false) })
	}
}

const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CredentialHasher {
	pwned_lookup: Arc<dyn PwnedLookup>,
	callback_timeout: Duration,
}

impl Default for CredentialHasher {
	fn default() -> Self {
		Self::new(Arc::new(NoopPwnedLookup))
	}
}

impl CredentialHasher {
	pub fn new(pwned_lookup: Arc<dyn PwnedLookup>) -> Self {
		Self {
			pwned_lookup,
			callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
		}
	}

	#[must_use]
	pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
		self.callback_timeout = timeout;
		self
	}

	/// Hashes a plaintext secret (password, API key, verification/reset code,
	/// magic-link token) with a fresh per-record salt, off the async runtime
	/// worker thread.
	pub async fn hash(&self, plaintext: SecretString) -> Result<String, EngineError> {
		tokio::task::spawn_blocking(move || {
			let salt = SaltString::generate(&mut rand::rngs::OsRng);
			argon2_instance()
				.hash_password(plaintext.expose_str().as_bytes(), &salt)
				.map(|h| h.to_string())
				.map_err(|e| EngineError::Hashing(e.to_string()))
		})
		.await
		.map_err(|e| EngineError::Internal(format!("hash task panicked: {e}")))?
	}

	/// Verifies a plaintext secret against a stored Argon2 hash in constant
	/// time. Returns `Ok(true)`/`Ok(false)` for a well-formed comparison;
	/// `Err` only for a malformed stored hash (an infrastructure fault, not
	/// a credential mismatch).
	pub async fn verify(&self, plaintext: SecretString, stored_hash: String) -> Result<bool, EngineError> {
		tokio::task::spawn_blocking(move || {
			let parsed = PasswordHash::new(&stored_hash)
				.map_err(|e| EngineError::Hashing(format!("malformed stored hash: {e}")))?;
			Ok(argon2_instance()
				.verify_password(plaintext.expose_str().as_bytes(), &parsed)
				.is_ok())
		})
		.await
		.map_err(|e| EngineError::Internal(format!("verify task panicked: {e}")))?
	}

	/// Checks a plaintext password against the injected breach-corpus
	/// lookup, bounded by a timeout. On timeout or lookup error this fails
	/// open (`Ok(false)`) per the spec: a network hiccup must never block
	/// registration.
	pub async fn check_password_safety(&self, password: &str) -> Result<bool, EngineError> {
		match tokio::time::timeout(self.callback_timeout, self.pwned_lookup.check(password)).await {
			Ok(Ok(observed)) => Ok(observed),
			Ok(Err(_)) | Err(_) => Ok(false),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn hash_then_verify_round_trips() {
		let hasher = CredentialHasher::default();
		let hash = hasher.hash("hunter2".into()).await.unwrap();
		assert!(hasher.verify("hunter2".into(), hash.clone()).await.unwrap());
		assert!(!hasher.verify("wrong".into(), hash).await.unwrap());
	}

	#[tokio::test]
	async fn each_hash_has_a_distinct_salt() {
		let hasher = CredentialHasher::default();
		let a = hasher.hash("same-password".into()).await.unwrap();
		let b = hasher.hash("same-password".into()).await.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn cross_subject_verification_fails() {
		let hasher = CredentialHasher::default();
		let hash_a = hasher.hash("password-a".into()).await.unwrap();
		assert!(!hasher.verify("password-b".into(), hash_a).await.unwrap());
	}

	struct AlwaysObserved;
	impl PwnedLookup for AlwaysObserved {
		fn check(&self, _password: &str) -> BoxFuture<'_, Result<bool, EngineError>> {
			Box::pin(async { Ok(true) })
		}
	}

	struct AlwaysErrors;
	impl PwnedLookup for AlwaysErrors {
		fn check(&self, _password: &str) -> BoxFuture<'_, Result<bool, EngineError>> {
			Box::pin(async { Err(EngineError::UpstreamTimeout("breach corpus".into())) })
		}
	}

	#[tokio::test]
	async fn pwned_lookup_reports_observed_passwords() {
		let hasher = CredentialHasher::new(Arc::new(AlwaysObserved));
		assert!(hasher.check_password_safety("password123").await.unwrap());
	}

	#[tokio::test]
	async fn pwned_lookup_fails_open_on_error() {
		let hasher = CredentialHasher::new(Arc::new(AlwaysErrors));
		assert!(!hasher.check_password_safety("password123").await.unwrap());
	}

	#[tokio::test]
	async fn malformed_stored_hash_is_an_error_not_a_mismatch() {
		let hasher = CredentialHasher::default();
		let result = hasher.verify("anything".into(), "not-a-hash".to_string()).await;
		assert!(result.is_err());
	}
}
