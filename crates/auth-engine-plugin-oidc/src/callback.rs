// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use auth_engine_config::OidcProviderConfig;
use auth_engine_errors::EngineError;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

/// The ID token claims an injected [`ExchangeCodeCallback`] hands back after
/// it has already fetched the provider's JWKS and verified the token's
/// signature — that verification is a transport/crypto-library concern
/// outside this core, which only checks the claims below against the
/// configured expectations.
pub struct OidcTokenResponse {
	pub id_token_claims: Map<String, Value>,
	pub access_token: Option<String>,
}

/// Injected token exchange: posts `code` (plus the PKCE verifier) to the
/// provider's token endpoint and returns the decoded, signature-verified ID
/// token. Implementations are HTTP-client-specific and out of scope here.
pub trait ExchangeCodeCallback: Send + Sync {
	fn exchange<'a>(
		&'a self,
		provider: &'a OidcProviderConfig,
		code: &'a str,
		code_verifier: &'a str,
		redirect_uri: &'a str,
	) -> BoxFuture<'a, Result<OidcTokenResponse, EngineError>>;
}
