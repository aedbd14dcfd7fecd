// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use auth_engine_config::SamlProviderConfig;
use auth_engine_errors::EngineError;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

/// The signed `AuthnRequest` artifact a [`BuildAuthnRequestCallback`] hands
/// back, ready to be delivered to the IdP's SSO endpoint (as a POST body or
/// a deflated, base64-encoded redirect parameter — the transport is the
/// host's concern).
pub struct SamlAuthnRequest {
	pub encoded_request: String,
}

/// Injected `AuthnRequest` construction and XML-DSig signing — a
/// transport/crypto-library concern outside this core.
pub trait BuildAuthnRequestCallback: Send + Sync {
	fn build<'a>(&'a self, provider: &'a SamlProviderConfig, request_id: &'a str) -> BoxFuture<'a, Result<SamlAuthnRequest, EngineError>>;
}

/// A validated assertion handed back by [`ValidateAssertionCallback`]:
/// `in_response_to` correlates it to the pending `AuthnRequest`,
/// `attributes` holds the decoded attribute statement (plus `NameID` under
/// the key `"NameID"`) the core reads the subject identifier from.
pub struct SamlAssertion {
	pub in_response_to: String,
	pub attributes: Map<String, Value>,
}

/// Injected assertion validation: signature, `Conditions` (time window,
/// audience restriction), and issuer checks against the IdP's metadata —
/// XML parsing and XML-DSig verification are out of scope for this core.
pub trait ValidateAssertionCallback: Send + Sync {
	fn validate<'a>(&'a self, provider: &'a SamlProviderConfig, raw_response: &'a str) -> BoxFuture<'a, Result<SamlAssertion, EngineError>>;
}
