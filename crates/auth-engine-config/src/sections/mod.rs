// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-plugin configuration sections. Each module exports a `FooConfigLayer`
//! (all-`Option` fields, `Deserialize`, `merge()`) and a `FooConfig` (the
//! finalized, fully-resolved form produced by `FooConfigLayer::finalize()`),
//! following this crate's `ServerConfigLayer`/section-layer pattern.

pub mod anonymous;
pub mod api_key;
pub mod cleanup;
pub mod email_password;
pub mod environment;
pub mod federation;
pub mod jwks;
pub mod passwordless;
pub mod phone_password;
pub mod test_users;
pub mod webauthn;

pub use anonymous::{AnonymousConfig, AnonymousConfigLayer, ConversionTarget, ConversionTargetLayer};
pub use api_key::{ApiKeyConfig, ApiKeyConfigLayer};
pub use cleanup::{CleanupConfig, CleanupConfigLayer};
pub use email_password::{EmailPasswordConfig, EmailPasswordConfigLayer};
pub use environment::Environment;
pub use federation::{
	OidcConfig, OidcConfigLayer, OidcProviderConfig, OidcProviderConfigLayer, SamlConfig, SamlConfigLayer,
	SamlProviderConfig, SamlProviderConfigLayer,
};
pub use jwks::{JwksConfig, JwksConfigLayer};
pub use passwordless::{PasswordlessConfig, PasswordlessConfigLayer};
pub use phone_password::{PhonePasswordConfig, PhonePasswordConfigLayer};
pub use test_users::{TestUser, TestUserLayer, TestUsersConfig, TestUsersConfigLayer};
pub use webauthn::{WebauthnConfig, WebauthnConfigLayer};
