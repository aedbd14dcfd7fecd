// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A wrapper type that prevents sensitive values — passwords, raw tokens,
//! API keys, SMTP credentials — from ever reaching a log line by accident.
//!
//! Plaintext secrets pass through many hands inside a single step: read from
//! input, hashed, sometimes handed to an injected `send_code`/`send_magic_link`
//! callback. Any of those call sites could, in a moment of carelessness,
//! `tracing::debug!(?input)` the whole struct. [`Secret<T>`] makes that
//! carelessness harmless: its `Debug` and `Display` impls always print
//! [`REDACTED`], never the wrapped value.

use std::fmt;
use zeroize::Zeroize;

/// The literal printed in place of a secret's contents.
pub const REDACTED: &str = "[REDACTED]";

/// A wrapper around a sensitive value of type `T`.
///
/// `T` must implement [`Zeroize`] so the backing memory is scrubbed when the
/// wrapper is dropped. `Secret<T>` intentionally does not implement `Clone`
/// unless `T: Clone`, and never implements `PartialEq` — comparing secrets
/// for equality belongs to constant-time verification routines, not to
/// general-purpose code.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
	/// Wrap a value as a secret.
	pub fn new(value: T) -> Self {
		Self(value)
	}

	/// Borrow the wrapped value. Callers should minimize how long the
	/// returned reference lives and never pass it to a logging macro.
	pub fn expose(&self) -> &T {
		&self.0
	}

	/// Consume the wrapper, returning the inner value. Once exposed this
	/// way the caller owns the zeroizing responsibility.
	pub fn into_inner(self) -> T {
		// Bypass `Drop::drop`'s zeroize by forgetting `self` after moving
		// the field out; `T`'s own destructor (if any) still runs normally
		// since we return it to the caller rather than dropping it here.
		let this = std::mem::ManuallyDrop::new(self);
		unsafe { std::ptr::read(&this.0) }
	}
}

impl<T: Zeroize> Drop for Secret<T> {
	fn drop(&mut self) {
		self.0.zeroize();
	}
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<T: Zeroize> fmt::Display for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

#[cfg(feature = "serde")]
impl<T: Zeroize + serde::Serialize> serde::Serialize for Secret<T> {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		self.0.serialize(serializer)
	}
}

#[cfg(feature = "serde")]
impl<'de, T: Zeroize + serde::Deserialize<'de>> serde::Deserialize<'de> for Secret<T> {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Secret(T::deserialize(deserializer)?))
	}
}

/// A secret string: passwords, raw session/API-key tokens, SMTP passwords,
/// OAuth client secrets.
pub type SecretString = Secret<String>;

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Secret::new(value)
	}
}

impl From<&str> for SecretString {
	fn from(value: &str) -> Self {
		Secret::new(value.to_string())
	}
}

impl SecretString {
	/// Borrow the wrapped string as `&str`.
	pub fn expose_str(&self) -> &str {
		self.expose().as_str()
	}
}
