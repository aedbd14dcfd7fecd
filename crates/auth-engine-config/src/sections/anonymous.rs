// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `anonymous` (guest) plugin configuration: per-fingerprint quotas, session
//! extension limits, and guest-to-permanent conversion policy.

use super::cleanup::{CleanupConfig, CleanupConfigLayer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversionTargetLayer {
	/// The step on the target plugin to invoke, e.g. `"register"`.
	pub step: String,
	/// `map_input`: declarative rename from a `conversion_data` key to the
	/// key the target step expects, expressed as `{target_key: source_key}`
	/// pairs rather than a callback — the typed-AST-over-lambda redesign
	/// applied to guest conversion instead of just ORM predicates. Keys the
	/// guest payload and the target step already agree on need no entry.
	#[serde(default)]
	pub map_input: HashMap<String, String>,
	/// `input_validation`: `conversion_data` keys (after `map_input` is
	/// applied) that must be present and non-empty, or the step fails with
	/// `VALIDATION_ERROR` before the target plugin is ever invoked.
	#[serde(default)]
	pub required_fields: Vec<String>,
	/// `extract`: where to read the newly-created subject id from in the
	/// target step's output, if not the envelope's standard `subject.id`
	/// field — an `others` bag key.
	pub extract_subject_id_field: Option<String>,
	/// `extract`: where to read a caller-supplied token from in the target
	/// step's output, if not the envelope's standard `token` field — an
	/// `others` bag key.
	pub extract_token_field: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnonymousConfigLayer {
	pub session_ttl_seconds: Option<u64>,
	pub max_guests_per_fingerprint: Option<u32>,
	pub max_session_extensions: Option<u32>,
	pub allow_session_extension: Option<bool>,
	pub fingerprint_required: Option<bool>,
	pub guest_data_retention_days: Option<u32>,
	pub allowed_conversion_plugins: Option<Vec<String>>,
	#[serde(default)]
	pub conversion_targets: HashMap<String, ConversionTargetLayer>,
	#[serde(default)]
	pub cleanup: CleanupConfigLayer,
}

impl AnonymousConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.session_ttl_seconds.is_some() {
			self.session_ttl_seconds = other.session_ttl_seconds;
		}
		if other.max_guests_per_fingerprint.is_some() {
			self.max_guests_per_fingerprint = other.max_guests_per_fingerprint;
		}
		if other.max_session_extensions.is_some() {
			self.max_session_extensions = other.max_session_extensions;
		}
		if other.allow_session_extension.is_some() {
			self.allow_session_extension = other.allow_session_extension;
		}
		if other.fingerprint_required.is_some() {
			self.fingerprint_required = other.fingerprint_required;
		}
		if other.guest_data_retention_days.is_some() {
			self.guest_data_retention_days = other.guest_data_retention_days;
		}
		if other.allowed_conversion_plugins.is_some() {
			self.allowed_conversion_plugins = other.allowed_conversion_plugins;
		}
		for (name, target) in other.conversion_targets {
			self.conversion_targets.insert(name, target);
		}
		self.cleanup.merge(other.cleanup);
	}

	/// `allowed_conversion_plugins` entries without a matching
	/// `conversion_targets` definition are a construction-time error — the
	/// allow-list and the target map must agree, or `convert-guest` would
	/// discover the gap only when a caller actually tries it.
	pub fn finalize(self) -> Result<AnonymousConfig, Vec<String>> {
		let mut errors = Vec::new();

		let session_ttl_seconds = self.session_ttl_seconds.unwrap_or(24 * 3600);
		if session_ttl_seconds == 0 || session_ttl_seconds > 30 * 24 * 3600 {
			errors.push(format!(
				"session_ttl_seconds must be in (0, {}], got {session_ttl_seconds}",
				30 * 24 * 3600
			));
		}

		let allowed_conversion_plugins = self.allowed_conversion_plugins.unwrap_or_default();
		for plugin in &allowed_conversion_plugins {
			if !self.conversion_targets.contains_key(plugin) {
				errors.push(format!(
					"allowed_conversion_plugins lists `{plugin}` but conversion_targets has no entry for it"
				));
			}
		}

		if errors.is_empty() {
			Ok(AnonymousConfig {
				session_ttl_seconds,
				max_guests_per_fingerprint: self.max_guests_per_fingerprint.unwrap_or(3),
				max_session_extensions: self.max_session_extensions.unwrap_or(5),
				allow_session_extension: self.allow_session_extension.unwrap_or(true),
				fingerprint_required: self.fingerprint_required.unwrap_or(false),
				guest_data_retention_days: self.guest_data_retention_days.unwrap_or(7),
				allowed_conversion_plugins,
				conversion_targets: self
					.conversion_targets
					.into_iter()
					.map(|(name, layer)| {
						(
							name,
							ConversionTarget {
								step: layer.step,
								map_input: layer.map_input,
								required_fields: layer.required_fields,
								extract_subject_id_field: layer.extract_subject_id_field,
								extract_token_field: layer.extract_token_field,
							},
						)
					})
					.collect(),
				cleanup: self.cleanup.finalize(),
			})
		} else {
			Err(errors)
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionTarget {
	pub step: String,
	pub map_input: HashMap<String, String>,
	pub required_fields: Vec<String>,
	pub extract_subject_id_field: Option<String>,
	pub extract_token_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnonymousConfig {
	pub session_ttl_seconds: u64,
	pub max_guests_per_fingerprint: u32,
	pub max_session_extensions: u32,
	pub allow_session_extension: bool,
	pub fingerprint_required: bool,
	pub guest_data_retention_days: u32,
	pub allowed_conversion_plugins: Vec<String>,
	pub conversion_targets: HashMap<String, ConversionTarget>,
	pub cleanup: CleanupConfig,
}

impl Default for AnonymousConfig {
	fn default() -> Self {
		AnonymousConfigLayer::default()
			.finalize()
			.expect("default layer always finalizes")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_allow_no_conversions() {
		let config = AnonymousConfig::default();
		assert!(config.allowed_conversion_plugins.is_empty());
		assert_eq!(config.max_guests_per_fingerprint, 3);
	}

	#[test]
	fn allow_list_without_a_target_definition_is_rejected() {
		let layer = AnonymousConfigLayer {
			allowed_conversion_plugins: Some(vec!["email-password".to_string()]),
			..Default::default()
		};
		let errors = layer.finalize().unwrap_err();
		assert!(errors[0].contains("email-password"));
	}

	#[test]
	fn matching_allow_list_and_targets_finalize_cleanly() {
		let mut targets = HashMap::new();
		targets.insert(
			"email-password".to_string(),
			ConversionTargetLayer {
				step: "register".to_string(),
				..Default::default()
			},
		);
		let layer = AnonymousConfigLayer {
			allowed_conversion_plugins: Some(vec!["email-password".to_string()]),
			conversion_targets: targets,
			..Default::default()
		};
		let config = layer.finalize().unwrap();
		assert_eq!(config.conversion_targets["email-password"].step, "register");
	}

	#[test]
	fn map_input_and_required_fields_survive_finalize() {
		let mut targets = HashMap::new();
		let mut map_input = HashMap::new();
		map_input.insert("email".to_string(), "guest_email".to_string());
		targets.insert(
			"email-password".to_string(),
			ConversionTargetLayer {
				step: "register".to_string(),
				map_input,
				required_fields: vec!["guest_email".to_string(), "password".to_string()],
				extract_subject_id_field: Some("new_subject_id".to_string()),
				extract_token_field: None,
			},
		);
		let layer = AnonymousConfigLayer {
			allowed_conversion_plugins: Some(vec!["email-password".to_string()]),
			conversion_targets: targets,
			..Default::default()
		};
		let config = layer.finalize().unwrap();
		let target = &config.conversion_targets["email-password"];
		assert_eq!(target.map_input["email"], "guest_email");
		assert_eq!(target.required_fields, vec!["guest_email", "password"]);
		assert_eq!(target.extract_subject_id_field.as_deref(), Some("new_subject_id"));
	}
}
