// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared cleanup-scheduler knobs, embedded in every plugin's config section.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfigLayer {
	pub enabled: Option<bool>,
	pub interval_minutes: Option<u64>,
	pub retention_days: Option<u32>,
	pub batch_size: Option<u32>,
}

impl CleanupConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.enabled.is_some() {
			self.enabled = other.enabled;
		}
		if other.interval_minutes.is_some() {
			self.interval_minutes = other.interval_minutes;
		}
		if other.retention_days.is_some() {
			self.retention_days = other.retention_days;
		}
		if other.batch_size.is_some() {
			self.batch_size = other.batch_size;
		}
	}

	pub fn finalize(self) -> CleanupConfig {
		CleanupConfig {
			enabled: self.enabled.unwrap_or(true),
			interval_minutes: self.interval_minutes.unwrap_or(15),
			retention_days: self.retention_days.unwrap_or(30),
			batch_size: self.batch_size.unwrap_or(500),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
	pub enabled: bool,
	pub interval_minutes: u64,
	pub retention_days: u32,
	pub batch_size: u32,
}

impl Default for CleanupConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			interval_minutes: 15,
			retention_days: 30,
			batch_size: 500,
		}
	}
}
