// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::changes::SegmentChanges;
use crate::collection::UNSYNCED;

/// The member keys of one segment together with its own change number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMembership {
	pub name: String,
	pub keys: HashSet<String>,
	pub change_number: i64,
}

impl SegmentMembership {
	/// An empty, never-synced segment.
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			keys: HashSet::new(),
			change_number: UNSYNCED,
		}
	}

	pub fn contains(&self, key: &str) -> bool {
		self.keys.contains(key)
	}

	/// Merges one diff into the membership set.
	///
	/// Removals are applied after additions, so a key listed in both ends up
	/// absent. The change number moves to `till` and never backwards.
	pub fn apply(&mut self, changes: &SegmentChanges) {
		for key in &changes.added {
			self.keys.insert(key.clone());
		}
		for key in &changes.removed {
			self.keys.remove(key);
		}
		self.change_number = self.change_number.max(changes.till);
	}
}
