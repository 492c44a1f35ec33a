// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Response bodies of the incremental changes endpoints.
//!
//! Both endpoints take a `since` cursor and answer with every change after it
//! plus the new cursor `till`. A response with `till == since` means the
//! caller is caught up.

use serde::{Deserialize, Serialize};

use crate::flag::FlagDefinition;

/// Body of `GET /splitChanges?since=<cursor>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagChanges {
	#[serde(rename = "splits")]
	pub flags: Vec<FlagDefinition>,
	pub since: i64,
	pub till: i64,
}

impl FlagChanges {
	pub fn is_caught_up(&self) -> bool {
		self.till == self.since
	}
}

/// Body of `GET /segmentChanges/<name>?since=<cursor>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChanges {
	pub name: String,
	#[serde(default)]
	pub added: Vec<String>,
	#[serde(default)]
	pub removed: Vec<String>,
	pub since: i64,
	pub till: i64,
}

impl SegmentChanges {
	pub fn is_caught_up(&self) -> bool {
		self.till == self.since
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flag_changes_parse_splits_field() {
		let json = r#"{"splits":[{"name":"a","status":"ACTIVE","defaultTreatment":"off","changeNumber":5}],"since":-1,"till":5}"#;
		let changes: FlagChanges = serde_json::from_str(json).unwrap();
		assert_eq!(changes.flags.len(), 1);
		assert_eq!(changes.flags[0].name, "a");
		assert!(!changes.is_caught_up());
	}

	#[test]
	fn segment_changes_default_empty_lists() {
		let json = r#"{"name":"employees","since":7,"till":7}"#;
		let changes: SegmentChanges = serde_json::from_str(json).unwrap();
		assert!(changes.added.is_empty());
		assert!(changes.removed.is_empty());
		assert!(changes.is_caught_up());
	}

	#[test]
	fn missing_till_is_a_parse_error() {
		let json = r#"{"splits":[],"since":-1}"#;
		assert!(serde_json::from_str::<FlagChanges>(json).is_err());
	}
}
