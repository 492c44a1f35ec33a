// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a flag definition as reported by the changes endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
	Active,
	Archived,
}

/// A flag definition as stored in the repository.
///
/// Only the fields the sync core needs are typed. Everything else the server
/// sends (seed, algorithm, traffic allocation, ...) is kept verbatim in
/// `extra` for the evaluation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
	pub name: String,
	#[serde(default)]
	pub traffic_type_name: Option<String>,
	pub status: FlagStatus,
	#[serde(default)]
	pub killed: bool,
	pub default_treatment: String,
	pub change_number: i64,
	#[serde(default)]
	pub conditions: Vec<Condition>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl FlagDefinition {
	/// Creates an active definition with no targeting rules.
	pub fn new(name: impl Into<String>, default_treatment: impl Into<String>, change_number: i64) -> Self {
		Self {
			name: name.into(),
			traffic_type_name: None,
			status: FlagStatus::Active,
			killed: false,
			default_treatment: default_treatment.into(),
			change_number,
			conditions: Vec::new(),
			extra: Map::new(),
		}
	}

	pub fn is_archived(&self) -> bool {
		self.status == FlagStatus::Archived
	}

	/// Names of the segments referenced by this flag's rules.
	pub fn segment_names(&self) -> impl Iterator<Item = &str> {
		self
			.conditions
			.iter()
			.flat_map(|c| c.matcher_group.matchers.iter())
			.filter_map(|m| m.user_defined_segment_matcher_data.as_ref())
			.map(|d| d.segment_name.as_str())
	}

	/// Applies a kill notification.
	///
	/// Returns false (and leaves the definition untouched) when the definition
	/// is already at or past `change_number`.
	pub fn kill(&mut self, default_treatment: &str, change_number: i64) -> bool {
		if self.change_number >= change_number {
			return false;
		}
		self.killed = true;
		self.default_treatment = default_treatment.to_string();
		self.change_number = change_number;
		true
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
	#[serde(default)]
	pub condition_type: Option<String>,
	pub matcher_group: MatcherGroup,
	#[serde(default)]
	pub partitions: Vec<Partition>,
	#[serde(default)]
	pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
	#[serde(default)]
	pub combiner: Option<String>,
	#[serde(default)]
	pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
	pub matcher_type: String,
	#[serde(default)]
	pub negate: bool,
	#[serde(default)]
	pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Matcher {
	/// An `IN_SEGMENT` matcher for `segment_name`.
	pub fn in_segment(segment_name: impl Into<String>) -> Self {
		Self {
			matcher_type: "IN_SEGMENT".to_string(),
			negate: false,
			user_defined_segment_matcher_data: Some(SegmentMatcherData {
				segment_name: segment_name.into(),
			}),
			extra: Map::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
	pub segment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
	pub treatment: String,
	pub size: u32,
}
