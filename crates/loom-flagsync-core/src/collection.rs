// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

/// Change number of a collection or entity that has never been synced.
pub const UNSYNCED: i64 = -1;

/// The two independently versioned collections kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
	Flags,
	Segments,
}

impl Collection {
	pub const ALL: [Collection; 2] = [Collection::Flags, Collection::Segments];

	pub fn as_str(&self) -> &'static str {
		match self {
			Collection::Flags => "flags",
			Collection::Segments => "segments",
		}
	}
}

impl std::fmt::Display for Collection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_matches_as_str() {
		assert_eq!(Collection::Flags.to_string(), "flags");
		assert_eq!(Collection::Segments.to_string(), "segments");
	}

	#[test]
	fn serializes_snake_case() {
		let json = serde_json::to_string(&Collection::Segments).unwrap();
		assert_eq!(json, r#""segments""#);
	}
}
