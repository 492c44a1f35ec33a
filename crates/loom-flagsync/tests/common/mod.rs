// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use async_trait::async_trait;
use loom_flagsync::{ChangesSource, FlagChanges, Result, SegmentChanges};

/// Source that always reports the caller as caught up.
pub struct EmptySource;

#[async_trait]
impl ChangesSource for EmptySource {
	async fn flag_changes(&self, since: i64) -> Result<FlagChanges> {
		Ok(FlagChanges {
			flags: vec![],
			since,
			till: since,
		})
	}

	async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges> {
		Ok(SegmentChanges {
			name: name.to_string(),
			added: vec![],
			removed: vec![],
			since,
			till: since,
		})
	}
}

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}
