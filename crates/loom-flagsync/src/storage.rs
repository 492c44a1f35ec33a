// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Storage backends behind the repository.
//!
//! The repository owns the sync semantics (cursors, archival, kills). A
//! backend only stores values. Anything that can hold two maps and two
//! integers can back the repository: the in-memory map here, or an external
//! key-value store whose connection failures surface as
//! [`SyncError::Storage`](crate::SyncError::Storage).

use std::collections::HashMap;

use async_trait::async_trait;
use loom_flagsync_core::{Collection, FlagDefinition, SegmentMembership, UNSYNCED};
use tokio::sync::RwLock;

use crate::error::Result;

/// Value store consumed by [`Repository`](crate::Repository).
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
	async fn get_flag(&self, name: &str) -> Result<Option<FlagDefinition>>;

	async fn all_flags(&self) -> Result<Vec<FlagDefinition>>;

	async fn put_flag(&self, flag: FlagDefinition) -> Result<()>;

	async fn remove_flag(&self, name: &str) -> Result<()>;

	async fn get_segment(&self, name: &str) -> Result<Option<SegmentMembership>>;

	async fn put_segment(&self, segment: SegmentMembership) -> Result<()>;

	/// Returns [`UNSYNCED`] for a collection that has never been written.
	async fn change_number(&self, collection: Collection) -> Result<i64>;

	async fn set_change_number(&self, collection: Collection, change_number: i64) -> Result<()>;
}

/// In-process backend built on `tokio::sync::RwLock` maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
	flags: RwLock<HashMap<String, FlagDefinition>>,
	segments: RwLock<HashMap<String, SegmentMembership>>,
	change_numbers: RwLock<HashMap<Collection, i64>>,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StorageBackend for MemoryBackend {
	async fn get_flag(&self, name: &str) -> Result<Option<FlagDefinition>> {
		Ok(self.flags.read().await.get(name).cloned())
	}

	async fn all_flags(&self) -> Result<Vec<FlagDefinition>> {
		Ok(self.flags.read().await.values().cloned().collect())
	}

	async fn put_flag(&self, flag: FlagDefinition) -> Result<()> {
		self.flags.write().await.insert(flag.name.clone(), flag);
		Ok(())
	}

	async fn remove_flag(&self, name: &str) -> Result<()> {
		self.flags.write().await.remove(name);
		Ok(())
	}

	async fn get_segment(&self, name: &str) -> Result<Option<SegmentMembership>> {
		Ok(self.segments.read().await.get(name).cloned())
	}

	async fn put_segment(&self, segment: SegmentMembership) -> Result<()> {
		self
			.segments
			.write()
			.await
			.insert(segment.name.clone(), segment);
		Ok(())
	}

	async fn change_number(&self, collection: Collection) -> Result<i64> {
		Ok(
			self
				.change_numbers
				.read()
				.await
				.get(&collection)
				.copied()
				.unwrap_or(UNSYNCED),
		)
	}

	async fn set_change_number(&self, collection: Collection, change_number: i64) -> Result<()> {
		self
			.change_numbers
			.write()
			.await
			.insert(collection, change_number);
		Ok(())
	}
}
