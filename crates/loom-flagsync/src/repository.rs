// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The repository: the single source of flag and segment state.
//!
//! Evaluation reads from it; fetchers, workers and polling stores write to it.
//! Writes to one collection are serialized through [`Repository::lock_writes`],
//! which the fetchers hold across fetch and merge so that no two fetches for
//! the same collection overlap. Reads never take that lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use loom_flagsync_core::{
	Collection, FlagChanges, FlagDefinition, SegmentChanges, SegmentMembership, UNSYNCED,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::Result;
use crate::gate::ReadinessGate;
use crate::storage::{MemoryBackend, StorageBackend};

/// Thread-safe handle onto flag and segment state.
///
/// Cheap to clone; clones share the same backend, locks and readiness gate.
#[derive(Clone)]
pub struct Repository {
	backend: Arc<dyn StorageBackend>,
	flags_writer: Arc<Mutex<()>>,
	segments_writer: Arc<Mutex<()>>,
	/// Guards read-modify-write of individual flag entries. Held only for the
	/// duration of a merge, never across network I/O, so a kill can land
	/// while a flag fetch is in flight.
	flag_entries: Arc<Mutex<()>>,
	gate: ReadinessGate,
}

impl std::fmt::Debug for Repository {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Repository")
			.field("ready", &self.gate.is_ready())
			.finish_non_exhaustive()
	}
}

impl Repository {
	pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
		Self {
			backend,
			flags_writer: Arc::new(Mutex::new(())),
			segments_writer: Arc::new(Mutex::new(())),
			flag_entries: Arc::new(Mutex::new(())),
			gate: ReadinessGate::new(),
		}
	}

	/// Creates a repository over a fresh [`MemoryBackend`].
	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryBackend::new()))
	}

	/// The readiness gate for this repository's data.
	pub fn gate(&self) -> &ReadinessGate {
		&self.gate
	}

	pub fn is_ready(&self) -> bool {
		self.gate.is_ready()
	}

	/// Acquires the exclusive write path for `collection`.
	pub async fn lock_writes(&self, collection: Collection) -> OwnedMutexGuard<()> {
		let lock = match collection {
			Collection::Flags => Arc::clone(&self.flags_writer),
			Collection::Segments => Arc::clone(&self.segments_writer),
		};
		lock.lock_owned().await
	}

	pub async fn flag(&self, name: &str) -> Result<Option<FlagDefinition>> {
		self.backend.get_flag(name).await
	}

	pub async fn flags(&self) -> Result<Vec<FlagDefinition>> {
		self.backend.all_flags().await
	}

	pub async fn flag_names(&self) -> Result<Vec<String>> {
		let mut names: Vec<String> = self
			.backend
			.all_flags()
			.await?
			.into_iter()
			.map(|f| f.name)
			.collect();
		names.sort();
		Ok(names)
	}

	pub async fn segment(&self, name: &str) -> Result<Option<SegmentMembership>> {
		self.backend.get_segment(name).await
	}

	/// Returns false for unknown segments.
	pub async fn segment_contains(&self, name: &str, key: &str) -> Result<bool> {
		Ok(
			self
				.backend
				.get_segment(name)
				.await?
				.is_some_and(|s| s.contains(key)),
		)
	}

	pub async fn change_number(&self, collection: Collection) -> Result<i64> {
		self.backend.change_number(collection).await
	}

	/// A segment's own cursor, [`UNSYNCED`] if it was never fetched.
	pub async fn segment_change_number(&self, name: &str) -> Result<i64> {
		Ok(
			self
				.backend
				.get_segment(name)
				.await?
				.map_or(UNSYNCED, |s| s.change_number),
		)
	}

	/// Names of all segments referenced by the current flag set.
	pub async fn used_segment_names(&self) -> Result<BTreeSet<String>> {
		Ok(
			self
				.backend
				.all_flags()
				.await?
				.iter()
				.flat_map(|f| f.segment_names().map(str::to_string))
				.collect(),
		)
	}

	/// Merges one flag diff: archived definitions are removed, everything
	/// else is upserted. A diff entry older than the stored definition (for
	/// example one fetched before a kill landed) is skipped. The cursor
	/// advances to `till` and never moves back.
	pub async fn apply_flag_changes(&self, changes: &FlagChanges) -> Result<()> {
		let _entries = self.flag_entries.lock().await;

		let mut upserted = 0usize;
		let mut archived = 0usize;
		let mut stale = 0usize;
		for flag in &changes.flags {
			let stored = self.backend.get_flag(&flag.name).await?;
			if stored.is_some_and(|stored| stored.change_number > flag.change_number) {
				stale += 1;
				continue;
			}
			if flag.is_archived() {
				self.backend.remove_flag(&flag.name).await?;
				archived += 1;
			} else {
				self.backend.put_flag(flag.clone()).await?;
				upserted += 1;
			}
		}

		let advanced = self.advance_cursor(Collection::Flags, changes.till).await?;
		debug!(
			since = changes.since,
			till = changes.till,
			upserted,
			archived,
			stale,
			advanced,
			"merged flag changes"
		);
		Ok(())
	}

	/// Merges one segment diff into that segment's membership. The segments
	/// collection cursor tracks the highest `till` applied to any segment.
	pub async fn apply_segment_changes(&self, changes: &SegmentChanges) -> Result<()> {
		let mut segment = self
			.backend
			.get_segment(&changes.name)
			.await?
			.unwrap_or_else(|| SegmentMembership::new(&changes.name));
		segment.apply(changes);
		self.backend.put_segment(segment).await?;

		self.advance_cursor(Collection::Segments, changes.till).await?;
		debug!(
			segment = %changes.name,
			since = changes.since,
			till = changes.till,
			added = changes.added.len(),
			removed = changes.removed.len(),
			"merged segment changes"
		);
		Ok(())
	}

	/// Marks `name` killed with `default_treatment` if the kill is newer than
	/// the stored definition. The flags cursor is not advanced, so
	/// the follow-up fetch still runs.
	///
	/// Returns true if the definition changed.
	pub async fn kill_flag(&self, name: &str, default_treatment: &str, change_number: i64) -> Result<bool> {
		let _entries = self.flag_entries.lock().await;

		let Some(mut flag) = self.backend.get_flag(name).await? else {
			debug!(flag = name, change_number, "kill for unknown flag ignored");
			return Ok(false);
		};
		if !flag.kill(default_treatment, change_number) {
			debug!(flag = name, change_number, "stale kill ignored");
			return Ok(false);
		}
		self.backend.put_flag(flag).await?;
		info!(flag = name, default_treatment, change_number, "flag killed");
		Ok(true)
	}

	async fn advance_cursor(&self, collection: Collection, till: i64) -> Result<bool> {
		let current = self.backend.change_number(collection).await?;
		if till > current {
			self.backend.set_change_number(collection, till).await?;
			return Ok(true);
		}
		Ok(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::flag_with_segment;
	use loom_flagsync_core::FlagStatus;
	use proptest::prelude::*;

	fn archived(name: &str, change_number: i64) -> FlagDefinition {
		let mut flag = FlagDefinition::new(name, "off", change_number);
		flag.status = FlagStatus::Archived;
		flag
	}

	fn flag_changes(flags: Vec<FlagDefinition>, since: i64, till: i64) -> FlagChanges {
		FlagChanges { flags, since, till }
	}

	#[tokio::test]
	async fn test_new_repository_is_unsynced() {
		let repo = Repository::in_memory();
		assert_eq!(repo.change_number(Collection::Flags).await.unwrap(), UNSYNCED);
		assert_eq!(repo.change_number(Collection::Segments).await.unwrap(), UNSYNCED);
		assert_eq!(repo.segment_change_number("any").await.unwrap(), UNSYNCED);
		assert!(!repo.is_ready());
	}

	#[tokio::test]
	async fn test_archived_flags_are_removed() {
		let repo = Repository::in_memory();
		repo
			.apply_flag_changes(&flag_changes(
				vec![
					FlagDefinition::new("a", "off", 1473413807667),
					FlagDefinition::new("b", "off", 1473413807667),
				],
				UNSYNCED,
				1473413807667,
			))
			.await
			.unwrap();
		assert_eq!(repo.flag_names().await.unwrap(), vec!["a", "b"]);

		repo
			.apply_flag_changes(&flag_changes(
				vec![archived("a", 1473413807700)],
				1473413807667,
				1473413807700,
			))
			.await
			.unwrap();
		assert!(repo.flag("a").await.unwrap().is_none());
		assert_eq!(repo.flag_names().await.unwrap(), vec!["b"]);
		assert_eq!(
			repo.change_number(Collection::Flags).await.unwrap(),
			1473413807700
		);
	}

	#[tokio::test]
	async fn test_used_segment_names_follow_flag_set() {
		let repo = Repository::in_memory();
		repo
			.apply_flag_changes(&flag_changes(
				vec![
					flag_with_segment("a", "employees", 5),
					flag_with_segment("b", "beta", 5),
					flag_with_segment("c", "employees", 5),
				],
				UNSYNCED,
				5,
			))
			.await
			.unwrap();
		let used: Vec<String> = repo.used_segment_names().await.unwrap().into_iter().collect();
		assert_eq!(used, vec!["beta", "employees"]);

		repo
			.apply_flag_changes(&flag_changes(vec![archived("b", 6)], 5, 6))
			.await
			.unwrap();
		let used: Vec<String> = repo.used_segment_names().await.unwrap().into_iter().collect();
		assert_eq!(used, vec!["employees"]);
	}

	#[tokio::test]
	async fn test_segment_cursor_is_max_across_segments() {
		let repo = Repository::in_memory();
		repo
			.apply_segment_changes(&SegmentChanges {
				name: "employees".to_string(),
				added: vec!["alice".to_string(), "bob".to_string()],
				removed: vec![],
				since: UNSYNCED,
				till: 20,
			})
			.await
			.unwrap();
		repo
			.apply_segment_changes(&SegmentChanges {
				name: "beta".to_string(),
				added: vec!["carol".to_string()],
				removed: vec![],
				since: UNSYNCED,
				till: 10,
			})
			.await
			.unwrap();

		assert!(repo.segment_contains("employees", "alice").await.unwrap());
		assert!(!repo.segment_contains("beta", "alice").await.unwrap());
		assert!(!repo.segment_contains("unknown", "alice").await.unwrap());
		assert_eq!(repo.segment_change_number("beta").await.unwrap(), 10);
		assert_eq!(repo.change_number(Collection::Segments).await.unwrap(), 20);
	}

	#[tokio::test]
	async fn test_kill_is_applied_only_when_newer() {
		let repo = Repository::in_memory();
		repo
			.apply_flag_changes(&flag_changes(
				vec![FlagDefinition::new("checkout", "on", 100)],
				UNSYNCED,
				100,
			))
			.await
			.unwrap();

		assert!(!repo.kill_flag("checkout", "off", 90).await.unwrap());
		assert!(!repo.flag("checkout").await.unwrap().unwrap().killed);

		assert!(repo.kill_flag("checkout", "off", 110).await.unwrap());
		let flag = repo.flag("checkout").await.unwrap().unwrap();
		assert!(flag.killed);
		assert_eq!(flag.default_treatment, "off");
		assert_eq!(flag.change_number, 110);
		assert_eq!(repo.change_number(Collection::Flags).await.unwrap(), 100);

		assert!(!repo.kill_flag("missing", "off", 200).await.unwrap());
	}

	#[tokio::test]
	async fn test_kill_lands_while_write_lock_is_held() {
		let repo = Repository::in_memory();
		repo
			.apply_flag_changes(&flag_changes(
				vec![FlagDefinition::new("checkout", "on", 1)],
				UNSYNCED,
				1,
			))
			.await
			.unwrap();

		let _writer = repo.lock_writes(Collection::Flags).await;
		assert!(repo.kill_flag("checkout", "off", 2).await.unwrap());
	}

	#[tokio::test]
	async fn test_older_diff_does_not_revert_kill() {
		let repo = Repository::in_memory();
		repo
			.apply_flag_changes(&flag_changes(
				vec![FlagDefinition::new("checkout", "on", 100)],
				UNSYNCED,
				100,
			))
			.await
			.unwrap();
		assert!(repo.kill_flag("checkout", "off", 200).await.unwrap());

		repo
			.apply_flag_changes(&flag_changes(
				vec![FlagDefinition::new("checkout", "on", 150), archived("old", 150)],
				100,
				150,
			))
			.await
			.unwrap();
		let flag = repo.flag("checkout").await.unwrap().unwrap();
		assert!(flag.killed);
		assert_eq!(flag.default_treatment, "off");
		assert_eq!(flag.change_number, 200);
		assert_eq!(repo.change_number(Collection::Flags).await.unwrap(), 150);

		let mut refreshed = FlagDefinition::new("checkout", "v2", 200);
		refreshed.killed = true;
		repo
			.apply_flag_changes(&flag_changes(vec![refreshed], 150, 200))
			.await
			.unwrap();
		assert_eq!(
			repo.flag("checkout").await.unwrap().unwrap().default_treatment,
			"v2"
		);
	}

	proptest! {
		#[test]
		fn flags_cursor_never_decreases(tills in prop::collection::vec(-1i64..10_000, 1..30)) {
			tokio_test::block_on(async {
				let repo = Repository::in_memory();
				let mut highest = UNSYNCED;
				for till in tills {
					repo
						.apply_flag_changes(&flag_changes(vec![], highest, till))
						.await
						.unwrap();
					let current = repo.change_number(Collection::Flags).await.unwrap();
					prop_assert!(current >= highest);
					highest = highest.max(till);
					prop_assert_eq!(current, highest);
				}
				Ok(())
			})?;
		}
	}
}
