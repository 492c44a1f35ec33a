// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Diff fetchers: pull changes since the current cursor and merge them.
//!
//! Every fetch holds the collection's write lock from the first request to
//! the last merge, repeats `since = till` until the server reports it is
//! caught up, and leaves the repository untouched when a request fails.

use std::sync::Arc;

use async_trait::async_trait;
use loom_flagsync_core::{Collection, NotificationKind, UNSYNCED};
use tracing::{debug, instrument, warn};

use crate::error::{Result, SyncError};
use crate::repository::Repository;
use crate::source::ChangesSource;

/// Upper bound on requests per fetch before giving up on convergence.
pub const MAX_FETCH_ITERATIONS: u32 = 10;

/// What workers and polling stores drive: one collection's fetch logic.
#[async_trait]
pub trait CollectionFetcher: Send + Sync + 'static {
	fn collection(&self) -> Collection;

	/// Brings the whole collection up to date from its current cursors.
	async fn refresh(&self) -> Result<()>;

	/// The cursor `update` has to be newer than to be worth a fetch.
	async fn cursor_for(&self, update: &NotificationKind) -> Result<i64>;

	/// Fetches whatever `update` announced.
	async fn fetch_update(&self, update: &NotificationKind) -> Result<()>;
}

/// Fetcher for the flags collection.
#[derive(Clone)]
pub struct FlagFetcher {
	source: Arc<dyn ChangesSource>,
	repository: Repository,
	segments: SegmentFetcher,
}

impl FlagFetcher {
	pub fn new(source: Arc<dyn ChangesSource>, repository: Repository) -> Self {
		let segments = SegmentFetcher::new(Arc::clone(&source), repository.clone());
		Self {
			source,
			repository,
			segments,
		}
	}

	/// Fetches flag changes until caught up. Returns the new cursor.
	#[instrument(skip(self), fields(collection = "flags"))]
	pub async fn fetch(&self) -> Result<i64> {
		let _writer = self.repository.lock_writes(Collection::Flags).await;

		let mut since = self.repository.change_number(Collection::Flags).await?;
		for _ in 0..MAX_FETCH_ITERATIONS {
			let changes = self.source.flag_changes(since).await?;
			if changes.till < since {
				warn!(since, till = changes.till, "flag changes went backwards, skipping merge");
				return Err(SyncError::ParseFailed(format!(
					"flag changes till {} is behind since {since}",
					changes.till
				)));
			}

			self.repository.apply_flag_changes(&changes).await?;
			if changes.is_caught_up() {
				debug!(till = changes.till, "flags caught up");
				return Ok(changes.till);
			}
			since = changes.till;
		}

		Err(SyncError::NotConverged {
			resource: Collection::Flags.to_string(),
			attempts: MAX_FETCH_ITERATIONS,
		})
	}

	/// [`fetch`](Self::fetch), then fetches any referenced segment that has
	/// never been synced. A failure in the segment step is logged only; the
	/// segments poll or the next update retries it.
	pub async fn sync(&self) -> Result<i64> {
		let till = self.fetch().await?;
		if let Err(e) = self.segments.fetch_unsynced().await {
			warn!(error = %e, "failed to fetch newly referenced segments");
		}
		Ok(till)
	}
}

#[async_trait]
impl CollectionFetcher for FlagFetcher {
	fn collection(&self) -> Collection {
		Collection::Flags
	}

	async fn refresh(&self) -> Result<()> {
		self.sync().await.map(|_| ())
	}

	async fn cursor_for(&self, _update: &NotificationKind) -> Result<i64> {
		self.repository.change_number(Collection::Flags).await
	}

	async fn fetch_update(&self, _update: &NotificationKind) -> Result<()> {
		self.sync().await.map(|_| ())
	}
}

/// Fetcher for segment memberships, each with its own cursor.
#[derive(Clone)]
pub struct SegmentFetcher {
	source: Arc<dyn ChangesSource>,
	repository: Repository,
}

impl SegmentFetcher {
	pub fn new(source: Arc<dyn ChangesSource>, repository: Repository) -> Self {
		Self { source, repository }
	}

	/// Fetches one segment until caught up. Returns the segment's new cursor.
	#[instrument(skip(self), fields(collection = "segments"))]
	pub async fn fetch_segment(&self, segment: &str) -> Result<i64> {
		let _writer = self.repository.lock_writes(Collection::Segments).await;

		let mut since = self.repository.segment_change_number(segment).await?;
		for _ in 0..MAX_FETCH_ITERATIONS {
			let changes = self.source.segment_changes(segment, since).await?;
			if changes.till < since || changes.name != segment {
				warn!(
					since,
					till = changes.till,
					returned = %changes.name,
					"unexpected segment changes, skipping merge"
				);
				return Err(SyncError::ParseFailed(format!(
					"segment changes for {} (till {}) do not answer {segment} since {since}",
					changes.name, changes.till
				)));
			}

			self.repository.apply_segment_changes(&changes).await?;
			if changes.is_caught_up() {
				return Ok(changes.till);
			}
			since = changes.till;
		}

		Err(SyncError::NotConverged {
			resource: format!("segment {segment}"),
			attempts: MAX_FETCH_ITERATIONS,
		})
	}

	/// Fetches every segment the current flag set references, and only those.
	///
	/// Every segment is attempted; the first failure is returned afterwards.
	#[instrument(skip(self), fields(collection = "segments"))]
	pub async fn fetch_all(&self) -> Result<()> {
		let names = self.repository.used_segment_names().await?;
		self.fetch_each(names).await
	}

	/// Fetches referenced segments whose cursor is still [`UNSYNCED`].
	pub async fn fetch_unsynced(&self) -> Result<()> {
		let mut unsynced = Vec::new();
		for name in self.repository.used_segment_names().await? {
			if self.repository.segment_change_number(&name).await? == UNSYNCED {
				unsynced.push(name);
			}
		}
		if !unsynced.is_empty() {
			debug!(count = unsynced.len(), "fetching newly referenced segments");
		}
		self.fetch_each(unsynced).await
	}

	async fn fetch_each(&self, names: impl IntoIterator<Item = String>) -> Result<()> {
		let mut first_error = None;
		for name in names {
			if let Err(e) = self.fetch_segment(&name).await {
				warn!(segment = %name, error = %e, "segment fetch failed");
				first_error.get_or_insert(e);
			}
		}
		match first_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

#[async_trait]
impl CollectionFetcher for SegmentFetcher {
	fn collection(&self) -> Collection {
		Collection::Segments
	}

	async fn refresh(&self) -> Result<()> {
		self.fetch_all().await
	}

	async fn cursor_for(&self, update: &NotificationKind) -> Result<i64> {
		match update {
			NotificationKind::SegmentUpdate { segment_name, .. } => {
				self.repository.segment_change_number(segment_name).await
			}
			_ => self.repository.change_number(Collection::Segments).await,
		}
	}

	async fn fetch_update(&self, update: &NotificationKind) -> Result<()> {
		match update {
			NotificationKind::SegmentUpdate { segment_name, .. } => {
				self.fetch_segment(segment_name).await.map(|_| ())
			}
			_ => self.fetch_all().await,
		}
	}
}
