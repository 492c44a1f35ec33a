// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-collection workers that turn update notifications into fetches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loom_flagsync_core::NotificationKind;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetcher::CollectionFetcher;
use crate::util::lock;

/// Sequential consumer of update notifications for one collection.
///
/// Updates are handled strictly in enqueue order, one at a time. An update
/// whose change number is not newer than the current cursor is discarded,
/// so replaying a notification never causes a second fetch.
pub struct Worker {
	fetcher: Arc<dyn CollectionFetcher>,
	tx: mpsc::UnboundedSender<NotificationKind>,
	rx: Arc<Mutex<mpsc::UnboundedReceiver<NotificationKind>>>,
	task: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
	processed: Arc<AtomicU64>,
}

impl Worker {
	pub fn new(fetcher: Arc<dyn CollectionFetcher>) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			fetcher,
			tx,
			rx: Arc::new(Mutex::new(rx)),
			task: std::sync::Mutex::new(None),
			processed: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Queues an update. Updates arriving while the worker is stopped are
	/// dropped; the catch-up fetch on restart covers them.
	pub fn enqueue(&self, update: NotificationKind) {
		if !self.is_running() {
			debug!(
				collection = %self.fetcher.collection(),
				kind = update.kind_name(),
				"worker stopped, dropping update"
			);
			return;
		}
		if self.tx.send(update).is_err() {
			warn!(collection = %self.fetcher.collection(), "worker queue closed");
		}
	}

	/// Starts consuming the queue. No-op if already running.
	pub fn start(&self) {
		let mut task = lock(&self.task);
		if task.as_ref().is_some_and(|(cancel, _)| !cancel.is_cancelled()) {
			return;
		}

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run(
			Arc::clone(&self.fetcher),
			Arc::clone(&self.rx),
			cancel.clone(),
			Arc::clone(&self.processed),
		));
		*task = Some((cancel, handle));
		info!(collection = %self.fetcher.collection(), "worker started");
	}

	/// Stops consuming. An update already being fetched finishes first, so
	/// the repository is never left half-merged.
	pub fn stop(&self) {
		if let Some((cancel, _handle)) = lock(&self.task).take() {
			cancel.cancel();
			info!(collection = %self.fetcher.collection(), "worker stopped");
		}
	}

	pub fn is_running(&self) -> bool {
		lock(&self.task)
			.as_ref()
			.is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
	}

	/// Number of updates taken off the queue so far, stale ones included.
	pub fn processed(&self) -> u64 {
		self.processed.load(Ordering::SeqCst)
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run(
	fetcher: Arc<dyn CollectionFetcher>,
	rx: Arc<Mutex<mpsc::UnboundedReceiver<NotificationKind>>>,
	cancel: CancellationToken,
	processed: Arc<AtomicU64>,
) {
	// A previous run still finishing its last update holds the receiver.
	let mut rx = tokio::select! {
		_ = cancel.cancelled() => return,
		rx = rx.lock() => rx,
	};

	loop {
		let update = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			next = rx.recv() => match next {
				Some(update) => update,
				None => break,
			},
		};
		handle(fetcher.as_ref(), &update).await;
		processed.fetch_add(1, Ordering::SeqCst);
	}
}

async fn handle(fetcher: &dyn CollectionFetcher, update: &NotificationKind) {
	let collection = fetcher.collection();
	let Some(change_number) = update.change_number() else {
		return;
	};

	let cursor = match fetcher.cursor_for(update).await {
		Ok(cursor) => cursor,
		Err(e) => {
			warn!(%collection, error = %e, "could not read cursor, dropping update");
			return;
		}
	};
	if change_number <= cursor {
		debug!(%collection, change_number, cursor, "discarding stale update");
		return;
	}

	debug!(%collection, change_number, since = cursor, "fetching announced changes");
	if let Err(e) = fetcher.fetch_update(update).await {
		warn!(%collection, change_number, error = %e, "fetch for update failed");
	}
}
