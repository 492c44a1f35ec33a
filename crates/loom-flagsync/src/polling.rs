// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Jittered background polling.
//!
//! A polling store is two stages an orchestrator composes: [`PollingStore::run_until_success`]
//! for the readiness-gated first pass, then [`PollingStore::start`] for the
//! periodic loop, which only ends when stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::fetcher::CollectionFetcher;
use crate::http::RetryConfig;
use crate::util::lock;

/// Scales `interval` by a fresh uniform factor in `[0.5, 1.0)`.
pub fn jittered(interval: Duration) -> Duration {
	interval.mul_f64(0.5 + fastrand::f64() * 0.5)
}

/// Drives one collection fetcher on a jittered timer.
pub struct PollingStore {
	fetcher: Arc<dyn CollectionFetcher>,
	interval: Duration,
	task: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PollingStore {
	pub fn new(fetcher: Arc<dyn CollectionFetcher>, interval: Duration) -> Self {
		Self {
			fetcher,
			interval,
			task: std::sync::Mutex::new(None),
		}
	}

	/// One fetch from the current cursor.
	pub async fn run_once(&self) -> Result<()> {
		self.fetcher.refresh().await
	}

	/// Repeats [`run_once`](Self::run_once) with backoff until it succeeds.
	///
	/// Transient failures never end this stage; a permanent one (bad API key)
	/// does, as does `cancel`.
	#[instrument(skip_all, fields(collection = %self.fetcher.collection()))]
	pub async fn run_until_success(&self, retry: &RetryConfig, cancel: &CancellationToken) -> Result<()> {
		let mut attempt = 0u32;
		loop {
			let err = match self.run_once().await {
				Ok(()) => return Ok(()),
				Err(e) if e.is_permanent() => return Err(e),
				Err(e) => e,
			};

			let delay = retry.delay_for(attempt);
			attempt = attempt.saturating_add(1);
			warn!(
				error = %err,
				attempt,
				delay_ms = delay.as_millis() as u64,
				"initial fetch failed, retrying"
			);

			tokio::select! {
				_ = cancel.cancelled() => return Err(SyncError::ClientClosed),
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}

	/// Spawns the periodic loop: fetch, sleep a jittered interval, repeat.
	/// No-op if already running.
	pub fn start(&self) {
		let mut task = lock(&self.task);
		if task.as_ref().is_some_and(|(cancel, _)| !cancel.is_cancelled()) {
			return;
		}

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run_loop(
			Arc::clone(&self.fetcher),
			self.interval,
			cancel.clone(),
		));
		*task = Some((cancel, handle));
		info!(
			collection = %self.fetcher.collection(),
			interval_ms = self.interval.as_millis() as u64,
			"polling started"
		);
	}

	/// Stops the loop. A fetch in flight completes before the task exits.
	pub fn stop(&self) {
		if let Some((cancel, _handle)) = lock(&self.task).take() {
			cancel.cancel();
			info!(collection = %self.fetcher.collection(), "polling stopped");
		}
	}

	pub fn is_running(&self) -> bool {
		lock(&self.task)
			.as_ref()
			.is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
	}
}

impl Drop for PollingStore {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run_loop(fetcher: Arc<dyn CollectionFetcher>, interval: Duration, cancel: CancellationToken) {
	let collection = fetcher.collection();
	loop {
		match fetcher.refresh().await {
			Ok(()) => debug!(%collection, "poll complete"),
			Err(e) => warn!(%collection, error = %e, "poll failed"),
		}

		let delay = jittered(interval);
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep(delay) => {}
		}
	}
	debug!(%collection, "polling loop exited");
}
