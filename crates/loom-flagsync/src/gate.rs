// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Readiness gate: opens once both collections completed a full sync.

use std::sync::Arc;
use std::time::Duration;

use loom_flagsync_core::Collection;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
	flags: bool,
	segments: bool,
}

impl Progress {
	fn is_ready(&self) -> bool {
		self.flags && self.segments
	}
}

/// Shared handle to the readiness state.
///
/// Cloning yields another handle onto the same gate. Components that signal
/// readiness and callers that wait on it each hold their own clone.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
	tx: Arc<watch::Sender<Progress>>,
}

impl ReadinessGate {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(Progress::default());
		Self {
			tx: Arc::new(tx),
		}
	}

	/// Records that `collection` finished its first full sync.
	pub fn mark_synced(&self, collection: Collection) {
		self.tx.send_modify(|progress| match collection {
			Collection::Flags => progress.flags = true,
			Collection::Segments => progress.segments = true,
		});
		if self.is_ready() {
			info!("initial synchronization complete");
		}
	}

	pub fn is_synced(&self, collection: Collection) -> bool {
		let progress = *self.tx.borrow();
		match collection {
			Collection::Flags => progress.flags,
			Collection::Segments => progress.segments,
		}
	}

	pub fn is_ready(&self) -> bool {
		self.tx.borrow().is_ready()
	}

	/// Waits until ready. Returns false if `timeout` elapses first.
	pub async fn wait_ready(&self, timeout: Duration) -> bool {
		let mut rx = self.tx.subscribe();
		let outcome = tokio::time::timeout(timeout, rx.wait_for(Progress::is_ready)).await;
		matches!(outcome, Ok(Ok(_)))
	}
}

impl Default for ReadinessGate {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_wait_ready_times_out() {
		let gate = ReadinessGate::new();
		gate.mark_synced(Collection::Flags);
		assert!(!gate.wait_ready(Duration::from_secs(5)).await);
		assert!(!gate.is_ready());
	}

	#[tokio::test]
	async fn test_already_ready_returns_immediately() {
		let gate = ReadinessGate::new();
		gate.mark_synced(Collection::Flags);
		gate.mark_synced(Collection::Segments);
		assert!(gate.wait_ready(Duration::ZERO).await);
	}

	#[tokio::test(start_paused = true)]
	async fn test_waiters_released_when_both_collections_sync() {
		let gate = ReadinessGate::new();
		let waiter = {
			let gate = gate.clone();
			tokio::spawn(async move { gate.wait_ready(Duration::from_secs(60)).await })
		};

		tokio::time::sleep(Duration::from_secs(1)).await;
		gate.mark_synced(Collection::Segments);
		assert!(gate.is_synced(Collection::Segments));
		assert!(!gate.is_synced(Collection::Flags));
		tokio::time::sleep(Duration::from_secs(1)).await;
		gate.mark_synced(Collection::Flags);

		assert!(waiter.await.unwrap());
	}

	#[tokio::test]
	async fn test_wait_ready_sees_readiness_reached_while_waiting() {
		let gate = ReadinessGate::new();
		let waiter = {
			let gate = gate.clone();
			tokio::spawn(async move { gate.wait_ready(Duration::from_secs(5)).await })
		};
		tokio::task::yield_now().await;
		gate.mark_synced(Collection::Flags);
		gate.mark_synced(Collection::Segments);
		assert!(waiter.await.unwrap());
		assert!(gate.wait_ready(Duration::from_millis(1)).await);
	}

	#[test]
	fn test_gate_can_be_awaited_from_sync_code() {
		let gate = ReadinessGate::new();
		gate.mark_synced(Collection::Flags);
		gate.mark_synced(Collection::Segments);
		assert!(tokio_test::block_on(gate.wait_ready(Duration::from_millis(1))));
	}
}
