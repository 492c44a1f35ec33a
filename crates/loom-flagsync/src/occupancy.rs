// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Publisher presence tracking.
//!
//! Streaming is usable while at least one tracked channel reports a
//! publisher. A change in that answer is only reported once it has held for
//! the debounce window; a sample that flips it back inside the window
//! cancels the pending report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::events::SyncEvent;
use crate::util::lock;

#[derive(Debug)]
struct State {
	publishers: HashMap<String, u32>,
	/// Last availability reported to the synchronizer.
	reported: bool,
	/// Bumped on every sample that makes a pending report obsolete.
	generation: u64,
}

impl State {
	fn available(&self) -> bool {
		self.publishers.is_empty() || self.publishers.values().any(|&n| n > 0)
	}
}

#[derive(Debug)]
struct Inner {
	state: Mutex<State>,
	debounce: Duration,
	events: mpsc::UnboundedSender<SyncEvent>,
}

impl Inner {
	fn lock(&self) -> MutexGuard<'_, State> {
		lock(&self.state)
	}
}

/// Per-channel publisher counts with debounced availability signals.
#[derive(Debug, Clone)]
pub struct OccupancyKeeper {
	inner: Arc<Inner>,
}

impl OccupancyKeeper {
	pub fn new(debounce: Duration, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(State {
					publishers: HashMap::new(),
					reported: true,
					generation: 0,
				}),
				debounce,
				events,
			}),
		}
	}

	/// Records a publisher count sample for `channel`.
	pub fn update(&self, channel: &str, publishers: u32) {
		let mut state = self.inner.lock();
		state.publishers.insert(channel.to_string(), publishers);
		state.generation += 1;

		let available = state.available();
		debug!(channel, publishers, available, "occupancy sample");
		if available == state.reported {
			return;
		}

		let generation = state.generation;
		drop(state);

		let inner = Arc::clone(&self.inner);
		tokio::spawn(async move {
			tokio::time::sleep(inner.debounce).await;

			let mut state = inner.lock();
			if state.generation != generation || state.available() != available {
				return;
			}
			state.reported = available;
			drop(state);

			let event = if available {
				info!("publishers available");
				SyncEvent::PublishersAvailable
			} else {
				info!("no publishers on any channel");
				SyncEvent::PublishersUnavailable
			};
			let _ = inner.events.send(event);
		});
	}

	/// Whether streaming is currently considered usable.
	pub fn is_available(&self) -> bool {
		self.inner.lock().reported
	}

	/// Forgets all samples, as on a fresh connection.
	pub fn reset(&self) {
		let mut state = self.inner.lock();
		state.publishers.clear();
		state.reported = true;
		state.generation += 1;
	}
}
