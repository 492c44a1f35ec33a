// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Routes decoded notifications to the component that acts on them.

use std::sync::Arc;

use loom_flagsync_core::{Notification, NotificationKind};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::events::SyncEvent;
use crate::occupancy::OccupancyKeeper;
use crate::repository::Repository;
use crate::worker::Worker;

/// What the connection should do after a notification was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
	Continue,
	/// The server reported an error; the connection is finished.
	Terminate { retryable: bool },
}

/// Demultiplexes notifications:
///
/// - flag updates and kills go to the flags worker, kills are also written
///   to the repository before queuing
/// - segment updates go to the segments worker
/// - occupancy samples go to the occupancy keeper
/// - control messages go to the synchronizer
/// - in-band errors end the connection
pub struct NotificationProcessor {
	repository: Repository,
	flags: Arc<Worker>,
	segments: Arc<Worker>,
	occupancy: OccupancyKeeper,
	events: mpsc::UnboundedSender<SyncEvent>,
	client_id: Option<String>,
}

impl NotificationProcessor {
	pub fn new(
		repository: Repository,
		flags: Arc<Worker>,
		segments: Arc<Worker>,
		occupancy: OccupancyKeeper,
		events: mpsc::UnboundedSender<SyncEvent>,
	) -> Self {
		Self {
			repository,
			flags,
			segments,
			occupancy,
			events,
			client_id: None,
		}
	}

	/// Ignore notifications published by `client_id`.
	pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
		self.client_id = client_id;
		self
	}

	pub fn occupancy(&self) -> &OccupancyKeeper {
		&self.occupancy
	}

	pub async fn process(&self, notification: Notification) -> ProcessOutcome {
		if self.client_id.is_some() && notification.client_id == self.client_id {
			debug!(channel = %notification.channel, "skipping own notification");
			return ProcessOutcome::Continue;
		}

		debug!(
			channel = %notification.channel,
			kind = notification.kind.kind_name(),
			change_number = ?notification.kind.change_number(),
			"notification received"
		);

		match notification.kind {
			update @ NotificationKind::FlagUpdate { .. } => self.flags.enqueue(update),
			NotificationKind::FlagKill {
				change_number,
				flag_name,
				default_treatment,
			} => {
				if let Err(e) = self
					.repository
					.kill_flag(&flag_name, &default_treatment, change_number)
					.await
				{
					warn!(flag = %flag_name, error = %e, "failed to apply kill locally");
				}
				self.flags.enqueue(NotificationKind::FlagKill {
					change_number,
					flag_name,
					default_treatment,
				});
			}
			update @ NotificationKind::SegmentUpdate { .. } => self.segments.enqueue(update),
			NotificationKind::Occupancy { publishers } => {
				self.occupancy.update(&notification.channel, publishers);
			}
			NotificationKind::Control { control_type } => {
				let _ = self.events.send(SyncEvent::Control(control_type));
			}
			NotificationKind::StreamError(err) => {
				let retryable = err.is_retryable();
				if retryable {
					warn!(code = err.code, status = err.status_code, message = %err.message, "stream error");
				} else {
					error!(code = err.code, status = err.status_code, message = %err.message, "permanent stream error");
				}
				return ProcessOutcome::Terminate { retryable };
			}
		}
		ProcessOutcome::Continue
	}
}
