// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_flagsync_core::ControlType;

/// Signals raised by the streaming side and consumed by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
	/// The server closed a confirmed connection.
	StreamDisconnected,
	/// The connection failed after being confirmed, or the server sent an
	/// in-band error.
	StreamError { retryable: bool },
	/// Occupancy went from zero publishers to at least one.
	PublishersAvailable,
	/// Occupancy dropped to zero publishers on every channel.
	PublishersUnavailable,
	Control(ControlType),
}
