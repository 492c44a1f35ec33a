// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Push notifications delivered over the streaming connection.
//!
//! The stream is a sequence of server-sent-event frames. A `message` frame
//! carries a JSON [`Envelope`] whose `data` field is itself a JSON string
//! holding the update payload. An `error` frame carries a [`StreamError`].
//!
//! # Payload types
//!
//! - `SPLIT_UPDATE` - the flag collection changed
//! - `SPLIT_KILL` - a flag was killed, with its new default treatment
//! - `SEGMENT_UPDATE` - one segment changed
//! - `CONTROL` - advisory streaming control
//! - occupancy - publisher count on a control channel, recognised by the
//!   [`OCCUPANCY_CHANNEL_PREFIX`] on the channel name
//!
//! # Example
//!
//! ```
//! use loom_flagsync_core::notification::{parse_frame, NotificationKind};
//!
//! let data = r#"{"id":"1","clientId":"c1","channel":"flags","data":"{\"type\":\"SPLIT_UPDATE\",\"changeNumber\":42}"}"#;
//! let notification = parse_frame("message", data).unwrap().unwrap();
//! assert_eq!(notification.kind, NotificationKind::FlagUpdate { change_number: 42 });
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// Prefix the push server puts in front of occupancy channel names.
pub const OCCUPANCY_CHANNEL_PREFIX: &str = "[?occupancy=metrics.publishers]";

/// JSON envelope of a `message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub client_id: Option<String>,
	#[serde(default)]
	pub connection_id: Option<String>,
	#[serde(default)]
	pub timestamp: Option<i64>,
	#[serde(default)]
	pub channel: String,
	#[serde(default)]
	pub data: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
}

/// Advisory control instruction sent by the push server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControlType {
	StreamingPaused,
	StreamingResumed,
	StreamingDisabled,
	Unknown(String),
}

impl ControlType {
	pub fn as_str(&self) -> &str {
		match self {
			ControlType::StreamingPaused => "STREAMING_PAUSED",
			ControlType::StreamingResumed => "STREAMING_RESUMED",
			ControlType::StreamingDisabled => "STREAMING_DISABLED",
			ControlType::Unknown(other) => other,
		}
	}
}

impl From<String> for ControlType {
	fn from(value: String) -> Self {
		match value.as_str() {
			"STREAMING_PAUSED" => ControlType::StreamingPaused,
			"STREAMING_RESUMED" => ControlType::StreamingResumed,
			"STREAMING_DISABLED" => ControlType::StreamingDisabled,
			_ => ControlType::Unknown(value),
		}
	}
}

impl From<ControlType> for String {
	fn from(value: ControlType) -> Self {
		value.as_str().to_string()
	}
}

/// Body of an in-band `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
	#[serde(default)]
	pub message: String,
	pub code: i64,
	#[serde(default)]
	pub status_code: u16,
	#[serde(default)]
	pub href: Option<String>,
}

impl StreamError {
	/// Token expiry (`40140..=40149`) is recoverable by reconnecting with a
	/// fresh token. Any other `4xxxx` code is a client error that reconnecting
	/// will not fix. Everything else is treated as a server-side hiccup.
	pub fn is_retryable(&self) -> bool {
		match self.code {
			40140..=40149 => true,
			40000..=49999 => false,
			_ => true,
		}
	}
}

/// A decoded notification together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	/// Channel name with any occupancy prefix stripped.
	pub channel: String,
	/// Publisher-side client id, used to recognise echoes of our own writes.
	pub client_id: Option<String>,
	/// Server timestamp in milliseconds since the epoch.
	pub timestamp: Option<i64>,
	pub kind: NotificationKind,
}

/// The closed set of notification kinds the sync core understands.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationKind {
	FlagUpdate {
		change_number: i64,
	},
	FlagKill {
		change_number: i64,
		flag_name: String,
		default_treatment: String,
	},
	SegmentUpdate {
		change_number: i64,
		segment_name: String,
	},
	Control {
		control_type: ControlType,
	},
	Occupancy {
		publishers: u32,
	},
	StreamError(StreamError),
}

impl NotificationKind {
	/// Returns the kind name as a string.
	pub fn kind_name(&self) -> &'static str {
		match self {
			NotificationKind::FlagUpdate { .. } => "SPLIT_UPDATE",
			NotificationKind::FlagKill { .. } => "SPLIT_KILL",
			NotificationKind::SegmentUpdate { .. } => "SEGMENT_UPDATE",
			NotificationKind::Control { .. } => "CONTROL",
			NotificationKind::Occupancy { .. } => "OCCUPANCY",
			NotificationKind::StreamError(_) => "ERROR",
		}
	}

	/// The change number carried by update kinds.
	pub fn change_number(&self) -> Option<i64> {
		match self {
			NotificationKind::FlagUpdate { change_number }
			| NotificationKind::FlagKill { change_number, .. }
			| NotificationKind::SegmentUpdate { change_number, .. } => Some(*change_number),
			_ => None,
		}
	}
}

impl Notification {
	pub fn new(channel: impl Into<String>, kind: NotificationKind) -> Self {
		Self {
			channel: channel.into(),
			client_id: None,
			timestamp: None,
			kind,
		}
	}

	pub fn flag_update(channel: impl Into<String>, change_number: i64) -> Self {
		Self::new(channel, NotificationKind::FlagUpdate { change_number })
	}

	pub fn flag_kill(
		channel: impl Into<String>,
		change_number: i64,
		flag_name: impl Into<String>,
		default_treatment: impl Into<String>,
	) -> Self {
		Self::new(
			channel,
			NotificationKind::FlagKill {
				change_number,
				flag_name: flag_name.into(),
				default_treatment: default_treatment.into(),
			},
		)
	}

	pub fn segment_update(
		channel: impl Into<String>,
		change_number: i64,
		segment_name: impl Into<String>,
	) -> Self {
		Self::new(
			channel,
			NotificationKind::SegmentUpdate {
				change_number,
				segment_name: segment_name.into(),
			},
		)
	}

	pub fn occupancy(channel: impl Into<String>, publishers: u32) -> Self {
		Self::new(channel, NotificationKind::Occupancy { publishers })
	}

	pub fn control(channel: impl Into<String>, control_type: ControlType) -> Self {
		Self::new(channel, NotificationKind::Control { control_type })
	}

	/// Server timestamp as a UTC datetime.
	pub fn sent_at(&self) -> Option<DateTime<Utc>> {
		self.timestamp.and_then(DateTime::<Utc>::from_timestamp_millis)
	}
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum UpdatePayload {
	#[serde(rename_all = "camelCase")]
	SplitUpdate { change_number: i64 },
	#[serde(rename_all = "camelCase")]
	SplitKill {
		change_number: i64,
		split_name: String,
		default_treatment: String,
	},
	#[serde(rename_all = "camelCase")]
	SegmentUpdate {
		change_number: i64,
		segment_name: String,
	},
	#[serde(rename_all = "camelCase")]
	Control { control_type: ControlType },
}

impl From<UpdatePayload> for NotificationKind {
	fn from(payload: UpdatePayload) -> Self {
		match payload {
			UpdatePayload::SplitUpdate { change_number } => NotificationKind::FlagUpdate { change_number },
			UpdatePayload::SplitKill {
				change_number,
				split_name,
				default_treatment,
			} => NotificationKind::FlagKill {
				change_number,
				flag_name: split_name,
				default_treatment,
			},
			UpdatePayload::SegmentUpdate {
				change_number,
				segment_name,
			} => NotificationKind::SegmentUpdate {
				change_number,
				segment_name,
			},
			UpdatePayload::Control { control_type } => NotificationKind::Control { control_type },
		}
	}
}

#[derive(Debug, Deserialize)]
struct OccupancyPayload {
	metrics: OccupancyMetrics,
}

#[derive(Debug, Deserialize)]
struct OccupancyMetrics {
	publishers: u32,
}

/// Decodes one frame.
///
/// Returns `Ok(None)` for frames that carry nothing to act on: empty data
/// (comments, keep-alives) and envelopes without a `data` field. Those are
/// noise, not errors.
pub fn parse_frame(event: &str, data: &str) -> Result<Option<Notification>> {
	if data.trim().is_empty() {
		return Ok(None);
	}

	if event == "error" {
		let error: StreamError = serde_json::from_str(data)?;
		return Ok(Some(Notification::new("", NotificationKind::StreamError(error))));
	}

	let envelope: Envelope = serde_json::from_str(data)?;
	let Some(inner) = envelope.data.as_deref() else {
		return Ok(None);
	};

	let kind = match envelope.channel.strip_prefix(OCCUPANCY_CHANNEL_PREFIX) {
		Some(_) => {
			let payload: OccupancyPayload =
				serde_json::from_str(inner).map_err(|e| ParseError::Payload {
					channel: envelope.channel.clone(),
					reason: e.to_string(),
				})?;
			NotificationKind::Occupancy {
				publishers: payload.metrics.publishers,
			}
		}
		None => {
			let payload: UpdatePayload =
				serde_json::from_str(inner).map_err(|e| ParseError::Payload {
					channel: envelope.channel.clone(),
					reason: e.to_string(),
				})?;
			payload.into()
		}
	};

	let channel = envelope
		.channel
		.strip_prefix(OCCUPANCY_CHANNEL_PREFIX)
		.unwrap_or(&envelope.channel)
		.to_string();

	Ok(Some(Notification {
		channel,
		client_id: envelope.client_id,
		timestamp: envelope.timestamp,
		kind,
	}))
}
