// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom flag synchronization core.
//!
//! This crate holds the data model shared by the sync engine (`loom-flagsync`)
//! and anything that reads its repository: flag definitions, segment
//! memberships, the responses of the incremental changes endpoints, and the
//! push notifications decoded from the streaming connection. It performs no
//! I/O.
//!
//! # Example
//!
//! ```
//! use loom_flagsync_core::{FlagChanges, FlagDefinition, SegmentChanges, SegmentMembership};
//!
//! let changes: FlagChanges = serde_json::from_str(
//!     r#"{"splits":[{"name":"checkout","status":"ACTIVE","defaultTreatment":"off","changeNumber":3}],"since":-1,"till":3}"#,
//! ).unwrap();
//! assert_eq!(changes.till, 3);
//!
//! let mut segment = SegmentMembership::new("beta_users");
//! segment.apply(&SegmentChanges {
//!     name: "beta_users".to_string(),
//!     added: vec!["user123".to_string()],
//!     removed: vec![],
//!     since: -1,
//!     till: 8,
//! });
//! assert!(segment.contains("user123"));
//! ```

pub mod changes;
pub mod collection;
pub mod error;
pub mod flag;
pub mod notification;
pub mod segment;

pub use changes::{FlagChanges, SegmentChanges};
pub use collection::{Collection, UNSYNCED};
pub use error::{ParseError, Result};
pub use flag::{
	Condition, FlagDefinition, FlagStatus, Matcher, MatcherGroup, Partition, SegmentMatcherData,
};
pub use notification::{
	parse_frame, ControlType, Envelope, Notification, NotificationKind, StreamError,
	OCCUPANCY_CHANNEL_PREFIX,
};
pub use segment::SegmentMembership;
