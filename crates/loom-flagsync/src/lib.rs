// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Real-time synchronization of feature flag definitions and segments.
//!
//! This crate keeps a local [`Repository`] of flag definitions and segment
//! memberships up to date with the server. Evaluation is out of scope; the
//! repository is what an evaluator reads from.
//!
//! # Features
//!
//! - **Diff fetching**: change-number cursors, fetched until caught up
//! - **Streaming**: server-sent events trigger targeted fetches
//! - **Polling fallback**: jittered timers when streaming is unavailable
//! - **Occupancy failover**: debounced publisher presence drives the mode
//! - **Readiness gate**: wait for the first complete snapshot
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use loom_flagsync::{FlagSyncClient, StreamingCredentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagSyncClient::builder()
//!         .api_key("sdk-key")
//!         .streaming_credentials(StreamingCredentials::new(
//!             "token",
//!             ["xxxx_splits", "control_pri"],
//!         ))
//!         .build()?;
//!
//!     client.block_until_ready(Duration::from_secs(10)).await?;
//!
//!     let repository = client.repository()?;
//!     if let Some(flag) = repository.flag("checkout.new_flow").await? {
//!         println!("{} killed={}", flag.name, flag.killed);
//!     }
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod events;
mod fetcher;
mod gate;
mod http;
mod occupancy;
mod polling;
mod processor;
mod repository;
mod source;
mod sse;
mod storage;
mod synchronizer;
mod util;
mod worker;

#[cfg(test)]
mod testing;

pub use client::{FlagSyncClient, FlagSyncClientBuilder};
pub use config::{
	ReconnectConfig, StreamingCredentials, SyncConfig, DEFAULT_SDK_URL, DEFAULT_STREAMING_URL,
};
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use fetcher::{CollectionFetcher, FlagFetcher, SegmentFetcher, MAX_FETCH_ITERATIONS};
pub use gate::ReadinessGate;
pub use http::{build_client, user_agent, RetryConfig};
pub use occupancy::OccupancyKeeper;
pub use polling::{jittered, PollingStore};
pub use processor::{NotificationProcessor, ProcessOutcome};
pub use repository::Repository;
pub use source::{ChangesSource, HttpChangesSource};
pub use sse::{ConnectionState, StreamingClient};
pub use storage::{MemoryBackend, StorageBackend};
pub use synchronizer::{SyncMode, Synchronizer};
pub use worker::Worker;

// Re-export core types for convenience
pub use loom_flagsync_core::{
	Collection, ControlType, FlagChanges, FlagDefinition, FlagStatus, Notification,
	NotificationKind, SegmentChanges, SegmentMembership, UNSYNCED,
};
