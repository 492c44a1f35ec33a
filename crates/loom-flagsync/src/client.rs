// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Public entry point: builds the engine and exposes the synced repository.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::config::{StreamingCredentials, SyncConfig};
use crate::error::{Result, SyncError};
use crate::http::build_client;
use crate::repository::Repository;
use crate::source::HttpChangesSource;
use crate::storage::{MemoryBackend, StorageBackend};
use crate::synchronizer::{SyncMode, Synchronizer};

/// Builder for constructing a [`FlagSyncClient`].
pub struct FlagSyncClientBuilder {
	api_key: Option<String>,
	config: SyncConfig,
	credentials: Option<StreamingCredentials>,
	backend: Option<Arc<dyn StorageBackend>>,
}

impl FlagSyncClientBuilder {
	/// Creates a new builder with default settings.
	pub fn new() -> Self {
		Self {
			api_key: None,
			config: SyncConfig::default(),
			credentials: None,
			backend: None,
		}
	}

	/// Sets the SDK API key sent as a bearer token on every fetch.
	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.api_key = Some(key.into());
		self
	}

	/// Replaces the whole configuration.
	pub fn config(mut self, config: SyncConfig) -> Self {
		self.config = config;
		self
	}

	/// Sets the base URL of the changes endpoints.
	///
	/// Example: `https://sdk.split.io/api`
	pub fn sdk_url(mut self, url: impl Into<String>) -> Self {
		self.config.sdk_url = url.into();
		self
	}

	/// Sets the event-stream URL.
	pub fn streaming_url(mut self, url: impl Into<String>) -> Self {
		self.config.streaming_url = url.into();
		self
	}

	/// Enables or disables streaming. Disabled means polling only.
	pub fn streaming_enabled(mut self, enable: bool) -> Self {
		self.config.streaming_enabled = enable;
		self
	}

	/// Streaming token and channels. Without them the client only polls.
	pub fn streaming_credentials(mut self, credentials: StreamingCredentials) -> Self {
		self.credentials = Some(credentials);
		self
	}

	pub fn features_refresh_rate(mut self, interval: Duration) -> Self {
		self.config.features_refresh_rate = interval;
		self
	}

	pub fn segments_refresh_rate(mut self, interval: Duration) -> Self {
		self.config.segments_refresh_rate = interval;
		self
	}

	/// Sets the timeout for each changes request.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	/// Stores flags and segments somewhere other than memory.
	pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
		self.backend = Some(backend);
		self
	}

	/// Builds the client and starts synchronizing in the background.
	///
	/// Returns immediately; use [`FlagSyncClient::block_until_ready`] to wait
	/// for the first full snapshot. Must be called inside a tokio runtime.
	pub fn build(self) -> Result<FlagSyncClient> {
		let api_key = self
			.api_key
			.map(|key| key.trim().to_string())
			.filter(|key| !key.is_empty())
			.ok_or(SyncError::InvalidApiKey)?;
		let config = self.config.normalized()?;

		let http = build_client(config.connect_timeout)?;
		let source = HttpChangesSource::new(
			http.clone(),
			&config.sdk_url,
			api_key,
			config.request_timeout,
			config.fetch_retry.clone(),
		)?;
		let backend = self
			.backend
			.unwrap_or_else(|| Arc::new(MemoryBackend::new()));
		let repository = Repository::new(backend);

		let streaming = config.streaming_enabled && self.credentials.is_some();
		let synchronizer =
			Synchronizer::new(config, repository, Arc::new(source), http, self.credentials)?;
		synchronizer.start();
		info!(streaming, "flag sync client started");

		Ok(FlagSyncClient {
			synchronizer,
			closed: AtomicBool::new(false),
		})
	}
}

impl Default for FlagSyncClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Keeps a local copy of flag definitions and segments in sync with the
/// server.
pub struct FlagSyncClient {
	synchronizer: Synchronizer,
	closed: AtomicBool,
}

impl FlagSyncClient {
	pub fn builder() -> FlagSyncClientBuilder {
		FlagSyncClientBuilder::new()
	}

	/// The synced repository. Reads are safe at any time; they return the
	/// last merged state.
	pub fn repository(&self) -> Result<&Repository> {
		self.check_closed()?;
		Ok(self.synchronizer.repository())
	}

	/// Waits until flags and segments both finished their first full fetch.
	pub async fn wait_ready(&self, timeout: Duration) -> bool {
		self.synchronizer.repository().gate().wait_ready(timeout).await
	}

	/// Like [`wait_ready`](Self::wait_ready) but fails with
	/// [`SyncError::ReadinessTimeout`].
	pub async fn block_until_ready(&self, timeout: Duration) -> Result<()> {
		self.check_closed()?;
		if self.wait_ready(timeout).await {
			Ok(())
		} else {
			Err(SyncError::ReadinessTimeout)
		}
	}

	pub fn is_ready(&self) -> bool {
		self.synchronizer.repository().is_ready()
	}

	pub fn mode(&self) -> Option<SyncMode> {
		self.synchronizer.mode()
	}

	pub fn subscribe_mode(&self) -> watch::Receiver<Option<SyncMode>> {
		self.synchronizer.subscribe_mode()
	}

	pub fn is_streaming(&self) -> bool {
		self.synchronizer.is_streaming()
	}

	/// Stops synchronization. Later calls that need a live client return
	/// [`SyncError::ClientClosed`].
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.synchronizer.stop();
		info!("flag sync client closed");
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			return Err(SyncError::ClientClosed);
		}
		Ok(())
	}
}

impl Drop for FlagSyncClient {
	fn drop(&mut self) {
		self.close();
	}
}
