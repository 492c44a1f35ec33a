// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Where diffs come from.

use std::time::Duration;

use async_trait::async_trait;
use loom_flagsync_core::{FlagChanges, SegmentChanges};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};
use crate::http::{check_status, retry, RetryConfig};

/// Capability to fetch everything that changed after a cursor.
#[async_trait]
pub trait ChangesSource: Send + Sync + 'static {
	async fn flag_changes(&self, since: i64) -> Result<FlagChanges>;

	async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges>;
}

/// [`ChangesSource`] backed by the `splitChanges` / `segmentChanges` endpoints.
#[derive(Debug, Clone)]
pub struct HttpChangesSource {
	client: Client,
	base_url: Url,
	api_key: String,
	request_timeout: Duration,
	retry: RetryConfig,
}

impl HttpChangesSource {
	pub fn new(
		client: Client,
		sdk_url: &str,
		api_key: impl Into<String>,
		request_timeout: Duration,
		retry: RetryConfig,
	) -> Result<Self> {
		let base_url =
			Url::parse(sdk_url).map_err(|e| SyncError::InvalidBaseUrl(format!("{sdk_url}: {e}")))?;
		if base_url.cannot_be_a_base() {
			return Err(SyncError::InvalidBaseUrl(sdk_url.to_string()));
		}
		Ok(Self {
			client,
			base_url,
			api_key: api_key.into(),
			request_timeout,
			retry,
		})
	}

	fn endpoint(&self, path: &[&str]) -> Result<Url> {
		let mut url = self.base_url.clone();
		url
			.path_segments_mut()
			.map_err(|_| SyncError::InvalidBaseUrl(self.base_url.to_string()))?
			.pop_if_empty()
			.extend(path);
		Ok(url)
	}

	async fn get<T: DeserializeOwned>(&self, url: Url, since: i64) -> Result<T> {
		retry(&self.retry, || {
			let url = url.clone();
			async move {
				let response = self
					.client
					.get(url)
					.query(&[("since", since)])
					.bearer_auth(&self.api_key)
					.timeout(self.request_timeout)
					.send()
					.await
					.map_err(SyncError::RequestFailed)?;
				let body = check_status(response)
					.await?
					.text()
					.await
					.map_err(SyncError::RequestFailed)?;
				serde_json::from_str(&body).map_err(|e| SyncError::ParseFailed(e.to_string()))
			}
		})
		.await
	}
}

#[async_trait]
impl ChangesSource for HttpChangesSource {
	#[instrument(skip(self))]
	async fn flag_changes(&self, since: i64) -> Result<FlagChanges> {
		let url = self.endpoint(&["splitChanges"])?;
		let changes: FlagChanges = self.get(url, since).await?;
		debug!(till = changes.till, count = changes.flags.len(), "fetched flag changes");
		Ok(changes)
	}

	#[instrument(skip(self))]
	async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges> {
		let url = self.endpoint(&["segmentChanges", name])?;
		let changes: SegmentChanges = self.get(url, since).await?;
		debug!(
			till = changes.till,
			added = changes.added.len(),
			removed = changes.removed.len(),
			"fetched segment changes"
		);
		Ok(changes)
	}
}
