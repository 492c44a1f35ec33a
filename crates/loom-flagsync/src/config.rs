// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the synchronization engine.

use std::time::Duration;

use reqwest::Url;

use crate::error::{Result, SyncError};
use crate::http::RetryConfig;

pub const DEFAULT_SDK_URL: &str = "https://sdk.split.io/api";
pub const DEFAULT_STREAMING_URL: &str = "https://streaming.split.io/event-stream";

/// Protocol version requested on the streaming connection.
const STREAMING_PROTOCOL_VERSION: &str = "1.1";

/// Settings shared by every component of the engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Base URL of the changes endpoints.
	pub sdk_url: String,
	/// Base URL of the streaming endpoint.
	pub streaming_url: String,
	/// Whether push updates are attempted at all.
	pub streaming_enabled: bool,
	/// Polling interval for flags.
	pub features_refresh_rate: Duration,
	/// Polling interval for segments.
	pub segments_refresh_rate: Duration,
	/// Per-request timeout for diff fetches.
	pub request_timeout: Duration,
	/// How long `start` waits for the streaming connection to be confirmed.
	pub connect_timeout: Duration,
	/// Silence on the stream longer than this is treated as a dead connection.
	pub read_timeout: Duration,
	/// How long an occupancy transition must hold before it is acted on.
	pub occupancy_debounce: Duration,
	pub reconnect: ReconnectConfig,
	/// Backoff for the initial synchronization, which retries until it succeeds.
	pub init_retry: RetryConfig,
	/// Backoff for a single diff request.
	pub fetch_retry: RetryConfig,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			sdk_url: DEFAULT_SDK_URL.to_string(),
			streaming_url: DEFAULT_STREAMING_URL.to_string(),
			streaming_enabled: true,
			features_refresh_rate: Duration::from_secs(5),
			segments_refresh_rate: Duration::from_secs(60),
			request_timeout: Duration::from_secs(5),
			connect_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(70),
			occupancy_debounce: Duration::from_secs(2),
			reconnect: ReconnectConfig::default(),
			init_retry: RetryConfig {
				max_attempts: 0,
				..RetryConfig::default()
			},
			fetch_retry: RetryConfig::default(),
		}
	}
}

impl SyncConfig {
	/// Checks the URLs and trims trailing slashes.
	pub fn normalized(mut self) -> Result<Self> {
		self.sdk_url = normalize_url(&self.sdk_url)?;
		self.streaming_url = normalize_url(&self.streaming_url)?;
		Ok(self)
	}
}

fn normalize_url(url: &str) -> Result<String> {
	let trimmed = url.trim().trim_end_matches('/');
	if trimmed.is_empty() {
		return Err(SyncError::InvalidBaseUrl(url.to_string()));
	}
	Url::parse(trimmed).map_err(|e| SyncError::InvalidBaseUrl(format!("{url}: {e}")))?;
	Ok(trimmed.to_string())
}

/// Backoff between streaming reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl ReconnectConfig {
	/// Delay before reconnect attempt `attempt` (0-based), doubling up to `max_delay`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let factor = 2u32.saturating_pow(attempt.min(16));
		self.base_delay.saturating_mul(factor).min(self.max_delay)
	}
}

/// Credentials for the streaming connection, issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingCredentials {
	pub token: String,
	/// Channel names exactly as issued, occupancy prefixes included.
	pub channels: Vec<String>,
	/// Our own publisher id. Notifications carrying it are echoes and skipped.
	pub client_id: Option<String>,
}

impl StreamingCredentials {
	pub fn new(token: impl Into<String>, channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			token: token.into(),
			channels: channels.into_iter().map(Into::into).collect(),
			client_id: None,
		}
	}

	pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = Some(client_id.into());
		self
	}

	/// Builds `{streaming_url}?channels=<a,b>&v=1.1&accessToken=<token>`.
	pub fn stream_url(&self, streaming_url: &str) -> Result<Url> {
		let channels = self.channels.join(",");
		Url::parse_with_params(
			streaming_url,
			&[
				("channels", channels.as_str()),
				("v", STREAMING_PROTOCOL_VERSION),
				("accessToken", self.token.as_str()),
			],
		)
		.map_err(|e| SyncError::InvalidBaseUrl(format!("{streaming_url}: {e}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = SyncConfig::default();
		assert_eq!(config.sdk_url, DEFAULT_SDK_URL);
		assert!(config.streaming_enabled);
		assert_eq!(config.features_refresh_rate, Duration::from_secs(5));
		assert_eq!(config.segments_refresh_rate, Duration::from_secs(60));
		assert_eq!(config.read_timeout, Duration::from_secs(70));
		assert_eq!(config.init_retry.max_attempts, 0);
		assert_eq!(config.fetch_retry.max_attempts, 3);
	}

	#[test]
	fn test_normalized_trims_trailing_slash() {
		let config = SyncConfig {
			sdk_url: "https://flags.example.com/api/".to_string(),
			..SyncConfig::default()
		}
		.normalized()
		.unwrap();
		assert_eq!(config.sdk_url, "https://flags.example.com/api");
	}

	#[test]
	fn test_normalized_rejects_garbage() {
		let config = SyncConfig {
			streaming_url: "not a url".to_string(),
			..SyncConfig::default()
		};
		assert!(matches!(config.normalized(), Err(SyncError::InvalidBaseUrl(_))));

		let config = SyncConfig {
			sdk_url: " / ".to_string(),
			..SyncConfig::default()
		};
		assert!(matches!(config.normalized(), Err(SyncError::InvalidBaseUrl(_))));
	}

	#[test]
	fn test_reconnect_backoff_doubles_and_caps() {
		let config = ReconnectConfig::default();
		assert_eq!(config.delay_for(0), Duration::from_secs(1));
		assert_eq!(config.delay_for(1), Duration::from_secs(2));
		assert_eq!(config.delay_for(3), Duration::from_secs(8));
		assert_eq!(config.delay_for(5), Duration::from_secs(30));
		assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
	}

	#[test]
	fn test_stream_url_carries_channels_version_and_token() {
		let credentials = StreamingCredentials::new(
			"tok",
			["abc_splits", "[?occupancy=metrics.publishers]control_pri"],
		);
		let url = credentials.stream_url(DEFAULT_STREAMING_URL).unwrap();
		let pairs: Vec<(String, String)> = url
			.query_pairs()
			.map(|(k, v)| (k.into_owned(), v.into_owned()))
			.collect();
		assert_eq!(
			pairs,
			vec![
				(
					"channels".to_string(),
					"abc_splits,[?occupancy=metrics.publishers]control_pri".to_string()
				),
				("v".to_string(), "1.1".to_string()),
				("accessToken".to_string(), "tok".to_string()),
			]
		);
		assert!(url.as_str().starts_with(DEFAULT_STREAMING_URL));
	}
}
