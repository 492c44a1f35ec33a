// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared HTTP client and jittered retry for the changes endpoints.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tracing::warn;

use crate::error::{Result, SyncError};

/// Returns the SDK User-Agent string.
///
/// Format: `loom-flagsync/{crate version}`
pub fn user_agent() -> String {
	format!("loom-flagsync/{}", env!("CARGO_PKG_VERSION"))
}

/// Builds the HTTP client used for diff fetches and the streaming connection.
///
/// No overall timeout is set here: the streaming response lives for hours.
/// Fetch requests apply `request_timeout` per request instead.
pub fn build_client(connect_timeout: Duration) -> Result<Client> {
	Client::builder()
		.user_agent(user_agent())
		.connect_timeout(connect_timeout)
		.build()
		.map_err(SyncError::RequestFailed)
}

/// Maps a response status onto the error taxonomy, passing successes through.
pub async fn check_status(response: Response) -> Result<Response> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		return Err(SyncError::AuthenticationFailed {
			status: status.as_u16(),
		});
	}

	if status == StatusCode::TOO_MANY_REQUESTS {
		let retry_after = response
			.headers()
			.get("Retry-After")
			.and_then(|v| v.to_str().ok())
			.and_then(|s| s.parse().ok());
		return Err(SyncError::RateLimited {
			retry_after_secs: retry_after,
		});
	}

	Err(SyncError::ServerError {
		status: status.as_u16(),
		message: response.text().await.unwrap_or_default(),
	})
}

/// Exponential backoff settings for retried operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
	/// Attempts before giving up (0 = retry until the caller stops).
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(200),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// Delay before retry number `attempt` (0-based).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exponential = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt.min(30) as i32);
		let capped = exponential.min(self.max_delay.as_secs_f64());

		let delay = if self.jitter {
			capped * (0.5 + fastrand::f64())
		} else {
			capped
		};

		Duration::from_secs_f64(delay)
	}
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted.
pub async fn retry<F, Fut, T>(cfg: &RetryConfig, mut f: F) -> Result<T>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T>>,
{
	let mut attempt = 0;

	loop {
		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				attempt += 1;

				if !err.is_retryable() {
					return Err(err);
				}

				if cfg.max_attempts > 0 && attempt >= cfg.max_attempts {
					warn!(
						error = %err,
						attempt = attempt,
						max_attempts = cfg.max_attempts,
						"max retry attempts exhausted"
					);
					return Err(err);
				}

				let delay = match &err {
					SyncError::RateLimited {
						retry_after_secs: Some(secs),
					} => Duration::from_secs(*secs).min(cfg.max_delay),
					_ => cfg.delay_for(attempt - 1),
				};
				warn!(
					error = %err,
					attempt = attempt,
					delay_ms = delay.as_millis() as u64,
					"retrying after error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	fn fast_config(max_attempts: u32) -> RetryConfig {
		RetryConfig {
			max_attempts,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(10),
			backoff_factor: 2.0,
			jitter: false,
		}
	}

	#[test]
	fn user_agent_has_crate_prefix() {
		assert!(user_agent().starts_with("loom-flagsync/"));
	}

	#[test]
	fn delay_is_capped() {
		let cfg = fast_config(3);
		assert_eq!(cfg.delay_for(0), Duration::from_millis(1));
		assert_eq!(cfg.delay_for(1), Duration::from_millis(2));
		assert_eq!(cfg.delay_for(20), Duration::from_millis(10));
	}

	#[test]
	fn jittered_delay_stays_within_bounds() {
		let cfg = RetryConfig {
			jitter: true,
			..fast_config(3)
		};
		for _ in 0..100 {
			let delay = cfg.delay_for(3);
			assert!(delay >= Duration::from_secs_f64(0.004));
			assert!(delay <= Duration::from_secs_f64(0.012));
		}
	}

	#[tokio::test]
	async fn non_retryable_error_fails_immediately() {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = Arc::clone(&attempts);

		let result: Result<()> = retry(&fast_config(3), || {
			let counter = Arc::clone(&counter);
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(SyncError::AuthenticationFailed { status: 401 })
			}
		})
		.await;

		assert!(matches!(result, Err(SyncError::AuthenticationFailed { .. })));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn retryable_error_retries_up_to_max_attempts() {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = Arc::clone(&attempts);

		let result: Result<()> = retry(&fast_config(3), || {
			let counter = Arc::clone(&counter);
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(SyncError::ServerError {
					status: 503,
					message: String::new(),
				})
			}
		})
		.await;

		assert!(result.is_err());
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn succeeds_after_transient_failures() {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = Arc::clone(&attempts);

		let result = retry(&fast_config(5), || {
			let counter = Arc::clone(&counter);
			async move {
				if counter.fetch_add(1, Ordering::SeqCst) < 2 {
					Err(SyncError::Storage("busy".to_string()))
				} else {
					Ok(7)
				}
			}
		})
		.await;

		assert_eq!(result.unwrap(), 7);
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}
}
