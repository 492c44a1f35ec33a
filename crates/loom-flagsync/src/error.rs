// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the flag synchronization engine.

use loom_flagsync_core::ParseError;
use thiserror::Error;

/// Result type alias for the sync engine.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while keeping the repository in sync.
#[derive(Error, Debug)]
pub enum SyncError {
	/// API key is missing or empty.
	#[error("Invalid or missing API key")]
	InvalidApiKey,

	/// A base URL is missing or invalid.
	#[error("Invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// HTTP request could not be sent or its body could not be read.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[source] reqwest::Error),

	/// Server returned a non-success status.
	#[error("Server returned an error: {status} - {message}")]
	ServerError {
		/// HTTP status code.
		status: u16,
		/// Error body returned by the server.
		message: String,
	},

	/// The API key was rejected (401/403).
	#[error("Authentication failed with status {status}")]
	AuthenticationFailed {
		/// HTTP status code.
		status: u16,
	},

	/// Rate limited.
	#[error("Rate limited. Retry after {retry_after_secs:?} seconds")]
	RateLimited {
		/// Seconds until retry is allowed.
		retry_after_secs: Option<u64>,
	},

	/// A response or frame had an unexpected structure.
	#[error("Failed to parse payload: {0}")]
	ParseFailed(String),

	/// The storage backend could not serve the operation.
	#[error("Storage backend error: {0}")]
	Storage(String),

	/// The streaming connection failed.
	#[error("Streaming connection failed: {message}")]
	StreamingFailed {
		/// What went wrong.
		message: String,
		/// Whether reconnecting may succeed.
		retryable: bool,
	},

	/// The initial synchronization did not finish in time.
	#[error("Timed out waiting for the initial synchronization")]
	ReadinessTimeout,

	/// A fetch never reached `till == since`.
	#[error("Changes for {resource} did not converge after {attempts} fetches")]
	NotConverged {
		/// Collection or segment being fetched.
		resource: String,
		/// Number of fetches issued.
		attempts: u32,
	},

	/// The client has been closed.
	#[error("Client has been closed")]
	ClientClosed,
}

impl SyncError {
	/// Returns true if this error is transient and the operation may be retried.
	pub fn is_retryable(&self) -> bool {
		match self {
			SyncError::RequestFailed(e) => !e.is_builder() && !e.is_decode(),
			SyncError::ServerError { status, .. } => matches!(status, 408 | 500..=599),
			SyncError::RateLimited { .. }
			| SyncError::Storage(_)
			| SyncError::NotConverged { .. } => true,
			SyncError::StreamingFailed { retryable, .. } => *retryable,
			_ => false,
		}
	}

	/// Returns true if retrying will never succeed without operator action.
	pub fn is_permanent(&self) -> bool {
		match self {
			SyncError::InvalidApiKey
			| SyncError::InvalidBaseUrl(_)
			| SyncError::AuthenticationFailed { .. } => true,
			SyncError::StreamingFailed { retryable, .. } => !retryable,
			_ => false,
		}
	}
}

impl From<ParseError> for SyncError {
	fn from(err: ParseError) -> Self {
		SyncError::ParseFailed(err.to_string())
	}
}
