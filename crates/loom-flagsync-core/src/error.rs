// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors raised while decoding streaming frames and change payloads.
#[derive(Debug, Error)]
pub enum ParseError {
	#[error("invalid json: {0}")]
	Json(String),

	#[error("unexpected payload on channel {channel}: {reason}")]
	Payload { channel: String, reason: String },
}

impl From<serde_json::Error> for ParseError {
	fn from(err: serde_json::Error) -> Self {
		ParseError::Json(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, ParseError>;
