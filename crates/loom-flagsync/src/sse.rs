// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming client for push notifications over server-sent events.
//!
//! The client owns one connection at a time:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected   (server closed)
//!                     |             |
//!                     +-------------+-----> Errored         (status, transport, in-band error)
//! ```
//!
//! Reconnecting is not the client's business: it reports what happened and
//! the synchronizer decides when to call [`StreamingClient::start`] again.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use loom_flagsync_core::parse_frame;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode, Url};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::processor::{NotificationProcessor, ProcessOutcome};
use crate::util::lock;

const EVENT_STREAM: &str = "text/event-stream";

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Errored,
}

/// How a confirmed connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamEnd {
	Closed,
	Failed { retryable: bool, reason: String },
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
	#[error("transport error: {0}")]
	Transport(String),
	#[error("no data received for {0:?}")]
	Idle(Duration),
}

struct Shared {
	http: Client,
	processor: Arc<NotificationProcessor>,
	events: mpsc::UnboundedSender<SyncEvent>,
	state: watch::Sender<ConnectionState>,
	read_timeout: Duration,
	permanent_failure: AtomicBool,
}

impl Shared {
	fn set_state(&self, state: ConnectionState) {
		self.state.send_replace(state);
	}

	fn fail(&self, err: &SyncError) {
		let permanent = err.is_permanent();
		self.permanent_failure.store(permanent, Ordering::SeqCst);
		if permanent {
			error!(error = %err, "streaming connection rejected");
		} else {
			warn!(error = %err, "streaming connection failed");
		}
		self.set_state(ConnectionState::Errored);
	}
}

/// Owner of the streaming connection.
pub struct StreamingClient {
	shared: Arc<Shared>,
	connect_timeout: Duration,
	task: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StreamingClient {
	pub fn new(
		http: Client,
		processor: Arc<NotificationProcessor>,
		events: mpsc::UnboundedSender<SyncEvent>,
		connect_timeout: Duration,
		read_timeout: Duration,
	) -> Self {
		let (state, _) = watch::channel(ConnectionState::Disconnected);
		Self {
			shared: Arc::new(Shared {
				http,
				processor,
				events,
				state,
				read_timeout,
				permanent_failure: AtomicBool::new(false),
			}),
			connect_timeout,
			task: std::sync::Mutex::new(None),
		}
	}

	pub fn state(&self) -> ConnectionState {
		*self.shared.state.borrow()
	}

	pub fn is_connected(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	/// Watches state transitions.
	pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
		self.shared.state.subscribe()
	}

	/// Whether the last failure was one reconnecting cannot fix (400/401/403
	/// or a non-retryable in-band error code).
	pub fn last_failure_was_permanent(&self) -> bool {
		self.shared.permanent_failure.load(Ordering::SeqCst)
	}

	/// Opens a connection to `url` and waits until it is confirmed.
	///
	/// Returns true once the server answered with an event stream, false if
	/// the attempt failed or did not complete within the connect timeout.
	/// Any previous connection is closed first.
	pub async fn start(&self, url: Url) -> bool {
		self.close();

		let mut state = self.shared.state.subscribe();
		self.shared.permanent_failure.store(false, Ordering::SeqCst);
		self.shared.set_state(ConnectionState::Connecting);

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run(Arc::clone(&self.shared), url, cancel.clone()));
		*lock(&self.task) = Some((cancel, handle));

		let outcome = tokio::time::timeout(
			self.connect_timeout,
			state.wait_for(|s| *s != ConnectionState::Connecting),
		)
		.await
		.ok()
		.and_then(|r| r.ok().map(|s| *s));

		match outcome {
			Some(ConnectionState::Connected) => true,
			Some(_) => false,
			None => {
				warn!(
					timeout_ms = self.connect_timeout.as_millis() as u64,
					"streaming connection not confirmed in time"
				);
				self.close();
				false
			}
		}
	}

	/// Drops the connection. Idempotent, never emits an event, and always
	/// leaves the client `Disconnected`.
	pub fn close(&self) {
		if let Some((cancel, handle)) = lock(&self.task).take() {
			cancel.cancel();
			handle.abort();
			debug!("streaming connection closed");
		}
		self.shared.set_state(ConnectionState::Disconnected);
	}
}

impl Drop for StreamingClient {
	fn drop(&mut self) {
		self.close();
	}
}

async fn run(shared: Arc<Shared>, url: Url, cancel: CancellationToken) {
	let response = tokio::select! {
		_ = cancel.cancelled() => return,
		response = connect(&shared.http, url) => response,
	};
	let response = match response {
		Ok(response) => response,
		Err(e) => {
			if !cancel.is_cancelled() {
				shared.fail(&e);
			}
			return;
		}
	};

	shared.set_state(ConnectionState::Connected);
	info!("streaming connection established");

	let end = tokio::select! {
		_ = cancel.cancelled() => return,
		end = read_stream(response.bytes_stream(), &shared.processor, shared.read_timeout) => end,
	};
	if cancel.is_cancelled() {
		return;
	}

	match end {
		StreamEnd::Closed => {
			info!("streaming connection closed by server");
			shared.set_state(ConnectionState::Disconnected);
			let _ = shared.events.send(SyncEvent::StreamDisconnected);
		}
		StreamEnd::Failed { retryable, reason } => {
			shared.fail(&SyncError::StreamingFailed {
				message: reason,
				retryable,
			});
			let _ = shared.events.send(SyncEvent::StreamError { retryable });
		}
	}
}

async fn connect(http: &Client, url: Url) -> Result<Response, SyncError> {
	let response = http
		.get(url)
		.header(ACCEPT, EVENT_STREAM)
		.header(CACHE_CONTROL, "no-cache")
		.send()
		.await
		.map_err(|e| SyncError::StreamingFailed {
			message: e.to_string(),
			retryable: true,
		})?;

	let status = response.status();
	if matches!(
		status,
		StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
	) {
		return Err(SyncError::StreamingFailed {
			message: format!("server rejected stream with status {status}"),
			retryable: false,
		});
	}
	if !status.is_success() {
		return Err(SyncError::StreamingFailed {
			message: format!("server returned status {status}"),
			retryable: true,
		});
	}

	let content_type = response
		.headers()
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	if !content_type.starts_with(EVENT_STREAM) {
		return Err(SyncError::StreamingFailed {
			message: format!("unexpected content type {content_type:?}"),
			retryable: true,
		});
	}

	Ok(response)
}

struct Reader<S> {
	inner: std::pin::Pin<Box<S>>,
	carry: Vec<u8>,
	done: bool,
}

/// Appends `bytes` to `carry` and returns everything decodable so far.
///
/// Invalid sequences become U+FFFD so a corrupt frame cannot stall the
/// event parser. An incomplete sequence at the end stays in `carry` for the
/// next chunk.
fn decode_lossy(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
	carry.extend_from_slice(bytes);
	let mut text = String::with_capacity(carry.len());
	let mut rest: &[u8] = carry;
	loop {
		match std::str::from_utf8(rest) {
			Ok(valid) => {
				text.push_str(valid);
				rest = &[];
				break;
			}
			Err(e) => {
				let (valid, after) = rest.split_at(e.valid_up_to());
				text.push_str(&String::from_utf8_lossy(valid));
				match e.error_len() {
					Some(len) => {
						text.push(char::REPLACEMENT_CHARACTER);
						rest = &after[len..];
					}
					None => {
						rest = after;
						break;
					}
				}
			}
		}
	}
	let pending = rest.to_vec();
	*carry = pending;
	text
}

/// Reads frames off `stream` until it ends, fails, stays silent for
/// `read_timeout`, or the server sends an error.
///
/// Frames that fail to parse are logged and skipped; they never end the
/// connection.
pub(crate) async fn read_stream<S, B, E>(
	stream: S,
	processor: &NotificationProcessor,
	read_timeout: Duration,
) -> StreamEnd
where
	S: Stream<Item = Result<B, E>> + Send + 'static,
	B: AsRef<[u8]> + Send + 'static,
	E: Display + Send + 'static,
{
	let reader = Reader {
		inner: Box::pin(stream),
		carry: Vec::new(),
		done: false,
	};
	let guarded = futures::stream::unfold(reader, move |mut reader| async move {
		if reader.done {
			return None;
		}
		match tokio::time::timeout(read_timeout, reader.inner.next()).await {
			Ok(Some(Ok(chunk))) => {
				let text = decode_lossy(&mut reader.carry, chunk.as_ref());
				Some((Ok(text), reader))
			}
			Ok(Some(Err(e))) => Some((Err(ReadError::Transport(e.to_string())), reader)),
			Ok(None) if reader.carry.is_empty() => None,
			Ok(None) => {
				let text = String::from_utf8_lossy(&reader.carry).into_owned();
				reader.carry.clear();
				reader.done = true;
				Some((Ok(text), reader))
			}
			Err(_) => {
				reader.done = true;
				Some((Err(ReadError::Idle(read_timeout)), reader))
			}
		}
	});
	let mut events = Box::pin(guarded.eventsource());

	while let Some(event) = events.next().await {
		let event = match event {
			Ok(event) => event,
			Err(e) => {
				return StreamEnd::Failed {
					retryable: true,
					reason: e.to_string(),
				};
			}
		};

		let notification = match parse_frame(&event.event, &event.data) {
			Ok(Some(notification)) => notification,
			Ok(None) => {
				debug!(event = %event.event, "frame without payload ignored");
				continue;
			}
			Err(e) => {
				warn!(error = %e, data = %event.data, "failed to parse frame");
				continue;
			}
		};

		if let ProcessOutcome::Terminate { retryable } = processor.process(notification).await {
			return StreamEnd::Failed {
				retryable,
				reason: "server sent an error event".to_string(),
			};
		}
	}

	StreamEnd::Closed
}
