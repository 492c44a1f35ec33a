// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Top-level orchestration of push and pull synchronization.
//!
//! Startup runs one full fetch of flags, then segments, and opens the
//! readiness gate. After that the synchronizer is in one of two modes:
//!
//! - **Streaming**: workers consume notifications from the streaming client.
//! - **Polling**: polling stores fetch on a jittered timer.
//!
//! Mode switches happen only here. Losing publishers fails over to polling
//! but keeps the connection open, since that is where recovery shows up.
//! Losing the connection closes it and schedules a reconnect with backoff.
//! Every failback stops polling, restarts the workers and runs a catch-up
//! fetch from the cursors held at the time of the failover.

use std::sync::Arc;

use loom_flagsync_core::Collection;
use reqwest::{Client, Url};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{StreamingCredentials, SyncConfig};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::fetcher::{FlagFetcher, SegmentFetcher};
use crate::occupancy::OccupancyKeeper;
use crate::polling::PollingStore;
use crate::processor::NotificationProcessor;
use crate::repository::Repository;
use crate::source::ChangesSource;
use crate::sse::StreamingClient;
use crate::util::lock;
use crate::worker::Worker;

/// How the repository is currently kept fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
	Streaming,
	Polling,
}

struct Streaming {
	client: StreamingClient,
	url: Url,
	occupancy: OccupancyKeeper,
}

struct Inner {
	config: SyncConfig,
	repository: Repository,
	flags: FlagFetcher,
	segments: SegmentFetcher,
	flag_worker: Arc<Worker>,
	segment_worker: Arc<Worker>,
	flag_poller: PollingStore,
	segment_poller: PollingStore,
	streaming: Option<Streaming>,
	events: Mutex<mpsc::UnboundedReceiver<SyncEvent>>,
	mode: watch::Sender<Option<SyncMode>>,
}

impl Inner {
	fn set_mode(&self, mode: SyncMode) {
		let previous = self.mode.send_replace(Some(mode));
		if previous != Some(mode) {
			info!(?mode, "synchronization mode changed");
		}
	}

	fn start_workers(&self) {
		self.flag_worker.start();
		self.segment_worker.start();
	}

	fn stop_workers(&self) {
		self.flag_worker.stop();
		self.segment_worker.stop();
	}

	fn start_polling(&self) {
		self.flag_poller.start();
		self.segment_poller.start();
	}

	fn stop_polling(&self) {
		self.flag_poller.stop();
		self.segment_poller.stop();
	}

	fn shutdown(&self) {
		if let Some(streaming) = &self.streaming {
			streaming.client.close();
		}
		self.stop_workers();
		self.stop_polling();
	}
}

/// Keeps a [`Repository`] in sync by streaming, polling, or both in turn.
pub struct Synchronizer {
	inner: Arc<Inner>,
	/// Holds the event channel open when no streaming client does.
	#[cfg_attr(not(test), allow(dead_code))]
	events_tx: mpsc::UnboundedSender<SyncEvent>,
	task: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Synchronizer {
	/// Wires the engine together. Streaming is used when `credentials` are
	/// given and `config.streaming_enabled` is set; otherwise the
	/// synchronizer only polls.
	pub fn new(
		config: SyncConfig,
		repository: Repository,
		source: Arc<dyn ChangesSource>,
		http: Client,
		credentials: Option<StreamingCredentials>,
	) -> Result<Self> {
		let flags = FlagFetcher::new(Arc::clone(&source), repository.clone());
		let segments = SegmentFetcher::new(source, repository.clone());

		let flag_worker = Arc::new(Worker::new(Arc::new(flags.clone())));
		let segment_worker = Arc::new(Worker::new(Arc::new(segments.clone())));
		let flag_poller = PollingStore::new(Arc::new(flags.clone()), config.features_refresh_rate);
		let segment_poller = PollingStore::new(Arc::new(segments.clone()), config.segments_refresh_rate);

		let (events_tx, events_rx) = mpsc::unbounded_channel();

		let streaming = match credentials {
			Some(credentials) if config.streaming_enabled => {
				let url = credentials.stream_url(&config.streaming_url)?;
				let occupancy = OccupancyKeeper::new(config.occupancy_debounce, events_tx.clone());
				let processor = NotificationProcessor::new(
					repository.clone(),
					Arc::clone(&flag_worker),
					Arc::clone(&segment_worker),
					occupancy.clone(),
					events_tx.clone(),
				)
				.with_client_id(credentials.client_id.clone());
				let client = StreamingClient::new(
					http,
					Arc::new(processor),
					events_tx.clone(),
					config.connect_timeout,
					config.read_timeout,
				);
				Some(Streaming {
					client,
					url,
					occupancy,
				})
			}
			_ => None,
		};

		let (mode, _) = watch::channel(None);

		Ok(Self {
			inner: Arc::new(Inner {
				config,
				repository,
				flags,
				segments,
				flag_worker,
				segment_worker,
				flag_poller,
				segment_poller,
				streaming,
				events: Mutex::new(events_rx),
				mode,
			}),
			events_tx,
			task: std::sync::Mutex::new(None),
		})
	}

	pub fn repository(&self) -> &Repository {
		&self.inner.repository
	}

	/// Starts synchronizing in the background. No-op if already running.
	pub fn start(&self) {
		let mut task = lock(&self.task);
		if task.as_ref().is_some_and(|(cancel, _)| !cancel.is_cancelled()) {
			return;
		}
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run(Arc::clone(&self.inner), cancel.clone()));
		*task = Some((cancel, handle));
	}

	/// Stops every background task and releases the streaming connection.
	///
	/// Returns without waiting for a fetch in flight; that fetch completes its
	/// merge and then nothing further runs.
	pub fn stop(&self) {
		if let Some((cancel, _handle)) = lock(&self.task).take() {
			cancel.cancel();
			info!("synchronizer stopped");
		}
		self.inner.shutdown();
	}

	pub fn is_running(&self) -> bool {
		lock(&self.task)
			.as_ref()
			.is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
	}

	/// Current mode; `None` until the initial synchronization finished.
	pub fn mode(&self) -> Option<SyncMode> {
		*self.inner.mode.borrow()
	}

	pub fn subscribe_mode(&self) -> watch::Receiver<Option<SyncMode>> {
		self.inner.mode.subscribe()
	}

	/// Whether updates are currently arriving over a live connection.
	pub fn is_streaming(&self) -> bool {
		self.mode() == Some(SyncMode::Streaming)
			&& self
				.inner
				.streaming
				.as_ref()
				.is_some_and(|s| s.client.is_connected())
	}

	#[cfg(test)]
	pub(crate) fn inject(&self, event: SyncEvent) {
		let _ = self.events_tx.send(event);
	}
}

impl Drop for Synchronizer {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Orchestrator state that only the background task touches.
struct Controller<'a> {
	inner: &'a Inner,
	cancel: &'a CancellationToken,
	/// Set after a permanent streaming failure.
	streaming_disabled: bool,
	/// Polling because occupancy dropped while the connection stayed up.
	paused_by_occupancy: bool,
	reconnect_attempt: u32,
	reconnect_at: Option<Instant>,
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
	if let Err(e) = initial_sync(&inner, &cancel).await {
		match e {
			SyncError::ClientClosed => debug!("stopped before initial synchronization finished"),
			e => error!(error = %e, "initial synchronization failed permanently"),
		}
		return;
	}
	if cancel.is_cancelled() {
		return;
	}

	let mut controller = Controller {
		inner: &inner,
		cancel: &cancel,
		streaming_disabled: false,
		paused_by_occupancy: false,
		reconnect_attempt: 0,
		reconnect_at: None,
	};

	if inner.streaming.is_some() {
		controller.connect().await;
	} else {
		controller.enter_polling();
	}

	let mut events = inner.events.lock().await;
	loop {
		let reconnect_at = controller.reconnect_at;
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			_ = sleep_until(reconnect_at) => {
				controller.reconnect_at = None;
				controller.connect().await;
			}
			event = events.recv() => match event {
				Some(event) => controller.handle(event).await,
				None => break,
			},
		}
	}

	inner.shutdown();
	debug!("synchronizer task exited");
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

#[instrument(skip_all)]
async fn initial_sync(inner: &Inner, cancel: &CancellationToken) -> Result<()> {
	let retry = &inner.config.init_retry;
	let gate = inner.repository.gate();

	inner.flag_poller.run_until_success(retry, cancel).await?;
	gate.mark_synced(Collection::Flags);
	inner.segment_poller.run_until_success(retry, cancel).await?;
	gate.mark_synced(Collection::Segments);

	let flags = inner
		.repository
		.change_number(Collection::Flags)
		.await
		.unwrap_or_default();
	let segments = inner
		.repository
		.change_number(Collection::Segments)
		.await
		.unwrap_or_default();
	info!(flags, segments, "repository ready");
	Ok(())
}

impl Controller<'_> {
	async fn handle(&mut self, event: SyncEvent) {
		debug!(?event, "sync event");
		match event {
			SyncEvent::PublishersUnavailable => {
				if self.current_mode() == Some(SyncMode::Streaming) {
					info!("no publishers, failing over to polling");
					self.paused_by_occupancy = true;
					self.enter_polling();
				}
			}
			SyncEvent::PublishersAvailable => {
				if self.paused_by_occupancy {
					info!("publishers back, failing back to streaming");
					self.paused_by_occupancy = false;
					self.enter_streaming().await;
				}
			}
			SyncEvent::StreamDisconnected => self.on_connection_lost(true),
			SyncEvent::StreamError { retryable } => self.on_connection_lost(retryable),
			SyncEvent::Control(control_type) => {
				info!(control = control_type.as_str(), "control notification received");
			}
		}
	}

	/// Opens the connection and enters streaming mode, or falls back to polling.
	async fn connect(&mut self) {
		let Some(streaming) = &self.inner.streaming else {
			return;
		};
		if self.streaming_disabled || self.cancel.is_cancelled() {
			return;
		}

		streaming.occupancy.reset();
		self.paused_by_occupancy = false;
		self.inner.start_workers();

		if streaming.client.start(streaming.url.clone()).await {
			self.reconnect_attempt = 0;
			self.enter_streaming().await;
		} else {
			self.on_connection_lost(!streaming.client.last_failure_was_permanent());
		}
	}

	async fn enter_streaming(&mut self) {
		if self.cancel.is_cancelled() {
			return;
		}
		self.inner.stop_polling();
		self.inner.start_workers();
		self.inner.set_mode(SyncMode::Streaming);
		self.catch_up().await;
	}

	fn enter_polling(&mut self) {
		if self.cancel.is_cancelled() {
			return;
		}
		self.inner.stop_workers();
		self.inner.start_polling();
		self.inner.set_mode(SyncMode::Polling);
	}

	fn on_connection_lost(&mut self, retryable: bool) {
		if let Some(streaming) = &self.inner.streaming {
			streaming.client.close();
		}
		self.paused_by_occupancy = false;
		self.enter_polling();

		if !retryable {
			error!("streaming disabled after a permanent failure, staying on polling");
			self.streaming_disabled = true;
			self.reconnect_at = None;
			return;
		}

		let delay = self.inner.config.reconnect.delay_for(self.reconnect_attempt);
		self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
		self.reconnect_at = Some(Instant::now() + delay);
		warn!(
			delay_ms = delay.as_millis() as u64,
			attempt = self.reconnect_attempt,
			"streaming connection lost, reconnect scheduled"
		);
	}

	/// Fetches everything that changed while notifications were not being
	/// applied.
	async fn catch_up(&self) {
		let since = self
			.inner
			.repository
			.change_number(Collection::Flags)
			.await
			.unwrap_or_default();
		debug!(since, "catch-up fetch");
		if let Err(e) = self.inner.flags.sync().await {
			warn!(error = %e, "flag catch-up failed");
		}
		if let Err(e) = self.inner.segments.fetch_all().await {
			warn!(error = %e, "segment catch-up failed");
		}
	}

	fn current_mode(&self) -> Option<SyncMode> {
		*self.inner.mode.borrow()
	}
}
