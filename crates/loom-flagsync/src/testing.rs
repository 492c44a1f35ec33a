// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loom_flagsync_core::{
	Condition, FlagChanges, FlagDefinition, Matcher, MatcherGroup, SegmentChanges,
	OCCUPANCY_CHANNEL_PREFIX,
};
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::source::ChangesSource;

pub fn flag_with_segment(name: &str, segment: &str, change_number: i64) -> FlagDefinition {
	let mut flag = FlagDefinition::new(name, "off", change_number);
	flag.conditions.push(Condition {
		condition_type: None,
		matcher_group: MatcherGroup {
			combiner: None,
			matchers: vec![Matcher::in_segment(segment)],
		},
		partitions: vec![],
		label: None,
	});
	flag
}

/// A [`ChangesSource`] that answers from a script and records every call.
///
/// Any cursor without a scripted response gets an empty caught-up answer
/// (`till == since`).
#[derive(Debug, Default)]
pub struct ScriptedSource {
	flag_responses: Mutex<HashMap<i64, FlagChanges>>,
	segment_responses: Mutex<HashMap<(String, i64), SegmentChanges>>,
	flag_calls: Mutex<Vec<i64>>,
	segment_calls: Mutex<Vec<(String, i64)>>,
	failures: AtomicU32,
	latency: Mutex<Option<Duration>>,
}

impl ScriptedSource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_flags(self, since: i64, till: i64, flags: Vec<FlagDefinition>) -> Self {
		self.script_flags(since, till, flags);
		self
	}

	pub fn with_segment(self, name: &str, since: i64, till: i64, added: &[&str], removed: &[&str]) -> Self {
		self.script_segment(name, since, till, added, removed);
		self
	}

	pub fn script_flags(&self, since: i64, till: i64, flags: Vec<FlagDefinition>) {
		let mut responses = self.flag_responses.lock().unwrap();
		responses.insert(since, FlagChanges { flags, since, till });
	}

	pub fn script_segment(&self, name: &str, since: i64, till: i64, added: &[&str], removed: &[&str]) {
		let mut responses = self.segment_responses.lock().unwrap();
		responses.insert(
			(name.to_string(), since),
			SegmentChanges {
				name: name.to_string(),
				added: added.iter().map(|s| s.to_string()).collect(),
				removed: removed.iter().map(|s| s.to_string()).collect(),
				since,
				till,
			},
		);
	}

	/// Makes the next `count` calls fail with a 503.
	pub fn fail_next(&self, count: u32) {
		self.failures.store(count, Ordering::SeqCst);
	}

	/// Delays every response by `latency`.
	pub fn set_latency(&self, latency: Duration) {
		*self.latency.lock().unwrap() = Some(latency);
	}

	pub fn flag_calls(&self) -> Vec<i64> {
		self.flag_calls.lock().unwrap().clone()
	}

	pub fn segment_calls(&self) -> Vec<(String, i64)> {
		self.segment_calls.lock().unwrap().clone()
	}

	pub fn segment_calls_for(&self, name: &str) -> Vec<i64> {
		self
			.segment_calls()
			.into_iter()
			.filter(|(n, _)| n == name)
			.map(|(_, since)| since)
			.collect()
	}

	async fn respond(&self) -> Result<()> {
		let latency = *self.latency.lock().unwrap();
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}
		let failed = self
			.failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failed {
			return Err(SyncError::ServerError {
				status: 503,
				message: "scripted failure".to_string(),
			});
		}
		Ok(())
	}
}

#[async_trait]
impl ChangesSource for ScriptedSource {
	async fn flag_changes(&self, since: i64) -> Result<FlagChanges> {
		self.flag_calls.lock().unwrap().push(since);
		self.respond().await?;
		let scripted = self.flag_responses.lock().unwrap().get(&since).cloned();
		Ok(scripted.unwrap_or(FlagChanges {
			flags: vec![],
			since,
			till: since,
		}))
	}

	async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges> {
		self
			.segment_calls
			.lock()
			.unwrap()
			.push((name.to_string(), since));
		self.respond().await?;
		let scripted = self
			.segment_responses
			.lock()
			.unwrap()
			.get(&(name.to_string(), since))
			.cloned();
		Ok(scripted.unwrap_or(SegmentChanges {
			name: name.to_string(),
			added: vec![],
			removed: vec![],
			since,
			till: since,
		}))
	}
}

/// Waits up to five seconds for `condition` to hold.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
	tokio::time::timeout(Duration::from_secs(5), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition not met in time");
}

pub fn flag_update_frame(change_number: i64) -> String {
	let inner = format!(r#"{{"type":"SPLIT_UPDATE","changeNumber":{change_number}}}"#);
	data_frame(&serde_json::json!({"channel": "xx_splits", "data": inner}).to_string())
}

pub fn occupancy_frame(channel: &str, publishers: u32) -> String {
	let inner = format!(r#"{{"metrics":{{"publishers":{publishers}}}}}"#);
	data_frame(
		&serde_json::json!({
			"channel": format!("{OCCUPANCY_CHANNEL_PREFIX}{channel}"),
			"data": inner,
			"name": "[meta]occupancy",
		})
		.to_string(),
	)
}

pub fn error_frame(code: i64) -> String {
	format!(
		"event: error\ndata: {}\n\n",
		serde_json::json!({"message": "error", "code": code, "statusCode": 401})
	)
}

fn data_frame(data: &str) -> String {
	format!("data: {data}\n\n")
}

#[derive(Debug, Clone)]
enum ServerCommand {
	Frame(String),
	Hangup,
}

/// Minimal event-stream server that keeps connections open until told
/// otherwise.
pub struct SseServer {
	addr: SocketAddr,
	commands: broadcast::Sender<ServerCommand>,
	connections: Arc<AtomicUsize>,
	accept: JoinHandle<()>,
}

impl SseServer {
	pub async fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (commands, _) = broadcast::channel(64);
		let connections = Arc::new(AtomicUsize::new(0));

		let accept = {
			let commands = commands.clone();
			let connections = Arc::clone(&connections);
			tokio::spawn(async move {
				while let Ok((mut socket, _)) = listener.accept().await {
					let mut rx = commands.subscribe();
					let connections = Arc::clone(&connections);
					tokio::spawn(async move {
						let mut request = Vec::new();
						let mut buf = [0u8; 1024];
						while !request.windows(4).any(|w| w == b"\r\n\r\n") {
							match socket.read(&mut buf).await {
								Ok(0) | Err(_) => return,
								Ok(n) => request.extend_from_slice(&buf[..n]),
							}
						}
						let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n";
						if socket.write_all(head.as_bytes()).await.is_err() {
							return;
						}
						connections.fetch_add(1, Ordering::SeqCst);
						while let Ok(command) = rx.recv().await {
							match command {
								ServerCommand::Frame(frame) => {
									if socket.write_all(frame.as_bytes()).await.is_err() {
										return;
									}
								}
								ServerCommand::Hangup => return,
							}
						}
					});
				}
			})
		};

		Self {
			addr,
			commands,
			connections,
			accept,
		}
	}

	pub fn url(&self) -> Url {
		Url::parse(&format!("http://{}/event-stream", self.addr)).unwrap()
	}

	pub fn send(&self, frame: String) {
		let _ = self.commands.send(ServerCommand::Frame(frame));
	}

	/// Closes every open connection.
	pub fn hang_up(&self) {
		let _ = self.commands.send(ServerCommand::Hangup);
	}

	/// Connections that received response headers so far.
	pub fn connections(&self) -> usize {
		self.connections.load(Ordering::SeqCst)
	}
}

impl Drop for SseServer {
	fn drop(&mut self) {
		self.accept.abort();
	}
}
