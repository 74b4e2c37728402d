use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

use crate::{
	constants::{HUB_SWEEP_INTERVAL, OUTBOUND_QUEUE_SIZE},
	db::Role,
};

use super::frame::Frame;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HubError {
	#[error("{username} is not connected")]
	NotConnected { username: String },
	#[error("outbound queue is full for {username}")]
	Backpressure { username: String },
	#[error("connection to {username} is closed")]
	Closed { username: String },
}

/// Shared handle to one live connection. The writer task drains the
/// outbound queue; everything else only ever enqueues. The close latch is
/// a watch channel so a late subscriber still observes an earlier close.
#[derive(Clone)]
pub struct ConnectionHandle {
	pub conn_id: u64,
	pub username: String,
	pub role: Role,
	outbound: mpsc::Sender<Frame>,
	shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
	pub fn new(
		conn_id: u64,
		username: String,
		role: Role,
		outbound: mpsc::Sender<Frame>,
		shutdown: Arc<watch::Sender<bool>>,
	) -> Self {
		ConnectionHandle { conn_id, username, role, outbound, shutdown }
	}

	/// One-shot close latch: idempotent, and observable by subscribers
	/// that only start listening afterwards.
	pub fn close(&self) {
		self.shutdown.send_replace(true);
	}

	pub fn is_closed(&self) -> bool {
		*self.shutdown.borrow()
	}

	pub fn closed_signal(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	fn try_send(&self, frame: Frame) -> Result<(), HubError> {
		if self.is_closed() {
			return Err(HubError::Closed { username: self.username.clone() });
		}
		self.outbound.try_send(frame).map_err(|error| match error {
			mpsc::error::TrySendError::Full(_) =>
				HubError::Backpressure { username: self.username.clone() },
			mpsc::error::TrySendError::Closed(_) =>
				HubError::Closed { username: self.username.clone() },
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
	pub active_connections: usize,
	pub reconnections: u64,
}

/// Registry of authenticated connections keyed by username. At most one
/// live connection per username; re-registration closes the predecessor.
pub struct ConnectionHub {
	connections: RwLock<HashMap<String, ConnectionHandle>>,
	next_conn_id: AtomicU64,
	reconnections: AtomicU64,
}

impl Default for ConnectionHub {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnectionHub {
	pub fn new() -> Self {
		ConnectionHub {
			connections: RwLock::new(HashMap::new()),
			next_conn_id: AtomicU64::new(0),
			reconnections: AtomicU64::new(0),
		}
	}

	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Build a free-standing handle plus the receiving end of its bounded
	/// outbound queue. The handle only becomes reachable once
	/// [`Self::register`] is called.
	pub fn new_handle(
		&self,
		conn_id: u64,
		username: String,
		role: Role,
	) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
		let (outbound, receiver) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
		let shutdown = Arc::new(watch::channel(false).0);
		(ConnectionHandle::new(conn_id, username, role, outbound, shutdown), receiver)
	}

	pub async fn register(&self, handle: ConnectionHandle) {
		let previous =
			self.connections.write().await.insert(handle.username.clone(), handle.clone());

		if let Some(previous) = previous {
			self.reconnections.fetch_add(1, Ordering::Relaxed);
			info!(username = handle.username, "Re-registration, closing the previous connection");
			previous.close();
		} else {
			debug!(username = handle.username, "Connection registered");
		}
	}

	/// Remove the connection for `username`, but only if it is still the
	/// one identified by `conn_id` (a newer registration must survive the
	/// old reader's teardown).
	pub async fn unregister(&self, username: &str, conn_id: u64) {
		let removed = {
			let mut connections = self.connections.write().await;
			match connections.get(username) {
				Some(current) if current.conn_id == conn_id => connections.remove(username),
				_ => None,
			}
		};
		if let Some(handle) = removed {
			handle.close();
			debug!(username, "Connection unregistered");
		}
	}

	pub async fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
		self.connections.read().await.get(username).cloned()
	}

	/// Non-blocking send. The hub lock is never held across the send
	/// itself.
	pub async fn send(&self, username: &str, frame: Frame) -> Result<(), HubError> {
		match self.lookup(username).await {
			None => Err(HubError::NotConnected { username: username.to_string() }),
			Some(handle) => handle.try_send(frame),
		}
	}

	/// Best-effort fan-out to every connection. Returns the number of
	/// successful enqueues.
	pub async fn broadcast(&self, frame: Frame) -> usize {
		let handles: Vec<_> = self.connections.read().await.values().cloned().collect();
		handles.iter().filter(|handle| handle.try_send(frame.clone()).is_ok()).count()
	}

	pub async fn broadcast_to_role(&self, role: Role, frame: Frame) -> usize {
		let handles: Vec<_> = self
			.connections
			.read()
			.await
			.values()
			.filter(|handle| handle.role == role)
			.cloned()
			.collect();
		handles.iter().filter(|handle| handle.try_send(frame.clone()).is_ok()).count()
	}

	pub async fn connected(&self, username: &str) -> bool {
		self.connections
			.read()
			.await
			.get(username)
			.map(|handle| !handle.is_closed())
			.unwrap_or(false)
	}

	/// Evict entries already marked closed. Returns how many were removed.
	pub async fn sweep(&self) -> usize {
		let mut connections = self.connections.write().await;
		let before = connections.len();
		connections.retain(|_, handle| !handle.is_closed());
		before - connections.len()
	}

	pub async fn close_all(&self) {
		let handles: Vec<_> = {
			let mut connections = self.connections.write().await;
			connections.drain().map(|(_, handle)| handle).collect()
		};
		for handle in handles {
			handle.close();
		}
	}

	pub async fn stats(&self) -> HubStats {
		HubStats {
			active_connections: self.connections.read().await.len(),
			reconnections: self.reconnections.load(Ordering::Relaxed),
		}
	}
}

/// Periodic eviction of connections that closed without unregistering.
pub fn spawn_sweeper(hub: Arc<ConnectionHub>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(HUB_SWEEP_INTERVAL);
		interval.tick().await;
		loop {
			interval.tick().await;
			let swept = hub.sweep().await;
			if swept > 0 {
				debug!("Swept {swept} closed connections");
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_frame() -> Frame {
		Frame::error("test")
	}

	async fn register(
		hub: &ConnectionHub,
		username: &str,
	) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
		let conn_id = hub.next_conn_id();
		let (handle, receiver) = hub.new_handle(conn_id, username.to_string(), Role::Participant);
		hub.register(handle.clone()).await;
		(handle, receiver)
	}

	#[tokio::test]
	async fn delivers_by_username() {
		let hub = ConnectionHub::new();
		let (_handle, mut receiver) = register(&hub, "u1").await;

		hub.send("u1", test_frame()).await.unwrap();
		assert_eq!(receiver.recv().await.unwrap(), test_frame());

		assert_eq!(
			hub.send("u2", test_frame()).await,
			Err(HubError::NotConnected { username: "u2".to_string() })
		);
	}

	#[tokio::test]
	async fn replaces_previous_connection_on_reregistration() {
		let hub = ConnectionHub::new();
		let (first, _first_rx) = register(&hub, "u1").await;
		let (second, mut second_rx) = register(&hub, "u1").await;

		assert!(first.is_closed());
		assert!(!second.is_closed());
		assert_eq!(hub.stats().await.reconnections, 1);

		hub.send("u1", test_frame()).await.unwrap();
		assert_eq!(second_rx.recv().await.unwrap(), test_frame());
	}

	#[tokio::test]
	async fn stale_unregister_does_not_evict_newer_connection() {
		let hub = ConnectionHub::new();
		let (first, _first_rx) = register(&hub, "u1").await;
		let (second, _second_rx) = register(&hub, "u1").await;

		// The old reader tears down after being replaced
		hub.unregister("u1", first.conn_id).await;

		let current = hub.lookup("u1").await.unwrap();
		assert_eq!(current.conn_id, second.conn_id);
		assert!(!current.is_closed());
	}

	#[tokio::test]
	async fn reports_backpressure_when_queue_is_full() {
		let hub = ConnectionHub::new();
		let (_handle, _receiver) = register(&hub, "u1").await;

		for _ in 0..OUTBOUND_QUEUE_SIZE {
			hub.send("u1", test_frame()).await.unwrap();
		}
		assert_eq!(
			hub.send("u1", test_frame()).await,
			Err(HubError::Backpressure { username: "u1".to_string() })
		);
	}

	#[tokio::test]
	async fn sends_to_closed_connections_fail() {
		let hub = ConnectionHub::new();
		let (handle, _receiver) = register(&hub, "u1").await;

		handle.close();
		assert_eq!(
			hub.send("u1", test_frame()).await,
			Err(HubError::Closed { username: "u1".to_string() })
		);
	}

	#[tokio::test]
	async fn close_is_observable_by_late_subscribers() {
		let hub = ConnectionHub::new();
		let (handle, _receiver) = register(&hub, "u1").await;

		handle.close();
		handle.close();

		// A receiver subscribed after the close still sees it
		let mut signal = handle.closed_signal();
		assert!(*signal.borrow_and_update() || signal.changed().await.is_ok());
		assert!(handle.is_closed());
	}

	#[tokio::test]
	async fn sweep_evicts_closed_connections() {
		let hub = ConnectionHub::new();
		let (first, _rx1) = register(&hub, "u1").await;
		let (_second, _rx2) = register(&hub, "u2").await;

		first.close();
		assert_eq!(hub.sweep().await, 1);
		assert!(hub.lookup("u1").await.is_none());
		assert!(hub.lookup("u2").await.is_some());
	}

	#[tokio::test]
	async fn broadcast_to_role_filters() {
		let hub = ConnectionHub::new();
		let (handle, mut admin_rx) =
			hub.new_handle(hub.next_conn_id(), "admin".to_string(), Role::Admin);
		hub.register(handle).await;
		let (_participant, mut participant_rx) = register(&hub, "u1").await;

		assert_eq!(hub.broadcast_to_role(Role::Admin, test_frame()).await, 1);
		assert_eq!(admin_rx.recv().await.unwrap(), test_frame());
		assert!(participant_rx.try_recv().is_err());
	}
}
