pub mod failure_reason;
mod keygen;
mod signing;

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
	auth::CapabilitySigner,
	constants::SESSION_EVICTION_GRACE,
	db::{KeyGenRecord, Repository, RepositoryError, SessionStatus, SignRecord},
	ws::hub::ConnectionHub,
};

/// Errors reported back to the peer whose frame could not be processed.
/// Session-fatal conditions do not surface here; those fail the session and
/// notify the initiator instead.
#[derive(Error, Debug)]
pub enum CeremonyError {
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("unauthorized: {0}")]
	Unauthorized(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("conflict: {0}")]
	Conflict(String),
	#[error("unavailable: {0}")]
	Unavailable(String),
	#[error("timeout: {0}")]
	Timeout(String),
	#[error("internal error: {0}")]
	Internal(String),
}

impl From<RepositoryError> for CeremonyError {
	fn from(error: RepositoryError) -> Self {
		match error {
			RepositoryError::InvalidParameter(message) => CeremonyError::InvalidInput(message),
			RepositoryError::NotFound => CeremonyError::NotFound("not found".to_string()),
			RepositoryError::AlreadyExists => CeremonyError::Conflict("already exists".to_string()),
			other => CeremonyError::Internal(other.to_string()),
		}
	}
}

/// In-memory cache of live ceremonies. Exclusive owner of every
/// non-terminal session row; the repository only ever sees terminal
/// write-backs. Each session sits behind its own lock so writers on one
/// ceremony never contend with another.
pub struct SessionStore {
	keygen: RwLock<HashMap<String, Arc<RwLock<KeyGenRecord>>>>,
	sign: RwLock<HashMap<String, Arc<RwLock<SignRecord>>>>,
	repository: Arc<dyn Repository>,
}

impl SessionStore {
	pub fn new(repository: Arc<dyn Repository>) -> Arc<Self> {
		Arc::new(SessionStore {
			keygen: RwLock::new(HashMap::new()),
			sign: RwLock::new(HashMap::new()),
			repository,
		})
	}

	/// Admit a new live keygen session. A key already live, or already
	/// persisted from an earlier ceremony, is a conflict and leaves the
	/// existing session untouched.
	pub async fn insert_keygen(
		&self,
		record: KeyGenRecord,
	) -> Result<Arc<RwLock<KeyGenRecord>>, CeremonyError> {
		let session_key = record.session_key.clone();
		let mut sessions = self.keygen.write().await;
		if sessions.contains_key(&session_key) || self.repository.keygen(&session_key).is_ok() {
			return Err(CeremonyError::Conflict(format!(
				"session key {session_key} is already in use"
			)));
		}
		let session = Arc::new(RwLock::new(record));
		sessions.insert(session_key, session.clone());
		Ok(session)
	}

	pub async fn insert_sign(
		&self,
		record: SignRecord,
	) -> Result<Arc<RwLock<SignRecord>>, CeremonyError> {
		let session_key = record.session_key.clone();
		let mut sessions = self.sign.write().await;
		if sessions.contains_key(&session_key) || self.repository.sign_session(&session_key).is_ok()
		{
			return Err(CeremonyError::Conflict(format!(
				"session key {session_key} is already in use"
			)));
		}
		let session = Arc::new(RwLock::new(record));
		sessions.insert(session_key, session.clone());
		Ok(session)
	}

	pub async fn live_keygen(&self, session_key: &str) -> Option<Arc<RwLock<KeyGenRecord>>> {
		self.keygen.read().await.get(session_key).cloned()
	}

	pub async fn live_sign(&self, session_key: &str) -> Option<Arc<RwLock<SignRecord>>> {
		self.sign.read().await.get(session_key).cloned()
	}

	pub fn persisted_keygen(&self, session_key: &str) -> Result<KeyGenRecord, RepositoryError> {
		self.repository.keygen(session_key)
	}

	pub fn persisted_sign(&self, session_key: &str) -> Result<SignRecord, RepositoryError> {
		self.repository.sign_session(session_key)
	}

	/// Persist a terminal keygen session and schedule its eviction from the
	/// live map once the grace period has passed.
	pub async fn write_back_keygen(
		self: Arc<Self>,
		session_key: &str,
	) -> Result<(), RepositoryError> {
		let Some(session) = self.live_keygen(session_key).await else {
			return Err(RepositoryError::NotFound);
		};
		let record = session.read().await.clone();
		debug_assert!(record.status.is_terminal());
		self.repository.upsert_keygen(&record)?;

		let store = self.clone();
		let session_key = session_key.to_string();
		tokio::spawn(async move {
			tokio::time::sleep(SESSION_EVICTION_GRACE).await;
			store.keygen.write().await.remove(&session_key);
			debug!(session_key, "Evicted terminal keygen session");
		});
		Ok(())
	}

	pub async fn write_back_sign(
		self: Arc<Self>,
		session_key: &str,
	) -> Result<(), RepositoryError> {
		let Some(session) = self.live_sign(session_key).await else {
			return Err(RepositoryError::NotFound);
		};
		let record = session.read().await.clone();
		debug_assert!(record.status.is_terminal());
		self.repository.upsert_sign(&record)?;

		let store = self.clone();
		let session_key = session_key.to_string();
		tokio::spawn(async move {
			tokio::time::sleep(SESSION_EVICTION_GRACE).await;
			store.sign.write().await.remove(&session_key);
			debug!(session_key, "Evicted terminal sign session");
		});
		Ok(())
	}

	/// Shutdown path: every live non-terminal session becomes `Failed` and
	/// is persisted immediately. Returns the keys that were failed.
	pub async fn fail_all_live(&self) -> Vec<String> {
		let mut failed = Vec::new();

		for session in self.keygen.read().await.values() {
			let mut record = session.write().await;
			if !record.status.is_terminal() {
				record.status = SessionStatus::Failed;
				if let Err(error) = self.repository.upsert_keygen(&record) {
					warn!(
						session_key = record.session_key,
						"Failed to persist keygen session at shutdown: {error}"
					);
				}
				failed.push(record.session_key.clone());
			}
		}
		for session in self.sign.read().await.values() {
			let mut record = session.write().await;
			if !record.status.is_terminal() {
				record.status = SessionStatus::Failed;
				if let Err(error) = self.repository.upsert_sign(&record) {
					warn!(
						session_key = record.session_key,
						"Failed to persist sign session at shutdown: {error}"
					);
				}
				failed.push(record.session_key.clone());
			}
		}

		failed
	}
}

/// Drives both ceremony state machines. Handlers run synchronously inside
/// the calling reader task and only ever enqueue frames into other
/// connections' writer queues.
#[derive(Clone)]
pub struct CeremonyManager {
	pub(crate) repository: Arc<dyn Repository>,
	pub(crate) store: Arc<SessionStore>,
	pub(crate) hub: Arc<ConnectionHub>,
	pub(crate) signer: Arc<CapabilitySigner>,
}

impl CeremonyManager {
	pub fn new(
		repository: Arc<dyn Repository>,
		store: Arc<SessionStore>,
		hub: Arc<ConnectionHub>,
		signer: Arc<CapabilitySigner>,
	) -> Self {
		CeremonyManager { repository, store, hub, signer }
	}

	/// Shared request validation: threshold and slot-array shape.
	pub(crate) fn validate_shape(
		threshold: u32,
		total_parts: u32,
		participants: &[String],
	) -> Result<(), CeremonyError> {
		if threshold == 0 || total_parts == 0 {
			return Err(CeremonyError::InvalidInput(
				"threshold and total parts must be positive".to_string(),
			));
		}
		if threshold > total_parts {
			return Err(CeremonyError::InvalidInput(format!(
				"threshold {threshold} exceeds total parts {total_parts}"
			)));
		}
		if participants.is_empty() {
			return Err(CeremonyError::InvalidInput("no participants given".to_string()));
		}
		if participants.len() != total_parts as usize {
			return Err(CeremonyError::InvalidInput(format!(
				"expected {total_parts} participants, got {}",
				participants.len()
			)));
		}
		let mut deduped = participants.to_vec();
		deduped.sort();
		deduped.dedup();
		if deduped.len() != participants.len() {
			return Err(CeremonyError::InvalidInput("participants must be distinct".to_string()));
		}
		Ok(())
	}

	/// Every ceremony participant must be a registered, eligible user.
	pub(crate) fn ensure_eligible(&self, participants: &[String]) -> Result<(), CeremonyError> {
		for username in participants {
			let user = self.repository.user_by_username(username).map_err(|error| match error {
				RepositoryError::NotFound =>
					CeremonyError::InvalidInput(format!("{username} is not a registered user")),
				other => CeremonyError::Internal(other.to_string()),
			})?;
			if !user.role.can_participate() {
				return Err(CeremonyError::InvalidInput(format!(
					"{username} is not eligible to hold a ceremony slot"
				)));
			}
		}
		Ok(())
	}

	/// Shutdown path delegated by the server.
	pub async fn shutdown(&self) {
		let failed = self.store.fail_all_live().await;
		if !failed.is_empty() {
			warn!("Marked {} live sessions as failed during shutdown", failed.len());
		}
	}
}
