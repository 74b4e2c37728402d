pub mod sqlite;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteRepository;

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RepositoryError {
	#[error("invalid parameter: {0}")]
	InvalidParameter(String),
	#[error("repository is not initialized")]
	NotInitialized,
	#[error("not found")]
	NotFound,
	#[error("already exists")]
	AlreadyExists,
	#[error("operation failed: {0}")]
	OperationFailed(String),
}

impl From<rusqlite::Error> for RepositoryError {
	fn from(error: rusqlite::Error) -> Self {
		match error {
			rusqlite::Error::QueryReturnedNoRows => RepositoryError::NotFound,
			rusqlite::Error::SqliteFailure(e, _)
				if e.code == rusqlite::ErrorCode::ConstraintViolation =>
				RepositoryError::AlreadyExists,
			other => RepositoryError::OperationFailed(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Admin,
	Coordinator,
	Participant,
	Guest,
}

impl std::fmt::Display for Role {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let name = match self {
			Role::Admin => "admin",
			Role::Coordinator => "coordinator",
			Role::Participant => "participant",
			Role::Guest => "guest",
		};
		write!(f, "{name}")
	}
}

impl std::str::FromStr for Role {
	type Err = RepositoryError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"admin" => Ok(Role::Admin),
			"coordinator" => Ok(Role::Coordinator),
			"participant" => Ok(Role::Participant),
			"guest" => Ok(Role::Guest),
			other => Err(RepositoryError::InvalidParameter(format!("unknown role: {other}"))),
		}
	}
}

impl Role {
	/// A ceremony initiator must hold one of these roles.
	pub fn can_initiate(self) -> bool {
		matches!(self, Role::Admin | Role::Coordinator)
	}

	/// Guests are not eligible to hold ceremony slots.
	pub fn can_participate(self) -> bool {
		!matches!(self, Role::Guest)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub username: String,
	pub password_hash: String,
	pub email: String,
	pub role: Role,
}

/// One row of the registry mapping the human-readable sticker id on the
/// outside of a device to the identifier the device itself reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureElement {
	pub se_id: String,
	pub cpic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShard {
	pub username: String,
	pub account_address: String,
	pub shard_index: u32,
	pub cpic: String,
	pub ciphertext: String,
}

/// Per-slot participant state within a ceremony.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
	Init,
	Accepted,
	Rejected,
	Completed,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
	Created,
	Invited,
	Processing,
	Completed,
	Failed,
}

impl SessionStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, SessionStatus::Completed | SessionStatus::Failed)
	}
}

impl std::fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let name = match self {
			SessionStatus::Created => "created",
			SessionStatus::Invited => "invited",
			SessionStatus::Processing => "processing",
			SessionStatus::Completed => "completed",
			SessionStatus::Failed => "failed",
		};
		write!(f, "{name}")
	}
}

impl std::str::FromStr for SessionStatus {
	type Err = RepositoryError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"created" => Ok(SessionStatus::Created),
			"invited" => Ok(SessionStatus::Invited),
			"processing" => Ok(SessionStatus::Processing),
			"completed" => Ok(SessionStatus::Completed),
			"failed" => Ok(SessionStatus::Failed),
			other => Err(RepositoryError::InvalidParameter(format!("unknown status: {other}"))),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenRecord {
	pub session_key: String,
	pub initiator: String,
	pub threshold: u32,
	pub total_parts: u32,
	pub participants: Vec<String>,
	pub responses: Vec<SlotState>,
	pub chips: Vec<String>,
	pub account_address: Option<String>,
	pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRecord {
	pub session_key: String,
	pub initiator: String,
	pub data: String,
	pub account_address: String,
	pub threshold: u32,
	pub total_parts: u32,
	pub participants: Vec<String>,
	pub responses: Vec<SlotState>,
	pub chips: Vec<String>,
	pub signature: Option<String>,
	pub status: SessionStatus,
}

/// Typed persistence surface the coordinator depends on. One concrete
/// implementation exists over SQLite; tests may substitute their own.
pub trait Repository: Send + Sync {
	// Users
	fn create_user(&self, user: &User) -> Result<()>;
	fn user_by_credentials(&self, username: &str, password_hash: &str) -> Result<User>;
	fn user_by_username(&self, username: &str) -> Result<User>;
	fn list_users(&self) -> Result<Vec<User>>;
	fn update_role(&self, username: &str, role: Role) -> Result<()>;

	// Secure element registry
	fn create_se(&self, se: &SecureElement) -> Result<()>;
	fn se_by_id(&self, se_id: &str) -> Result<SecureElement>;
	fn se_by_cpic(&self, cpic: &str) -> Result<SecureElement>;
	fn list_se(&self) -> Result<Vec<SecureElement>>;
	/// Draw `k` SE ids pseudo-randomly. When the registry holds fewer than
	/// `k` distinct ids the extras cycle through the available set.
	fn random_se_ids(&self, k: usize) -> Result<Vec<String>>;

	// Encrypted shards
	fn save_shard(&self, shard: &EncryptedShard) -> Result<()>;
	fn shard(&self, username: &str, account_address: &str) -> Result<EncryptedShard>;

	// Keygen sessions
	fn upsert_keygen(&self, record: &KeyGenRecord) -> Result<()>;
	fn keygen(&self, session_key: &str) -> Result<KeyGenRecord>;
	fn keygen_by_address(&self, account_address: &str) -> Result<KeyGenRecord>;
	fn delete_keygen(&self, session_key: &str) -> Result<()>;

	// Sign sessions
	fn upsert_sign(&self, record: &SignRecord) -> Result<()>;
	fn sign_session(&self, session_key: &str) -> Result<SignRecord>;
	fn delete_sign(&self, session_key: &str) -> Result<()>;
}
