use thiserror::Error;
use tracing::warn;

// ==== Logging tag constants ====
pub const KEYGEN_CEREMONY_FAILED: &str = "keygen_ceremony_failed";
pub const SIGNING_CEREMONY_FAILED: &str = "signing_ceremony_failed";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeygenFailureReason {
	#[error("participants unreachable: {0}")]
	UnreachableParticipants(String),
	#[error("invite rejected by {username}")]
	InviteRejected { username: String, reason: String },
	#[error("reported CPIC does not match the secure element assigned to {username}")]
	CpicMismatch { username: String },
	#[error("{username} does not own slot {part_index}")]
	WrongSlotOwner { username: String, part_index: u32 },
	#[error("{username} reported failure")]
	ParticipantFailure { username: String, message: String },
	#[error("{username} reported a conflicting account address")]
	AddressMismatch { username: String },
	#[error("duplicate shard reported by {username}")]
	DuplicateShard { username: String },
	#[error("slot {part_index} sent a frame out of sequence")]
	OutOfSequence { part_index: u32 },
	#[error("message delivery to {username} failed")]
	DeliveryFailed { username: String },
	#[error("session timed out")]
	Timeout,
	#[error("server shutting down")]
	Shutdown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningFailureReason {
	#[error("participants unreachable: {0}")]
	UnreachableParticipants(String),
	#[error("invite rejected by {username}")]
	InviteRejected { username: String, reason: String },
	#[error("reported CPIC does not match the secure element assigned to {username}")]
	CpicMismatch { username: String },
	#[error("{username} does not own slot {part_index}")]
	WrongSlotOwner { username: String, part_index: u32 },
	#[error("{username} reported failure")]
	ParticipantFailure { username: String, message: String },
	#[error("no stored shard for {username}")]
	MissingShard { username: String },
	#[error("failed to mint an SE-access capability for {username}")]
	CapabilityFailed { username: String },
	#[error("slot {part_index} sent a frame out of sequence")]
	OutOfSequence { part_index: u32 },
	#[error("message delivery to {username} failed")]
	DeliveryFailed { username: String },
	#[error("session timed out")]
	Timeout,
	#[error("server shutting down")]
	Shutdown,
}

/// What a failure reason exposes to the initiator in the `details` field of
/// the error frame: the participant-supplied payload where one exists.
pub trait CeremonyFailureReason: std::fmt::Display {
	fn details(&self) -> Option<String>;
	fn log(&self, session_key: &str);
}

impl CeremonyFailureReason for KeygenFailureReason {
	fn details(&self) -> Option<String> {
		match self {
			KeygenFailureReason::UnreachableParticipants(list) => Some(list.clone()),
			KeygenFailureReason::InviteRejected { reason, .. } => Some(reason.clone()),
			KeygenFailureReason::ParticipantFailure { message, .. } => Some(message.clone()),
			KeygenFailureReason::CpicMismatch { username } |
			KeygenFailureReason::AddressMismatch { username } |
			KeygenFailureReason::DuplicateShard { username } |
			KeygenFailureReason::DeliveryFailed { username } |
			KeygenFailureReason::WrongSlotOwner { username, .. } => Some(username.clone()),
			KeygenFailureReason::OutOfSequence { .. } |
			KeygenFailureReason::Timeout |
			KeygenFailureReason::Shutdown => None,
		}
	}

	fn log(&self, session_key: &str) {
		warn!(tag = KEYGEN_CEREMONY_FAILED, session_key, "Keygen ceremony failed: {self}");
	}
}

impl CeremonyFailureReason for SigningFailureReason {
	fn details(&self) -> Option<String> {
		match self {
			SigningFailureReason::UnreachableParticipants(list) => Some(list.clone()),
			SigningFailureReason::InviteRejected { reason, .. } => Some(reason.clone()),
			SigningFailureReason::ParticipantFailure { message, .. } => Some(message.clone()),
			SigningFailureReason::CpicMismatch { username } |
			SigningFailureReason::MissingShard { username } |
			SigningFailureReason::CapabilityFailed { username } |
			SigningFailureReason::DeliveryFailed { username } |
			SigningFailureReason::WrongSlotOwner { username, .. } => Some(username.clone()),
			SigningFailureReason::OutOfSequence { .. } |
			SigningFailureReason::Timeout |
			SigningFailureReason::Shutdown => None,
		}
	}

	fn log(&self, session_key: &str) {
		warn!(tag = SIGNING_CEREMONY_FAILED, session_key, "Signing ceremony failed: {self}");
	}
}
