use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::{
	constants::SIGN_SESSION_TIMEOUT,
	db::{RepositoryError, SessionStatus, SignRecord, SlotState},
	ws::frame::{params_filename, Frame},
};

use super::{
	failure_reason::{CeremonyFailureReason, SigningFailureReason},
	CeremonyError, CeremonyManager,
};

/// The slot whose partial signature is recorded as the session's final
/// signature. All slots must still complete before the session does.
const COMBINER_SLOT: u32 = 1;

enum Next {
	Nothing,
	Fail(SigningFailureReason),
	FanOutParams(Vec<(String, Frame)>),
	Complete { initiator: String, signature: String },
}

impl CeremonyManager {
	/// Create the sign session and broadcast invites. The participant set
	/// must be a subset of the completed keygen ceremony for the same
	/// account, with at least threshold members.
	pub async fn on_sign_request(
		&self,
		initiator: &str,
		session_key: String,
		threshold: u32,
		total_parts: u32,
		data: String,
		address: String,
		participants: Vec<String>,
	) -> Result<(), CeremonyError> {
		Self::validate_shape(threshold, total_parts, &participants)?;
		if data.is_empty() {
			return Err(CeremonyError::InvalidInput("no data to sign".to_string()));
		}
		if address.is_empty() {
			return Err(CeremonyError::InvalidInput("no account address given".to_string()));
		}
		self.ensure_eligible(&participants)?;

		let keygen = self.repository.keygen_by_address(&address).map_err(|error| match error {
			RepositoryError::NotFound => CeremonyError::NotFound(format!(
				"no key generation ceremony is known for {address}"
			)),
			other => CeremonyError::Internal(other.to_string()),
		})?;
		if keygen.status != SessionStatus::Completed {
			return Err(CeremonyError::Unavailable(format!(
				"key generation for {address} is {}",
				keygen.status
			)));
		}
		if let Some(outsider) =
			participants.iter().find(|username| !keygen.participants.contains(username))
		{
			return Err(CeremonyError::InvalidInput(format!(
				"{outsider} did not take part in key generation for {address}"
			)));
		}
		if participants.len() < keygen.threshold as usize {
			return Err(CeremonyError::InvalidInput(format!(
				"{} signers given but the key requires at least {}",
				participants.len(),
				keygen.threshold
			)));
		}

		// Chips are freshly drawn; signers may present different physical
		// devices than they used during key generation.
		let chips = self.repository.random_se_ids(total_parts as usize).map_err(|error| {
			match error {
				RepositoryError::NotFound =>
					CeremonyError::Unavailable("the SE registry is empty".to_string()),
				other => CeremonyError::Internal(other.to_string()),
			}
		})?;

		let record = SignRecord {
			session_key: session_key.clone(),
			initiator: initiator.to_string(),
			data: data.clone(),
			account_address: address.clone(),
			threshold,
			total_parts,
			participants: participants.clone(),
			responses: vec![SlotState::Init; total_parts as usize],
			chips: chips.clone(),
			signature: None,
			status: SessionStatus::Created,
		};
		let session = self.store.insert_sign(record).await?;
		info!(session_key, initiator, address, "Sign session created");

		session.write().await.status = SessionStatus::Invited;

		let mut unreachable = Vec::new();
		for (slot, username) in participants.iter().enumerate() {
			let invite = Frame::SignInvite {
				session_key: session_key.clone(),
				data: data.clone(),
				address: address.clone(),
				part_index: slot as u32 + 1,
				se_id: chips[slot].clone(),
				participants: participants.clone(),
			};
			if let Err(error) = self.hub.send(username, invite).await {
				debug!(session_key, username, "Undeliverable sign invite: {error}");
				unreachable.push(username.clone());
			}
		}

		if !unreachable.is_empty() {
			self.fail_sign(
				&session_key,
				SigningFailureReason::UnreachableParticipants(unreachable.join(",")),
				false,
			)
			.await;
			return Ok(());
		}

		self.spawn_sign_watchdog(session_key);
		Ok(())
	}

	pub async fn on_sign_response(
		&self,
		sender: &str,
		session_key: &str,
		part_index: u32,
		cpic: &str,
		accept: bool,
		reason: Option<String>,
	) -> Result<(), CeremonyError> {
		let session = self.live_sign_or_err(session_key).await?;

		let next = {
			let mut record = session.write().await;
			if record.status.is_terminal() {
				return Err(CeremonyError::Conflict(format!(
					"session {session_key} is already {}",
					record.status
				)));
			}

			let slot = Self::sign_slot(&record, part_index)?;
			if record.participants[slot] != sender {
				Next::Fail(SigningFailureReason::WrongSlotOwner {
					username: sender.to_string(),
					part_index,
				})
			} else if record.status != SessionStatus::Invited ||
				record.responses[slot] != SlotState::Init
			{
				record.responses[slot] = SlotState::Failed;
				Next::Fail(SigningFailureReason::OutOfSequence { part_index })
			} else if !self.cpic_matches(&record.chips[slot], cpic) {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(SigningFailureReason::CpicMismatch { username: sender.to_string() })
			} else if !accept {
				record.responses[slot] = SlotState::Rejected;
				Next::Fail(SigningFailureReason::InviteRejected {
					username: sender.to_string(),
					reason: reason.unwrap_or_default(),
				})
			} else {
				record.responses[slot] = SlotState::Accepted;
				debug!(session_key, sender, part_index, "Sign invite accepted");

				if record.responses.iter().all(|state| *state == SlotState::Accepted) {
					match self.sign_params(&record) {
						Ok(frames) => {
							record.status = SessionStatus::Processing;
							Next::FanOutParams(frames)
						},
						Err(reason) => Next::Fail(reason),
					}
				} else {
					Next::Nothing
				}
			}
		};

		self.advance_sign(session_key, next).await
	}

	/// Build the params frame for every slot: the stored shard ciphertext,
	/// the slot-ordered parties list, and the SE-access capability that
	/// authorizes this signer to use this account.
	fn sign_params(&self, record: &SignRecord) -> Result<Vec<(String, Frame)>, SigningFailureReason> {
		let parties = (1..=record.total_parts).map(|index| index.to_string()).join(",");

		record
			.participants
			.iter()
			.enumerate()
			.map(|(slot, username)| {
				let shard = self
					.repository
					.shard(username, &record.account_address)
					.map_err(|_| SigningFailureReason::MissingShard {
						username: username.clone(),
					})?;
				let signature = self
					.signer
					.authorize(username, &record.account_address)
					.map_err(|_| SigningFailureReason::CapabilityFailed {
						username: username.clone(),
					})?;

				Ok((
					username.clone(),
					Frame::SignParams {
						session_key: record.session_key.clone(),
						data: record.data.clone(),
						address: record.account_address.clone(),
						signature,
						parties: parties.clone(),
						part_index: slot as u32 + 1,
						filename: params_filename(&record.session_key, slot as u32 + 1),
						encrypted_shard: shard.ciphertext,
					},
				))
			})
			.collect()
	}

	pub async fn on_sign_result(
		&self,
		sender: &str,
		session_key: &str,
		part_index: u32,
		success: bool,
		signature: &str,
		message: &str,
	) -> Result<(), CeremonyError> {
		let session = self.live_sign_or_err(session_key).await?;

		let next = {
			let mut record = session.write().await;
			if record.status.is_terminal() {
				return Err(CeremonyError::Conflict(format!(
					"session {session_key} is already {}",
					record.status
				)));
			}

			let slot = Self::sign_slot(&record, part_index)?;
			if record.responses[slot] == SlotState::Completed {
				return Err(CeremonyError::Conflict(format!(
					"slot {part_index} has already completed"
				)));
			}

			if record.participants[slot] != sender {
				Next::Fail(SigningFailureReason::WrongSlotOwner {
					username: sender.to_string(),
					part_index,
				})
			} else if record.status != SessionStatus::Processing ||
				record.responses[slot] != SlotState::Accepted
			{
				record.responses[slot] = SlotState::Failed;
				Next::Fail(SigningFailureReason::OutOfSequence { part_index })
			} else if !success {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(SigningFailureReason::ParticipantFailure {
					username: sender.to_string(),
					message: message.to_string(),
				})
			} else if signature.is_empty() {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(SigningFailureReason::ParticipantFailure {
					username: sender.to_string(),
					message: "result is missing the partial signature".to_string(),
				})
			} else {
				if part_index == COMBINER_SLOT {
					record.signature = Some(signature.to_string());
				}
				record.responses[slot] = SlotState::Completed;
				debug!(session_key, sender, part_index, "Sign slot completed");

				if record.responses.iter().all(|state| *state == SlotState::Completed) {
					record.status = SessionStatus::Completed;
					Next::Complete {
						initiator: record.initiator.clone(),
						signature: record
							.signature
							.clone()
							.expect("combiner slot completed with a signature"),
					}
				} else {
					Next::Nothing
				}
			}
		};

		self.advance_sign(session_key, next).await
	}

	async fn advance_sign(&self, session_key: &str, next: Next) -> Result<(), CeremonyError> {
		match next {
			Next::Nothing => Ok(()),
			Next::Fail(reason) => {
				self.fail_sign(session_key, reason, false).await;
				Ok(())
			},
			Next::FanOutParams(frames) => {
				for (username, frame) in frames {
					if let Err(error) = self.hub.send(&username, frame).await {
						debug!(session_key, username, "Undeliverable sign params: {error}");
						self.fail_sign(
							session_key,
							SigningFailureReason::DeliveryFailed { username },
							false,
						)
						.await;
						return Ok(());
					}
				}
				Ok(())
			},
			Next::Complete { initiator, signature } => {
				info!(session_key, "Sign session completed");
				if let Err(error) = self.store.clone().write_back_sign(session_key).await {
					warn!(session_key, "Failed to persist completed sign session: {error}");
				}
				let complete = Frame::SignComplete {
					session_key: session_key.to_string(),
					signature,
					success: true,
					message: String::new(),
				};
				if let Err(error) = self.hub.send(&initiator, complete).await {
					debug!(session_key, initiator, "Undeliverable sign_complete: {error}");
				}
				Ok(())
			},
		}
	}

	pub(crate) async fn fail_sign(
		&self,
		session_key: &str,
		reason: SigningFailureReason,
		notify_participants: bool,
	) {
		let Some(session) = self.store.live_sign(session_key).await else {
			return;
		};

		let (initiator, participants) = {
			let mut record = session.write().await;
			if record.status.is_terminal() {
				return;
			}
			record.status = SessionStatus::Failed;
			(record.initiator.clone(), record.participants.clone())
		};

		reason.log(session_key);
		if let Err(error) = self.store.clone().write_back_sign(session_key).await {
			warn!(session_key, "Failed to persist failed sign session: {error}");
		}

		let frame = Frame::Error {
			message: format!("sign session {session_key} failed: {reason}"),
			details: reason.details(),
		};
		if let Err(error) = self.hub.send(&initiator, frame.clone()).await {
			debug!(session_key, initiator, "Could not notify initiator: {error}");
		}
		if notify_participants {
			for username in participants {
				if username != initiator {
					let _ = self.hub.send(&username, frame.clone()).await;
				}
			}
		}
	}

	fn spawn_sign_watchdog(&self, session_key: String) {
		let manager = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(SIGN_SESSION_TIMEOUT).await;
			manager.fail_sign(&session_key, SigningFailureReason::Timeout, true).await;
		});
	}

	async fn live_sign_or_err(
		&self,
		session_key: &str,
	) -> Result<std::sync::Arc<tokio::sync::RwLock<SignRecord>>, CeremonyError> {
		if let Some(session) = self.store.live_sign(session_key).await {
			return Ok(session);
		}
		match self.store.persisted_sign(session_key) {
			Ok(record) => Err(CeremonyError::Conflict(format!(
				"session {session_key} is already {}",
				record.status
			))),
			Err(RepositoryError::NotFound) =>
				Err(CeremonyError::NotFound(format!("unknown session {session_key}"))),
			Err(error) => Err(CeremonyError::Internal(error.to_string())),
		}
	}

	fn sign_slot(record: &SignRecord, part_index: u32) -> Result<usize, CeremonyError> {
		if part_index == 0 || part_index as usize > record.participants.len() {
			return Err(CeremonyError::InvalidInput(format!(
				"part index {part_index} is out of range"
			)));
		}
		Ok(part_index as usize - 1)
	}
}
