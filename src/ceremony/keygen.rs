use tracing::{debug, info, warn};

use crate::{
	constants::KEYGEN_SESSION_TIMEOUT,
	db::{KeyGenRecord, RepositoryError, SessionStatus, SlotState},
	ws::frame::{params_filename, Frame},
};

use super::{
	failure_reason::{CeremonyFailureReason, KeygenFailureReason},
	CeremonyError, CeremonyManager,
};

/// Action decided under the session lock, executed after it is released.
enum Next {
	Nothing,
	Fail(KeygenFailureReason),
	FanOutParams(Vec<(String, Frame)>),
	Complete { initiator: String, address: String },
}

impl CeremonyManager {
	/// Transition 1 + 2: create the session, allocate chips, broadcast the
	/// invites. The sender of the request becomes the initiator.
	pub async fn on_keygen_request(
		&self,
		initiator: &str,
		session_key: String,
		threshold: u32,
		total_parts: u32,
		participants: Vec<String>,
	) -> Result<(), CeremonyError> {
		Self::validate_shape(threshold, total_parts, &participants)?;
		self.ensure_eligible(&participants)?;

		let chips = self.repository.random_se_ids(total_parts as usize).map_err(|error| {
			match error {
				RepositoryError::NotFound =>
					CeremonyError::Unavailable("the SE registry is empty".to_string()),
				other => CeremonyError::Internal(other.to_string()),
			}
		})?;

		let record = KeyGenRecord {
			session_key: session_key.clone(),
			initiator: initiator.to_string(),
			threshold,
			total_parts,
			participants: participants.clone(),
			responses: vec![SlotState::Init; total_parts as usize],
			chips: chips.clone(),
			account_address: None,
			status: SessionStatus::Created,
		};
		let session = self.store.insert_keygen(record).await?;
		info!(session_key, initiator, threshold, total_parts, "Keygen session created");

		// Mark invited before the first send so that an early response
		// cannot observe the session mid-broadcast.
		session.write().await.status = SessionStatus::Invited;

		let mut unreachable = Vec::new();
		for (slot, username) in participants.iter().enumerate() {
			let invite = Frame::KeygenInvite {
				session_key: session_key.clone(),
				coordinator: initiator.to_string(),
				threshold,
				total_parts,
				part_index: slot as u32 + 1,
				se_id: chips[slot].clone(),
				participants: participants.clone(),
			};
			if let Err(error) = self.hub.send(username, invite).await {
				debug!(session_key, username, "Undeliverable keygen invite: {error}");
				unreachable.push(username.clone());
			}
		}

		if !unreachable.is_empty() {
			self.fail_keygen(
				&session_key,
				KeygenFailureReason::UnreachableParticipants(unreachable.join(",")),
				false,
			)
			.await;
			return Ok(());
		}

		self.spawn_keygen_watchdog(session_key);
		Ok(())
	}

	/// Transition 3 + 4: ingest a participant's accept/reject and, once the
	/// last slot accepts, fan out the params frames.
	pub async fn on_keygen_response(
		&self,
		sender: &str,
		session_key: &str,
		part_index: u32,
		cpic: &str,
		accept: bool,
		reason: Option<String>,
	) -> Result<(), CeremonyError> {
		let session = self.live_keygen_or_err(session_key).await?;

		let next = {
			let mut record = session.write().await;
			if record.status.is_terminal() {
				return Err(CeremonyError::Conflict(format!(
					"session {session_key} is already {}",
					record.status
				)));
			}

			let slot = Self::keygen_slot(&record, part_index)?;
			if record.participants[slot] != sender {
				Next::Fail(KeygenFailureReason::WrongSlotOwner {
					username: sender.to_string(),
					part_index,
				})
			} else if record.status != SessionStatus::Invited ||
				record.responses[slot] != SlotState::Init
			{
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::OutOfSequence { part_index })
			} else if !self.cpic_matches(&record.chips[slot], cpic) {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::CpicMismatch { username: sender.to_string() })
			} else if !accept {
				record.responses[slot] = SlotState::Rejected;
				Next::Fail(KeygenFailureReason::InviteRejected {
					username: sender.to_string(),
					reason: reason.unwrap_or_default(),
				})
			} else {
				record.responses[slot] = SlotState::Accepted;
				debug!(session_key, sender, part_index, "Keygen invite accepted");

				if record.responses.iter().all(|state| *state == SlotState::Accepted) {
					record.status = SessionStatus::Processing;
					let frames = record
						.participants
						.iter()
						.enumerate()
						.map(|(slot, username)| {
							(
								username.clone(),
								Frame::KeygenParams {
									session_key: session_key.to_string(),
									threshold: record.threshold,
									total_parts: record.total_parts,
									part_index: slot as u32 + 1,
									filename: params_filename(session_key, slot as u32 + 1),
								},
							)
						})
						.collect();
					Next::FanOutParams(frames)
				} else {
					Next::Nothing
				}
			}
		};

		self.advance_keygen(session_key, next).await
	}

	/// Transition 5 + 6: ingest a slot's result, persist its shard and
	/// complete the session once the last slot reports.
	pub async fn on_keygen_result(
		&self,
		sender: &str,
		session_key: &str,
		part_index: u32,
		address: &str,
		cpic: &str,
		encrypted_shard: &str,
		success: bool,
		message: &str,
	) -> Result<(), CeremonyError> {
		let session = self.live_keygen_or_err(session_key).await?;

		let next = {
			let mut record = session.write().await;
			if record.status.is_terminal() {
				return Err(CeremonyError::Conflict(format!(
					"session {session_key} is already {}",
					record.status
				)));
			}

			let slot = Self::keygen_slot(&record, part_index)?;
			if record.responses[slot] == SlotState::Completed {
				// Idempotence boundary: the duplicate is rejected without
				// touching session state.
				return Err(CeremonyError::Conflict(format!(
					"slot {part_index} has already completed"
				)));
			}

			if record.participants[slot] != sender {
				Next::Fail(KeygenFailureReason::WrongSlotOwner {
					username: sender.to_string(),
					part_index,
				})
			} else if record.status != SessionStatus::Processing ||
				record.responses[slot] != SlotState::Accepted
			{
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::OutOfSequence { part_index })
			} else if !self.cpic_matches(&record.chips[slot], cpic) {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::CpicMismatch { username: sender.to_string() })
			} else if !success {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::ParticipantFailure {
					username: sender.to_string(),
					message: message.to_string(),
				})
			} else if address.is_empty() || encrypted_shard.is_empty() {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::ParticipantFailure {
					username: sender.to_string(),
					message: "result is missing the account address or shard".to_string(),
				})
			} else if record.account_address.as_deref().is_some_and(|known| known != address) {
				record.responses[slot] = SlotState::Failed;
				Next::Fail(KeygenFailureReason::AddressMismatch { username: sender.to_string() })
			} else {
				match self.repository.save_shard(&crate::db::EncryptedShard {
					username: sender.to_string(),
					account_address: address.to_string(),
					shard_index: part_index,
					cpic: cpic.to_string(),
					ciphertext: encrypted_shard.to_string(),
				}) {
					Ok(()) => {
						// First successful writer fixes the account address
						record.account_address.get_or_insert_with(|| address.to_string());
						record.responses[slot] = SlotState::Completed;
						debug!(session_key, sender, part_index, "Keygen slot completed");

						if record.responses.iter().all(|state| *state == SlotState::Completed) {
							record.status = SessionStatus::Completed;
							Next::Complete {
								initiator: record.initiator.clone(),
								address: address.to_string(),
							}
						} else {
							Next::Nothing
						}
					},
					Err(RepositoryError::AlreadyExists) => {
						record.responses[slot] = SlotState::Failed;
						Next::Fail(KeygenFailureReason::DuplicateShard {
							username: sender.to_string(),
						})
					},
					// A storage fault is reported to the sender and leaves
					// the slot intact so the result can be retried.
					Err(error) => return Err(CeremonyError::Internal(error.to_string())),
				}
			}
		};

		self.advance_keygen(session_key, next).await
	}

	async fn advance_keygen(&self, session_key: &str, next: Next) -> Result<(), CeremonyError> {
		match next {
			Next::Nothing => Ok(()),
			Next::Fail(reason) => {
				self.fail_keygen(session_key, reason, false).await;
				Ok(())
			},
			Next::FanOutParams(frames) => {
				for (username, frame) in frames {
					if let Err(error) = self.hub.send(&username, frame).await {
						debug!(session_key, username, "Undeliverable keygen params: {error}");
						self.fail_keygen(
							session_key,
							KeygenFailureReason::DeliveryFailed { username },
							false,
						)
						.await;
						return Ok(());
					}
				}
				Ok(())
			},
			Next::Complete { initiator, address } => {
				info!(session_key, address, "Keygen session completed");
				if let Err(error) = self.store.clone().write_back_keygen(session_key).await {
					warn!(session_key, "Failed to persist completed keygen session: {error}");
				}
				let complete = Frame::KeygenComplete {
					session_key: session_key.to_string(),
					address,
					success: true,
					message: String::new(),
				};
				if let Err(error) = self.hub.send(&initiator, complete).await {
					debug!(session_key, initiator, "Undeliverable keygen_complete: {error}");
				}
				Ok(())
			},
		}
	}

	/// Fail a live session: mark it, persist it, tell the initiator (and
	/// on timeout every still-connected participant as well).
	pub(crate) async fn fail_keygen(
		&self,
		session_key: &str,
		reason: KeygenFailureReason,
		notify_participants: bool,
	) {
		let Some(session) = self.store.live_keygen(session_key).await else {
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
		if let Err(error) = self.store.clone().write_back_keygen(session_key).await {
			warn!(session_key, "Failed to persist failed keygen session: {error}");
		}

		let frame = Frame::Error {
			message: format!("keygen session {session_key} failed: {reason}"),
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

	fn spawn_keygen_watchdog(&self, session_key: String) {
		let manager = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(KEYGEN_SESSION_TIMEOUT).await;
			manager.fail_keygen(&session_key, KeygenFailureReason::Timeout, true).await;
		});
	}

	async fn live_keygen_or_err(
		&self,
		session_key: &str,
	) -> Result<std::sync::Arc<tokio::sync::RwLock<KeyGenRecord>>, CeremonyError> {
		if let Some(session) = self.store.live_keygen(session_key).await {
			return Ok(session);
		}
		match self.store.persisted_keygen(session_key) {
			Ok(record) => Err(CeremonyError::Conflict(format!(
				"session {session_key} is already {}",
				record.status
			))),
			Err(RepositoryError::NotFound) =>
				Err(CeremonyError::NotFound(format!("unknown session {session_key}"))),
			Err(error) => Err(CeremonyError::Internal(error.to_string())),
		}
	}

	fn keygen_slot(record: &KeyGenRecord, part_index: u32) -> Result<usize, CeremonyError> {
		if part_index == 0 || part_index as usize > record.participants.len() {
			return Err(CeremonyError::InvalidInput(format!(
				"part index {part_index} is out of range"
			)));
		}
		Ok(part_index as usize - 1)
	}

	/// Proof-of-possession: the CPIC the participant reports must match the
	/// registered CPIC of the SE allocated to its slot.
	pub(crate) fn cpic_matches(&self, se_id: &str, reported_cpic: &str) -> bool {
		match self.repository.se_by_id(se_id) {
			Ok(se) => se.cpic == reported_cpic,
			Err(_) => false,
		}
	}
}
