use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{
	auth::TokenAuthority,
	ceremony::CeremonyManager,
	db::{Repository, Role},
};

use super::{
	frame::Frame,
	hub::{ConnectionHandle, ConnectionHub},
};

/// Per-connection state owned by the reader task. Holds the authenticated
/// identity once the `register` handshake has succeeded, plus everything
/// needed to mint the hub handle at that moment.
pub struct ConnectionContext {
	pub conn_id: u64,
	pub identity: Option<(String, Role)>,
	outbound: mpsc::Sender<Frame>,
	shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionContext {
	pub fn new(
		conn_id: u64,
		outbound: mpsc::Sender<Frame>,
		shutdown: Arc<watch::Sender<bool>>,
	) -> Self {
		ConnectionContext { conn_id, identity: None, outbound, shutdown }
	}

	/// Direct reply on this connection's own writer queue.
	pub fn reply(&self, frame: Frame) {
		if let Err(error) = self.outbound.try_send(frame) {
			debug!(conn_id = self.conn_id, "Dropping reply frame: {error}");
		}
	}
}

/// Decodes inbound frames, enforces the register-first rule, and routes
/// ceremony frames to the state machines with the sender identity attached.
pub struct Dispatcher {
	pub repository: Arc<dyn Repository>,
	pub hub: Arc<ConnectionHub>,
	pub ceremonies: CeremonyManager,
	pub tokens: Arc<TokenAuthority>,
}

impl Dispatcher {
	pub fn new(
		repository: Arc<dyn Repository>,
		hub: Arc<ConnectionHub>,
		ceremonies: CeremonyManager,
		tokens: Arc<TokenAuthority>,
	) -> Self {
		Dispatcher { repository, hub, ceremonies, tokens }
	}

	pub async fn dispatch(&self, ctx: &mut ConnectionContext, text: &str) {
		let frame = match serde_json::from_str::<Frame>(text) {
			Ok(frame) => frame,
			Err(error) => {
				ctx.reply(Frame::error(format!("malformed frame: {error}")));
				return;
			},
		};
		debug!(conn_id = ctx.conn_id, kind = frame.kind(), "Inbound frame");

		let frame = match frame {
			Frame::Register { username, role, token } => {
				self.handle_register(ctx, username, role, &token).await;
				return;
			},
			other => other,
		};

		let Some((sender, sender_role)) = ctx.identity.clone() else {
			ctx.reply(Frame::error("connection is not registered"));
			return;
		};

		let result = match frame {
			Frame::KeygenRequest { session_key, threshold, total_parts, participants } => {
				if !sender_role.can_initiate() {
					ctx.reply(Frame::error(
						"unauthorized: only coordinators may start ceremonies",
					));
					return;
				}
				self.ceremonies
					.on_keygen_request(&sender, session_key, threshold, total_parts, participants)
					.await
			},
			Frame::KeygenResponse { session_key, part_index, cpic, accept, reason } =>
				self.ceremonies
					.on_keygen_response(&sender, &session_key, part_index, &cpic, accept, reason)
					.await,
			Frame::KeygenResult {
				session_key,
				part_index,
				address,
				cpic,
				encrypted_shard,
				success,
				message,
			} =>
				self.ceremonies
					.on_keygen_result(
						&sender,
						&session_key,
						part_index,
						&address,
						&cpic,
						&encrypted_shard,
						success,
						&message,
					)
					.await,
			Frame::SignRequest { session_key, threshold, total_parts, data, address, participants } => {
				if !sender_role.can_initiate() {
					ctx.reply(Frame::error(
						"unauthorized: only coordinators may start ceremonies",
					));
					return;
				}
				self.ceremonies
					.on_sign_request(
						&sender,
						session_key,
						threshold,
						total_parts,
						data,
						address,
						participants,
					)
					.await
			},
			Frame::SignResponse { session_key, part_index, cpic, accept, reason } =>
				self.ceremonies
					.on_sign_response(&sender, &session_key, part_index, &cpic, accept, reason)
					.await,
			Frame::SignResult { session_key, part_index, success, signature, message } =>
				self.ceremonies
					.on_sign_result(&sender, &session_key, part_index, success, &signature, &message)
					.await,
			// Everything else only ever travels server to client
			other => {
				ctx.reply(Frame::error(format!("unexpected frame type: {}", other.kind())));
				return;
			},
		};

		if let Err(error) = result {
			ctx.reply(Frame::error(error.to_string()));
		}
	}

	/// First frame on any connection. The token must validate and its
	/// claims must match the identity the frame announces.
	async fn handle_register(
		&self,
		ctx: &mut ConnectionContext,
		username: String,
		role: Role,
		token: &str,
	) {
		if ctx.identity.is_some() {
			ctx.reply(Frame::RegisterComplete {
				success: false,
				message: "connection is already registered".to_string(),
			});
			return;
		}

		if let Err(error) = self.tokens.verify_identity(token, &username, role) {
			ctx.reply(Frame::RegisterComplete { success: false, message: error.to_string() });
			return;
		}

		// The account must still exist and still hold the claimed role: a
		// token outlives an admin's role change otherwise.
		match self.repository.user_by_username(&username) {
			Ok(user) if user.role == role => {},
			Ok(_) => {
				ctx.reply(Frame::RegisterComplete {
					success: false,
					message: format!("{username} no longer holds the {role} role"),
				});
				return;
			},
			Err(_) => {
				ctx.reply(Frame::RegisterComplete {
					success: false,
					message: format!("{username} is not a registered user"),
				});
				return;
			},
		}

		let handle = ConnectionHandle::new(
			ctx.conn_id,
			username.clone(),
			role,
			ctx.outbound.clone(),
			ctx.shutdown.clone(),
		);
		self.hub.register(handle).await;
		ctx.identity = Some((username, role));

		ctx.reply(Frame::RegisterComplete { success: true, message: "registered".to_string() });
	}
}
