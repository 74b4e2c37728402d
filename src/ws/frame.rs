use serde::{Deserialize, Serialize};

use crate::db::Role;

/// Every message on the wire is exactly one of these frames, serialized as
/// a single JSON object per websocket text message. The `type` tag uses the
/// variant name in snake case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
	Register {
		username: String,
		role: Role,
		token: String,
	},
	RegisterComplete {
		success: bool,
		message: String,
	},
	KeygenRequest {
		session_key: String,
		threshold: u32,
		total_parts: u32,
		participants: Vec<String>,
	},
	KeygenInvite {
		session_key: String,
		coordinator: String,
		threshold: u32,
		total_parts: u32,
		part_index: u32,
		se_id: String,
		participants: Vec<String>,
	},
	KeygenResponse {
		session_key: String,
		part_index: u32,
		cpic: String,
		accept: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	KeygenParams {
		session_key: String,
		threshold: u32,
		total_parts: u32,
		part_index: u32,
		filename: String,
	},
	KeygenResult {
		session_key: String,
		part_index: u32,
		address: String,
		cpic: String,
		encrypted_shard: String,
		success: bool,
		message: String,
	},
	KeygenComplete {
		session_key: String,
		address: String,
		success: bool,
		message: String,
	},
	SignRequest {
		session_key: String,
		threshold: u32,
		total_parts: u32,
		data: String,
		address: String,
		participants: Vec<String>,
	},
	SignInvite {
		session_key: String,
		data: String,
		address: String,
		part_index: u32,
		se_id: String,
		participants: Vec<String>,
	},
	SignResponse {
		session_key: String,
		part_index: u32,
		cpic: String,
		accept: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	SignParams {
		session_key: String,
		data: String,
		address: String,
		signature: String,
		/// Comma-separated 1-based slot indices, in slot order.
		parties: String,
		part_index: u32,
		filename: String,
		encrypted_shard: String,
	},
	SignResult {
		session_key: String,
		part_index: u32,
		success: bool,
		signature: String,
		message: String,
	},
	SignComplete {
		session_key: String,
		signature: String,
		success: bool,
		message: String,
	},
	Error {
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		details: Option<String>,
	},
}

impl Frame {
	/// Short label for logs.
	pub fn kind(&self) -> &'static str {
		match self {
			Frame::Register { .. } => "register",
			Frame::RegisterComplete { .. } => "register_complete",
			Frame::KeygenRequest { .. } => "keygen_request",
			Frame::KeygenInvite { .. } => "keygen_invite",
			Frame::KeygenResponse { .. } => "keygen_response",
			Frame::KeygenParams { .. } => "keygen_params",
			Frame::KeygenResult { .. } => "keygen_result",
			Frame::KeygenComplete { .. } => "keygen_complete",
			Frame::SignRequest { .. } => "sign_request",
			Frame::SignInvite { .. } => "sign_invite",
			Frame::SignResponse { .. } => "sign_response",
			Frame::SignParams { .. } => "sign_params",
			Frame::SignResult { .. } => "sign_result",
			Frame::SignComplete { .. } => "sign_complete",
			Frame::Error { .. } => "error",
		}
	}

	pub fn error(message: impl Into<String>) -> Frame {
		Frame::Error { message: message.into(), details: None }
	}

	pub fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Frame {
		Frame::Error { message: message.into(), details: Some(details.into()) }
	}
}

/// The participant-side hint passed to the external MPC binary.
pub fn params_filename(session_key: &str, part_index: u32) -> String {
	format!("{session_key}_{part_index}.json")
}
