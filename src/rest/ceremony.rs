use serde::Serialize;
use tracing::info;
use uuid::Uuid;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{
	auth::Claims,
	db::{RepositoryError, SessionStatus},
};

use super::{with_auth, with_context, ApiError, RestContext};

#[derive(Serialize)]
struct SessionKeyResponse {
	success: bool,
	session_key: String,
	initiator: String,
}

#[derive(Serialize)]
struct ParticipantsResponse {
	success: bool,
	participants: Vec<String>,
}

pub fn routes(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let keygen_create = warp::path!("keygen" / "create" / String)
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and_then(create_session_key);

	let keygen_users = warp::path!("keygen" / "users")
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx.clone()))
		.and_then(eligible_users);

	let sign_create = warp::path!("sign" / "create" / String)
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and_then(create_session_key);

	let sign_users = warp::path!("sign" / "users" / String)
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx))
		.and_then(signers_for_address);

	keygen_create.or(keygen_users).or(sign_create).or(sign_users)
}

/// Mint a fresh session key. The ceremony itself is created when the
/// initiator sends the request frame over its connection.
async fn create_session_key(initiator: String, claims: Claims) -> Result<impl Reply, Rejection> {
	if !claims.role.can_initiate() {
		return Err(ApiError::new(StatusCode::FORBIDDEN, "coordinator role required"));
	}
	if claims.sub != initiator {
		return Err(ApiError::new(
			StatusCode::FORBIDDEN,
			"initiators may only mint session keys for themselves",
		));
	}

	let session_key = Uuid::new_v4().to_string();
	info!(initiator, session_key, "Session key minted");
	Ok(warp::reply::json(&SessionKeyResponse { success: true, session_key, initiator }))
}

/// Users eligible to hold ceremony slots.
async fn eligible_users(_claims: Claims, ctx: RestContext) -> Result<impl Reply, Rejection> {
	let participants = ctx
		.repository
		.list_users()
		.map_err(|error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))?
		.into_iter()
		.filter(|user| user.role.can_participate())
		.map(|user| user.username)
		.collect();
	Ok(warp::reply::json(&ParticipantsResponse { success: true, participants }))
}

/// Participants of the completed key generation ceremony for an address,
/// i.e. the candidate signer set.
async fn signers_for_address(
	address: String,
	_claims: Claims,
	ctx: RestContext,
) -> Result<impl Reply, Rejection> {
	let keygen = ctx.repository.keygen_by_address(&address).map_err(|error| match error {
		RepositoryError::NotFound =>
			ApiError::new(StatusCode::NOT_FOUND, "no key generation ceremony for this address"),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;
	if keygen.status != SessionStatus::Completed {
		return Err(ApiError::new(
			StatusCode::NOT_FOUND,
			"key generation for this address did not complete",
		));
	}

	Ok(warp::reply::json(&ParticipantsResponse {
		success: true,
		participants: keygen.participants,
	}))
}
