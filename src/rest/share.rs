use serde::Serialize;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{auth::Claims, db::RepositoryError};

use super::{with_auth, with_context, ApiError, RestContext};

#[derive(Serialize)]
struct ShareResponse {
	success: bool,
	account_address: String,
	shard_index: u32,
	cpic: String,
	ciphertext: String,
}

pub fn routes(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path!("share" / String)
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx))
		.and_then(share_for_session)
}

/// Retrieve the caller's own encrypted shard for the account a keygen
/// ceremony produced. Only the shard owner can fetch it; the session key
/// merely identifies the ceremony.
async fn share_for_session(
	session_key: String,
	claims: Claims,
	ctx: RestContext,
) -> Result<impl Reply, Rejection> {
	let keygen = ctx.repository.keygen(&session_key).map_err(|error| match error {
		RepositoryError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "no such session"),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;
	let address = keygen.account_address.ok_or_else(|| {
		ApiError::new(StatusCode::NOT_FOUND, "the session produced no account")
	})?;

	let shard = ctx.repository.shard(&claims.sub, &address).map_err(|error| match error {
		RepositoryError::NotFound =>
			ApiError::new(StatusCode::NOT_FOUND, "no shard stored for this user"),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;

	Ok(warp::reply::json(&ShareResponse {
		success: true,
		account_address: shard.account_address,
		shard_index: shard.shard_index,
		cpic: shard.cpic,
		ciphertext: shard.ciphertext,
	}))
}
