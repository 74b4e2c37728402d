use serde::{Deserialize, Serialize};
use tracing::info;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{
	auth::Claims,
	db::{RepositoryError, SecureElement},
};

use super::{ensure_admin, with_auth, with_context, ApiError, RestContext};

#[derive(Deserialize)]
struct CreateRequest {
	se_id: String,
	cpic: String,
}

#[derive(Serialize)]
struct StatusResponse {
	success: bool,
	message: String,
}

pub fn routes(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let create = warp::path!("se" / "admin" / "create")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx.clone()))
		.and_then(create_se);

	let list = warp::path!("se" / "admin" / "list")
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx))
		.and_then(list_se);

	create.or(list)
}

/// Seed one registry row binding a sticker id to the identifier the device
/// reports.
async fn create_se(
	request: CreateRequest,
	claims: Claims,
	ctx: RestContext,
) -> Result<impl Reply, Rejection> {
	ensure_admin(&claims)?;

	let se = SecureElement { se_id: request.se_id, cpic: request.cpic };
	ctx.repository.create_se(&se).map_err(|error| match error {
		RepositoryError::AlreadyExists =>
			ApiError::new(StatusCode::CONFLICT, "se_id or cpic is already registered"),
		RepositoryError::InvalidParameter(message) =>
			ApiError::new(StatusCode::BAD_REQUEST, message),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;

	info!(se_id = se.se_id, by = claims.sub, "Secure element registered");
	Ok(warp::reply::json(&StatusResponse {
		success: true,
		message: format!("{} registered", se.se_id),
	}))
}

async fn list_se(claims: Claims, ctx: RestContext) -> Result<impl Reply, Rejection> {
	ensure_admin(&claims)?;
	let elements = ctx
		.repository
		.list_se()
		.map_err(|error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))?;
	Ok(warp::reply::json(&elements))
}
