pub mod ceremony;
pub mod se;
pub mod share;
pub mod user;

#[cfg(test)]
mod tests;

use std::{convert::Infallible, sync::Arc};

use serde::Serialize;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{
	auth::{Claims, TokenAuthority},
	db::{Repository, Role},
	ws::hub::ConnectionHub,
};

/// Dependencies shared by every REST handler.
#[derive(Clone)]
pub struct RestContext {
	pub repository: Arc<dyn Repository>,
	pub tokens: Arc<TokenAuthority>,
	pub hub: Arc<ConnectionHub>,
}

/// Typed rejection carrying the HTTP status to report.
#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
	pub fn new(status: StatusCode, message: impl Into<String>) -> Rejection {
		warp::reject::custom(ApiError { status, message: message.into() })
	}
}

#[derive(Serialize)]
struct ErrorBody {
	success: bool,
	message: String,
}

pub fn routes(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	user::routes(ctx.clone())
		.or(ceremony::routes(ctx.clone()))
		.or(share::routes(ctx.clone()))
		.or(se::routes(ctx.clone()))
		.or(stats_route(ctx))
}

pub(crate) fn with_context(
	ctx: RestContext,
) -> impl Filter<Extract = (RestContext,), Error = Infallible> + Clone {
	warp::any().map(move || ctx.clone())
}

/// Extract and validate the JWT from the `Authorization` header.
pub(crate) fn with_auth(
	ctx: RestContext,
) -> impl Filter<Extract = (Claims,), Error = Rejection> + Clone {
	warp::header::optional::<String>("authorization").and(with_context(ctx)).and_then(
		|header: Option<String>, ctx: RestContext| async move {
			let header = header.ok_or_else(|| {
				ApiError::new(StatusCode::UNAUTHORIZED, "missing authorization header")
			})?;
			ctx.tokens
				.verify(&header)
				.map_err(|error| ApiError::new(StatusCode::UNAUTHORIZED, error.to_string()))
		},
	)
}

pub(crate) fn ensure_admin(claims: &Claims) -> Result<(), Rejection> {
	if claims.role != Role::Admin {
		return Err(ApiError::new(StatusCode::FORBIDDEN, "admin role required"));
	}
	Ok(())
}

#[derive(Serialize)]
struct StatsResponse {
	success: bool,
	active_connections: usize,
	reconnections: u64,
}

fn stats_route(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path!("admin" / "stats").and(warp::get()).and(with_auth(ctx.clone())).and(with_context(ctx)).and_then(
		|claims: Claims, ctx: RestContext| async move {
			ensure_admin(&claims)?;
			let stats = ctx.hub.stats().await;
			Ok::<_, Rejection>(warp::reply::json(&StatsResponse {
				success: true,
				active_connections: stats.active_connections,
				reconnections: stats.reconnections,
			}))
		},
	)
}

/// Map rejections onto a JSON error body with the right status code.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
	let (status, message) = if rejection.is_not_found() {
		(StatusCode::NOT_FOUND, "not found".to_string())
	} else if let Some(api_error) = rejection.find::<ApiError>() {
		(api_error.status, api_error.message.clone())
	} else if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
		(StatusCode::BAD_REQUEST, "invalid request body".to_string())
	} else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
		(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
	} else {
		(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
	};

	Ok(warp::reply::with_status(
		warp::reply::json(&ErrorBody { success: false, message }),
		status,
	))
}
