use serde::{Deserialize, Serialize};
use tracing::info;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{
	auth::Claims,
	db::{RepositoryError, Role, User},
};

use super::{ensure_admin, with_auth, with_context, ApiError, RestContext};

#[derive(Deserialize)]
struct LoginRequest {
	username: String,
	password: String,
}

#[derive(Serialize)]
struct LoginResponse {
	success: bool,
	token: String,
	username: String,
	role: Role,
}

#[derive(Deserialize)]
struct RegisterRequest {
	username: String,
	password: String,
	email: String,
}

#[derive(Serialize)]
struct StatusResponse {
	success: bool,
	message: String,
}

/// What the admin listing exposes; the credential column never leaves the
/// repository.
#[derive(Serialize)]
struct UserView {
	username: String,
	email: String,
	role: Role,
}

impl From<User> for UserView {
	fn from(user: User) -> Self {
		UserView { username: user.username, email: user.email, role: user.role }
	}
}

#[derive(Deserialize)]
struct RoleUpdate {
	role: Role,
}

pub fn routes(
	ctx: RestContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let login = warp::path!("user" / "login")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_context(ctx.clone()))
		.and_then(login);

	let register = warp::path!("user" / "register")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_context(ctx.clone()))
		.and_then(register);

	let logout = warp::path!("user" / "logout")
		.and(warp::post())
		.and(with_auth(ctx.clone()))
		.and_then(logout);

	let check_auth = warp::path!("user" / "checkAuth")
		.and(warp::post())
		.and(with_auth(ctx.clone()))
		.and_then(check_auth);

	let list_users = warp::path!("user" / "admin" / "users")
		.and(warp::get())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx.clone()))
		.and_then(list_users);

	let update_role = warp::path!("user" / "admin" / "users" / String / "role")
		.and(warp::put())
		.and(warp::body::json())
		.and(with_auth(ctx.clone()))
		.and(with_context(ctx))
		.and_then(update_role);

	login.or(register).or(logout).or(check_auth).or(list_users).or(update_role)
}

async fn login(request: LoginRequest, ctx: RestContext) -> Result<impl Reply, Rejection> {
	// The stored credential column is opaque to the server; whatever the
	// client transmits is compared against it verbatim.
	let user = ctx
		.repository
		.user_by_credentials(&request.username, &request.password)
		.map_err(|error| match error {
			RepositoryError::NotFound =>
				ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials"),
			other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
		})?;

	let token = ctx
		.tokens
		.issue(&user.username, user.role)
		.map_err(|error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))?;

	info!(username = user.username, "User logged in");
	Ok(warp::reply::json(&LoginResponse {
		success: true,
		token,
		username: user.username,
		role: user.role,
	}))
}

async fn register(request: RegisterRequest, ctx: RestContext) -> Result<impl Reply, Rejection> {
	if request.username.is_empty() || request.password.is_empty() {
		return Err(ApiError::new(StatusCode::BAD_REQUEST, "username and password are required"));
	}

	// Self-registration always lands at the guest role
	let user = User {
		username: request.username,
		password_hash: request.password,
		email: request.email,
		role: Role::Guest,
	};
	ctx.repository.create_user(&user).map_err(|error| match error {
		RepositoryError::AlreadyExists =>
			ApiError::new(StatusCode::CONFLICT, "username is already taken"),
		RepositoryError::InvalidParameter(message) =>
			ApiError::new(StatusCode::BAD_REQUEST, message),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;

	info!(username = user.username, "User registered");
	Ok(warp::reply::json(&StatusResponse {
		success: true,
		message: "registered".to_string(),
	}))
}

async fn logout(claims: Claims) -> Result<impl Reply, Rejection> {
	// Tokens are not tracked server-side; the client discards its copy
	info!(username = claims.sub, "User logged out");
	Ok(warp::reply::json(&StatusResponse { success: true, message: "logged out".to_string() }))
}

#[derive(Serialize)]
struct CheckAuthResponse {
	success: bool,
	username: String,
	role: Role,
}

async fn check_auth(claims: Claims) -> Result<impl Reply, Rejection> {
	Ok(warp::reply::json(&CheckAuthResponse {
		success: true,
		username: claims.sub,
		role: claims.role,
	}))
}

async fn list_users(claims: Claims, ctx: RestContext) -> Result<impl Reply, Rejection> {
	ensure_admin(&claims)?;
	let users: Vec<UserView> = ctx
		.repository
		.list_users()
		.map_err(|error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))?
		.into_iter()
		.map(UserView::from)
		.collect();
	Ok(warp::reply::json(&users))
}

async fn update_role(
	username: String,
	update: RoleUpdate,
	claims: Claims,
	ctx: RestContext,
) -> Result<impl Reply, Rejection> {
	ensure_admin(&claims)?;
	ctx.repository.update_role(&username, update.role).map_err(|error| match error {
		RepositoryError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "no such user"),
		other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
	})?;

	info!(username, role = %update.role, by = claims.sub, "Role updated");
	Ok(warp::reply::json(&StatusResponse {
		success: true,
		message: format!("{username} is now {}", update.role),
	}))
}
