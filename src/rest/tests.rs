use std::sync::Arc;

use warp::http::StatusCode;
use warp::Filter;

use crate::{
	auth::TokenAuthority,
	db::{
		EncryptedShard, KeyGenRecord, Repository, Role, SessionStatus, SlotState,
		SqliteRepository, User,
	},
	ws::hub::ConnectionHub,
};

use super::{handle_rejection, routes, RestContext};

fn context() -> RestContext {
	let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
	RestContext {
		repository,
		tokens: Arc::new(TokenAuthority::from_secret(b"test-secret")),
		hub: Arc::new(ConnectionHub::new()),
	}
}

fn seed_user(ctx: &RestContext, username: &str, role: Role) {
	ctx.repository
		.create_user(&User {
			username: username.to_string(),
			password_hash: format!("hash-{username}"),
			email: format!("{username}@example.com"),
			role,
		})
		.unwrap();
}

fn token_for(ctx: &RestContext, username: &str, role: Role) -> String {
	format!("Bearer {}", ctx.tokens.issue(username, role).unwrap())
}

fn seed_completed_keygen(ctx: &RestContext, session_key: &str, address: &str) {
	ctx.repository
		.upsert_keygen(&KeyGenRecord {
			session_key: session_key.to_string(),
			initiator: "admin".to_string(),
			threshold: 2,
			total_parts: 2,
			participants: vec!["u1".to_string(), "u2".to_string()],
			responses: vec![SlotState::Completed; 2],
			chips: vec!["SE000".to_string(), "SE001".to_string()],
			account_address: Some(address.to_string()),
			status: SessionStatus::Completed,
		})
		.unwrap();
}

#[tokio::test]
async fn login_mints_a_token() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("POST")
		.path("/user/login")
		.json(&serde_json::json!({"username": "u1", "password": "hash-u1"}))
		.reply(&filter)
		.await;

	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["success"], true);
	assert_eq!(body["role"], "participant");
	assert!(!body["token"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("POST")
		.path("/user/login")
		.json(&serde_json::json!({"username": "u1", "password": "nope"}))
		.reply(&filter)
		.await;

	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_creates_a_guest() {
	let ctx = context();
	let filter = routes(ctx.clone()).recover(handle_rejection);

	let request = serde_json::json!({
		"username": "newbie",
		"password": "secret",
		"email": "newbie@example.com"
	});
	let response = warp::test::request()
		.method("POST")
		.path("/user/register")
		.json(&request)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(ctx.repository.user_by_username("newbie").unwrap().role, Role::Guest);

	// A second registration under the same name conflicts
	let response = warp::test::request()
		.method("POST")
		.path("/user/register")
		.json(&request)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn check_auth_requires_a_token() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	let token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response =
		warp::test::request().method("POST").path("/user/checkAuth").reply(&filter).await;
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

	let response = warp::test::request()
		.method("POST")
		.path("/user/checkAuth")
		.header("authorization", token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["username"], "u1");
}

#[tokio::test]
async fn user_listing_is_admin_only() {
	let ctx = context();
	seed_user(&ctx, "admin", Role::Admin);
	seed_user(&ctx, "u1", Role::Participant);
	let admin_token = token_for(&ctx, "admin", Role::Admin);
	let user_token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("GET")
		.path("/user/admin/users")
		.header("authorization", user_token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);

	let response = warp::test::request()
		.method("GET")
		.path("/user/admin/users")
		.header("authorization", admin_token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body.as_array().unwrap().len(), 2);
	// The credential column stays server-side
	assert!(body[0].get("password_hash").is_none());
}

#[tokio::test]
async fn admins_can_change_roles() {
	let ctx = context();
	seed_user(&ctx, "admin", Role::Admin);
	seed_user(&ctx, "u1", Role::Guest);
	let admin_token = token_for(&ctx, "admin", Role::Admin);
	let filter = routes(ctx.clone()).recover(handle_rejection);

	let response = warp::test::request()
		.method("PUT")
		.path("/user/admin/users/u1/role")
		.header("authorization", admin_token)
		.json(&serde_json::json!({"role": "participant"}))
		.reply(&filter)
		.await;

	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(ctx.repository.user_by_username("u1").unwrap().role, Role::Participant);
}

#[tokio::test]
async fn session_keys_are_minted_for_the_caller_only() {
	let ctx = context();
	seed_user(&ctx, "coord", Role::Coordinator);
	seed_user(&ctx, "u1", Role::Participant);
	let coord_token = token_for(&ctx, "coord", Role::Coordinator);
	let user_token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("GET")
		.path("/keygen/create/coord")
		.header("authorization", coord_token.clone())
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert!(!body["session_key"].as_str().unwrap().is_empty());

	// Participants cannot initiate
	let response = warp::test::request()
		.method("GET")
		.path("/sign/create/u1")
		.header("authorization", user_token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);

	// Nor can a coordinator mint for somebody else
	let response = warp::test::request()
		.method("GET")
		.path("/keygen/create/other")
		.header("authorization", coord_token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn eligible_users_excludes_guests() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	seed_user(&ctx, "visitor", Role::Guest);
	let token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("GET")
		.path("/keygen/users")
		.header("authorization", token)
		.reply(&filter)
		.await;

	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["participants"], serde_json::json!(["u1"]));
}

#[tokio::test]
async fn signer_listing_reads_the_completed_keygen() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	seed_completed_keygen(&ctx, "kg1", "0xAAA");
	let token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx).recover(handle_rejection);

	let response = warp::test::request()
		.method("GET")
		.path("/sign/users/0xAAA")
		.header("authorization", token.clone())
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["participants"], serde_json::json!(["u1", "u2"]));

	let response = warp::test::request()
		.method("GET")
		.path("/sign/users/0xBBB")
		.header("authorization", token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn share_lookup_returns_the_callers_shard() {
	let ctx = context();
	seed_user(&ctx, "u1", Role::Participant);
	seed_user(&ctx, "u3", Role::Participant);
	seed_completed_keygen(&ctx, "kg1", "0xAAA");
	ctx.repository
		.save_shard(&EncryptedShard {
			username: "u1".to_string(),
			account_address: "0xAAA".to_string(),
			shard_index: 1,
			cpic: "cpic0".to_string(),
			ciphertext: "b64<u1>".to_string(),
		})
		.unwrap();
	let filter = routes(ctx.clone()).recover(handle_rejection);

	let response = warp::test::request()
		.method("GET")
		.path("/share/kg1")
		.header("authorization", token_for(&ctx, "u1", Role::Participant))
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["ciphertext"], "b64<u1>");
	assert_eq!(body["shard_index"], 1);

	// A participant without a stored shard gets nothing
	let response = warp::test::request()
		.method("GET")
		.path("/share/kg1")
		.header("authorization", token_for(&ctx, "u3", Role::Participant))
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn registry_seeding_is_admin_only() {
	let ctx = context();
	seed_user(&ctx, "admin", Role::Admin);
	seed_user(&ctx, "u1", Role::Participant);
	let admin_token = token_for(&ctx, "admin", Role::Admin);
	let user_token = token_for(&ctx, "u1", Role::Participant);
	let filter = routes(ctx.clone()).recover(handle_rejection);

	let request = serde_json::json!({"se_id": "SE000", "cpic": "cpic0"});
	let response = warp::test::request()
		.method("POST")
		.path("/se/admin/create")
		.header("authorization", user_token)
		.json(&request)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);

	let response = warp::test::request()
		.method("POST")
		.path("/se/admin/create")
		.header("authorization", admin_token.clone())
		.json(&request)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(ctx.repository.se_by_id("SE000").unwrap().cpic, "cpic0");

	// Duplicates conflict
	let response = warp::test::request()
		.method("POST")
		.path("/se/admin/create")
		.header("authorization", admin_token.clone())
		.json(&request)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::CONFLICT);

	let response = warp::test::request()
		.method("GET")
		.path("/se/admin/list")
		.header("authorization", admin_token)
		.reply(&filter)
		.await;
	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn stats_report_hub_counters() {
	let ctx = context();
	seed_user(&ctx, "admin", Role::Admin);
	let token = token_for(&ctx, "admin", Role::Admin);

	let conn_id = ctx.hub.next_conn_id();
	let (handle, _receiver) = ctx.hub.new_handle(conn_id, "u1".to_string(), Role::Participant);
	ctx.hub.register(handle).await;

	let filter = routes(ctx).recover(handle_rejection);
	let response = warp::test::request()
		.method("GET")
		.path("/admin/stats")
		.header("authorization", token)
		.reply(&filter)
		.await;

	assert_eq!(response.status(), StatusCode::OK);
	let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
	assert_eq!(body["active_connections"], 1);
	assert_eq!(body["reconnections"], 0);
}
