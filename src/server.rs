use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::sync::oneshot;
use tracing::{info, warn};
use warp::Filter;

use crate::{
	auth::{CapabilitySigner, TokenAuthority},
	ceremony::{CeremonyManager, SessionStore},
	db::{Repository, Role, SqliteRepository, User},
	rest::{self, RestContext},
	settings::Settings,
	supervisor::Supervisor,
	ws::{connection, hub, Dispatcher},
};

const BOOTSTRAP_ADMIN: &str = "admin";

/// A fresh deployment gets a default admin account so roles and the SE
/// registry can be seeded. The credential must be rotated immediately.
fn bootstrap_admin(repository: &dyn Repository) -> anyhow::Result<()> {
	let has_admin = repository
		.list_users()
		.map_err(|error| anyhow::anyhow!("could not list users: {error}"))?
		.iter()
		.any(|user| user.role == Role::Admin);
	if has_admin {
		return Ok(());
	}

	repository
		.create_user(&User {
			username: BOOTSTRAP_ADMIN.to_string(),
			password_hash: BOOTSTRAP_ADMIN.to_string(),
			email: String::new(),
			role: Role::Admin,
		})
		.map_err(|error| anyhow::anyhow!("could not create the bootstrap admin: {error}"))?;
	warn!("Created the bootstrap admin account, rotate its credential immediately");
	Ok(())
}

/// Wire every component and serve until a shutdown signal arrives. The
/// repository, session store and connection hub are constructed once here
/// and handed to the dispatcher explicitly.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
	let repository: Arc<dyn Repository> = Arc::new(
		SqliteRepository::open(&settings.database.path)
			.map_err(|error| anyhow::anyhow!("could not open the database: {error}"))?,
	);
	bootstrap_admin(repository.as_ref())?;
	let tokens = Arc::new(TokenAuthority::from_file(&settings.auth.jwt_secret_file)?);
	let signer = Arc::new(CapabilitySigner::from_file(&settings.auth.server_key_file)?);

	let hub = Arc::new(hub::ConnectionHub::new());
	let store = SessionStore::new(repository.clone());
	let ceremonies =
		CeremonyManager::new(repository.clone(), store, hub.clone(), signer);
	let dispatcher = Arc::new(Dispatcher::new(
		repository.clone(),
		hub.clone(),
		ceremonies.clone(),
		tokens.clone(),
	));

	let _sweeper = hub::spawn_sweeper(hub.clone());

	let supervisor = if settings.helper.binary_path.as_os_str().is_empty() {
		info!("No helper binary configured, supervision disabled");
		None
	} else {
		Some(Supervisor::start(settings.helper.clone())?)
	};

	let ws_route = {
		let dispatcher = dispatcher.clone();
		warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
			let dispatcher = dispatcher.clone();
			ws.on_upgrade(move |socket| connection::serve_connection(socket, dispatcher))
		})
	};

	let rest_routes = rest::routes(RestContext {
		repository: repository.clone(),
		tokens: tokens.clone(),
		hub: hub.clone(),
	})
	.recover(rest::handle_rejection);

	let ws_addr: SocketAddr = format!("{}:{}", settings.ws.hostname, settings.ws.port)
		.parse()
		.context("Invalid websocket listen address")?;
	let rest_addr: SocketAddr = format!("{}:{}", settings.rest.hostname, settings.rest.port)
		.parse()
		.context("Invalid REST listen address")?;

	let (ws_shutdown, ws_shutdown_rx) = oneshot::channel::<()>();
	let (rest_shutdown, rest_shutdown_rx) = oneshot::channel::<()>();

	let (bound_ws, ws_server) = warp::serve(ws_route)
		.try_bind_with_graceful_shutdown(ws_addr, async {
			ws_shutdown_rx.await.ok();
		})
		.with_context(|| format!("Could not bind the websocket listener to {ws_addr}"))?;
	let (bound_rest, rest_server) = warp::serve(rest_routes)
		.try_bind_with_graceful_shutdown(rest_addr, async {
			rest_shutdown_rx.await.ok();
		})
		.with_context(|| format!("Could not bind the REST listener to {rest_addr}"))?;

	info!("Websocket listening on ws://{bound_ws}/ws");
	info!("REST listening on http://{bound_rest}");

	let ws_task = tokio::spawn(ws_server);
	let rest_task = tokio::spawn(rest_server);

	tokio::signal::ctrl_c().await.context("Failed to listen for the shutdown signal")?;
	info!("Shutdown signal received");

	// Stop accepting traffic, fail what is still live, close every socket
	let _ = ws_shutdown.send(());
	let _ = rest_shutdown.send(());
	ceremonies.shutdown().await;
	hub.close_all().await;
	if let Some(supervisor) = supervisor {
		supervisor.stop().await;
	}
	let _ = tokio::join!(ws_task, rest_task);

	info!("Shutdown complete");
	Ok(())
}
