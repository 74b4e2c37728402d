use std::sync::Arc;

use futures::{
	stream::{SplitSink, SplitStream},
	SinkExt, StreamExt,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use warp::ws::{Message, WebSocket};

use crate::constants::{OUTBOUND_QUEUE_SIZE, PING_INTERVAL, READ_DEADLINE, WRITE_WAIT};

use super::{
	dispatcher::{ConnectionContext, Dispatcher},
	frame::Frame,
};

/// Drive one upgraded websocket until it closes. The reader task (this
/// function) owns the writer task's lifetime: when the reader exits it
/// trips the close latch, unregisters the connection and joins the writer,
/// so the socket is shut down exactly once.
pub async fn serve_connection(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
	let conn_id = dispatcher.hub.next_conn_id();
	let (sink, stream) = socket.split();

	let (outbound, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_SIZE);
	let shutdown = Arc::new(watch::channel(false).0);

	let writer = tokio::spawn(write_loop(conn_id, sink, outbound_rx, shutdown.subscribe()));

	let mut ctx = ConnectionContext::new(conn_id, outbound, shutdown.clone());
	read_loop(conn_id, stream, &dispatcher, &mut ctx).await;

	shutdown.send_replace(true);
	if let Some((username, _)) = &ctx.identity {
		dispatcher.hub.unregister(username, conn_id).await;
	}
	let _ = writer.await;
	debug!(conn_id, "Connection torn down");
}

async fn read_loop(
	conn_id: u64,
	mut stream: SplitStream<WebSocket>,
	dispatcher: &Dispatcher,
	ctx: &mut ConnectionContext,
) {
	loop {
		// The deadline restarts on every inbound message, pongs included
		let message = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
			Err(_) => {
				warn!(conn_id, "Read deadline elapsed, closing connection");
				return;
			},
			Ok(None) => return,
			Ok(Some(Err(error))) => {
				debug!(conn_id, "Socket read failed: {error}");
				return;
			},
			Ok(Some(Ok(message))) => message,
		};

		if message.is_close() {
			return;
		}
		if message.is_ping() || message.is_pong() {
			continue;
		}

		match message.to_str() {
			Ok(text) => dispatcher.dispatch(ctx, text).await,
			Err(()) => ctx.reply(Frame::error("only text frames are accepted")),
		}
	}
}

async fn write_loop(
	conn_id: u64,
	mut sink: SplitSink<WebSocket, Message>,
	mut outbound: mpsc::Receiver<Frame>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ping = tokio::time::interval(PING_INTERVAL);
	ping.tick().await;

	loop {
		tokio::select! {
			maybe_frame = outbound.recv() => match maybe_frame {
				Some(frame) =>
					if !send_frame(conn_id, &mut sink, frame).await {
						break;
					},
				None => break,
			},
			_ = ping.tick() => {
				let ping_result =
					tokio::time::timeout(WRITE_WAIT, sink.send(Message::ping(Vec::new()))).await;
				if !matches!(ping_result, Ok(Ok(()))) {
					debug!(conn_id, "Ping failed, closing connection");
					break;
				}
			},
			result = shutdown.changed() => {
				if result.is_err() || *shutdown.borrow() {
					// Flush whatever is already queued before closing
					while let Ok(frame) = outbound.try_recv() {
						if !send_frame(conn_id, &mut sink, frame).await {
							break;
						}
					}
					break;
				}
			},
		}
	}

	let _ = sink.send(Message::close()).await;
}

/// Serialize and push a single frame. Frames are never batched into one
/// transport message; `send` flushes before the next frame goes out.
async fn send_frame(conn_id: u64, sink: &mut SplitSink<WebSocket, Message>, frame: Frame) -> bool {
	let text = match serde_json::to_string(&frame) {
		Ok(text) => text,
		Err(error) => {
			warn!(conn_id, "Failed to encode outbound frame: {error}");
			return true;
		},
	};

	match tokio::time::timeout(WRITE_WAIT, sink.send(Message::text(text))).await {
		Ok(Ok(())) => true,
		Ok(Err(error)) => {
			debug!(conn_id, "Socket write failed: {error}");
			false
		},
		Err(_) => {
			warn!(conn_id, "Write deadline elapsed");
			false
		},
	}
}
