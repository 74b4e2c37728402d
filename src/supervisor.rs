use std::{
	path::{Path, PathBuf},
	process::Stdio,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use anyhow::Context;
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	process::{Child, Command},
	sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::{constants::HELPER_STOP_ESCALATION, settings};

const LATEST_SYMLINK: &str = "helper-latest.log";

enum Control {
	Stop,
}

/// Runs the external MPC manager binary as a supervised child process:
/// stdio teed to a per-run log file plus a rolling symlink, restart with a
/// fixed backoff on unexpected exit, interrupt-then-kill on stop.
pub struct Supervisor {
	control: mpsc::Sender<Control>,
	alive: Arc<AtomicBool>,
	task: tokio::task::JoinHandle<()>,
}

impl Supervisor {
	pub fn start(settings: settings::Helper) -> anyhow::Result<Self> {
		std::fs::create_dir_all(&settings.log_dir).with_context(|| {
			format!("Could not create helper log directory {}", settings.log_dir.display())
		})?;

		let (control, control_rx) = mpsc::channel(1);
		let alive = Arc::new(AtomicBool::new(false));
		let task = tokio::spawn(run(settings, control_rx, alive.clone()));

		Ok(Supervisor { control, alive, task })
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst)
	}

	/// Interrupt the helper, escalating to a kill after a grace period,
	/// and wait for the supervision loop to finish.
	pub async fn stop(self) {
		let _ = self.control.send(Control::Stop).await;
		let _ = self.task.await;
	}
}

async fn run(
	settings: settings::Helper,
	mut control: mpsc::Receiver<Control>,
	alive: Arc<AtomicBool>,
) {
	loop {
		let mut child = match spawn_helper(&settings) {
			Ok(child) => child,
			Err(error) => {
				error!("Failed to launch the helper binary: {error:#}");
				if !settings.auto_restart {
					return;
				}
				tokio::time::sleep(Duration::from_secs(settings.restart_backoff_secs)).await;
				continue;
			},
		};

		// The pid is needed for signalling after the child moves into the
		// waiter task.
		let pid = child.id();
		alive.store(true, Ordering::SeqCst);
		info!(pid, "Helper process started");

		let mut waiter = tokio::spawn(async move { child.wait().await });

		tokio::select! {
			status = &mut waiter => {
				alive.store(false, Ordering::SeqCst);
				match status {
					Ok(Ok(status)) if status.success() => {
						info!("Helper process exited cleanly");
					},
					Ok(Ok(status)) => {
						warn!(%status, "Helper process exited abnormally");
					},
					Ok(Err(error)) => {
						error!("Failed waiting on the helper process: {error}");
					},
					Err(error) => {
						error!("Helper waiter task failed: {error}");
					},
				}
				if !settings.auto_restart {
					return;
				}
				debug!(
					"Restarting the helper in {} seconds",
					settings.restart_backoff_secs
				);
				tokio::time::sleep(Duration::from_secs(settings.restart_backoff_secs)).await;
			},
			Some(Control::Stop) = control.recv() => {
				info!(pid, "Stopping the helper process");
				signal(pid, libc::SIGINT);
				if tokio::time::timeout(HELPER_STOP_ESCALATION, &mut waiter).await.is_err() {
					warn!(pid, "Helper ignored the interrupt, killing it");
					signal(pid, libc::SIGKILL);
					let _ = waiter.await;
				}
				alive.store(false, Ordering::SeqCst);
				return;
			},
		}
	}
}

fn signal(pid: Option<u32>, signal: libc::c_int) {
	if let Some(pid) = pid {
		// Safety: plain kill(2) on a pid we spawned ourselves
		unsafe {
			libc::kill(pid as libc::pid_t, signal);
		}
	}
}

/// Launch the binary with piped stdio and start the tee task writing to a
/// fresh per-run log file, then repoint the rolling symlink at it.
fn spawn_helper(settings: &settings::Helper) -> anyhow::Result<Child> {
	let mut child = Command::new(&settings.binary_path)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.with_context(|| format!("Could not spawn {}", settings.binary_path.display()))?;

	let log_path = settings.log_dir.join(format!(
		"helper-{}.log",
		chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
	));

	let stdout = child.stdout.take().context("Helper stdout was not piped")?;
	let stderr = child.stderr.take().context("Helper stderr was not piped")?;

	let (line_sender, line_receiver) = mpsc::unbounded_channel();
	tokio::spawn(forward_lines(BufReader::new(stdout), line_sender.clone()));
	tokio::spawn(forward_lines(BufReader::new(stderr), line_sender));
	tokio::spawn(write_log(log_path.clone(), line_receiver));

	update_latest_symlink(&settings.log_dir, &log_path);

	Ok(child)
}

async fn forward_lines<R>(reader: BufReader<R>, sender: mpsc::UnboundedSender<String>)
where
	R: tokio::io::AsyncRead + Unpin,
{
	let mut lines = reader.lines();
	while let Ok(Some(line)) = lines.next_line().await {
		if sender.send(line).is_err() {
			return;
		}
	}
}

async fn write_log(path: PathBuf, mut lines: mpsc::UnboundedReceiver<String>) {
	let mut file = match tokio::fs::File::create(&path).await {
		Ok(file) => file,
		Err(error) => {
			error!("Could not create helper log file {}: {error}", path.display());
			return;
		},
	};

	while let Some(line) = lines.recv().await {
		let line = format!("{line}\n");
		if let Err(error) = file.write_all(line.as_bytes()).await {
			warn!("Could not write to helper log: {error}");
			return;
		}
	}
	let _ = file.flush().await;
}

fn update_latest_symlink(log_dir: &Path, log_path: &Path) {
	let link = log_dir.join(LATEST_SYMLINK);
	let _ = std::fs::remove_file(&link);
	if let Err(error) = std::os::unix::fs::symlink(log_path, &link) {
		warn!("Could not update {}: {error}", link.display());
	}
}
