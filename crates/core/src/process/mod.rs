//! Supervision of the developer's command.

pub mod output;
mod signal;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nsm_protocol::{LogSource, SessionEvent};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::signal::{Delivery, group_alive, kill_group, terminate_group};
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Default wait between the graceful and the forced stop.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on waiting for the kernel to reap a force-killed group.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long trailing output is drained after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll interval while waiting for the rest of the group to exit.
const GROUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
	NotStarted,
	Running,
	/// Exited on its own or after the graceful signal.
	Exited(Option<i32>),
	/// Needed the forced kill.
	Killed,
}

/// What [`ProcessSupervisor::stop`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	NotRunning,
	Terminated,
	Killed,
}

/// Splits a command line with shell quoting rules, falling back to whitespace splitting.
pub fn parse_command(command: &str) -> Vec<String> {
	match shlex::split(command) {
		Some(args) => args,
		None => {
			debug!(target = "nsm.process", command, "shell lexing failed, splitting on whitespace");
			command.split_whitespace().map(str::to_string).collect()
		}
	}
}

struct ChildHandle {
	pid: u32,
	exit: watch::Receiver<Option<Option<i32>>>,
	tasks: Vec<JoinHandle<()>>,
}

/// Owns one child process (and its process group) at a time.
pub struct ProcessSupervisor {
	events: EventBus,
	grace: Duration,
	handle: Option<ChildHandle>,
	state: ProcessState,
}

impl ProcessSupervisor {
	pub fn new(events: EventBus) -> Self {
		Self::with_grace(events, DEFAULT_GRACE)
	}

	pub fn with_grace(events: EventBus, grace: Duration) -> Self {
		Self {
			events,
			grace,
			handle: None,
			state: ProcessState::NotStarted,
		}
	}

	/// Spawns `command` in `working_dir` with `env` layered over the inherited environment.
	///
	/// Output is streamed as [`SessionEvent::Log`]; the exit code is published as
	/// [`SessionEvent::ProcessExited`].
	pub fn start(&mut self, command: &str, working_dir: &Path, env: &[(String, String)]) -> Result<u32> {
		if self.is_running() {
			return Err(Error::BackendStartFailed("a process is already running".into()));
		}

		let args = parse_command(command);
		let Some((program, rest)) = args.split_first() else {
			return Err(Error::BackendStartFailed("empty command".into()));
		};

		let mut cmd = Command::new(program);
		cmd.args(rest)
			.current_dir(working_dir)
			.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		#[cfg(unix)]
		cmd.process_group(0);

		info!(target = "nsm.process", command, dir = %working_dir.display(), "starting development command");
		let mut child = cmd.spawn().map_err(|e| Error::BackendStartFailed(format!("{program}: {e}")))?;
		let pid = child.id().ok_or_else(|| Error::BackendStartFailed("process exited before a pid was assigned".into()))?;

		let mut tasks = Vec::with_capacity(3);
		if let Some(stdout) = child.stdout.take() {
			tasks.push(tokio::spawn(output::stream_lines(stdout, LogSource::Stdout, self.events.clone())));
		}
		if let Some(stderr) = child.stderr.take() {
			tasks.push(tokio::spawn(output::stream_lines(stderr, LogSource::Stderr, self.events.clone())));
		}

		let (exit_tx, exit_rx) = watch::channel(None);
		let events = self.events.clone();
		tokio::spawn(async move {
			let code = match child.wait().await {
				Ok(status) => status.code(),
				Err(err) => {
					warn!(target = "nsm.process", pid, error = %err, "failed waiting for child");
					None
				}
			};
			match code {
				Some(0) => info!(target = "nsm.process", pid, "development command completed"),
				_ => warn!(target = "nsm.process", pid, exit_code = ?code, "development command exited"),
			}
			let _ = exit_tx.send(Some(code));
			events.emit(SessionEvent::ProcessExited { code });
		});

		self.handle = Some(ChildHandle { pid, exit: exit_rx, tasks });
		self.state = ProcessState::Running;
		Ok(pid)
	}

	/// Graceful-then-forceful stop of the whole process group.
	///
	/// The group is signalled even when its leader already exited, so
	/// backgrounded descendants are not left behind. Succeeds once every
	/// member is gone; fails only when the forced kill could not be delivered.
	pub async fn stop(&mut self) -> Result<StopOutcome> {
		let Some(mut handle) = self.handle.take() else {
			return Ok(StopOutcome::NotRunning);
		};

		let exited = *handle.exit.borrow();
		if let Some(code) = exited {
			if !group_alive(handle.pid) {
				self.state = ProcessState::Exited(code);
				drain(handle.tasks).await;
				return Ok(StopOutcome::NotRunning);
			}
			info!(target = "nsm.process", pid = handle.pid, exit_code = ?code, "development command exited but left processes behind");
		}

		info!(target = "nsm.process", pid = handle.pid, "stopping development command");
		match terminate_group(handle.pid) {
			Ok(Delivery::Sent) => {}
			Ok(Delivery::AlreadyGone) => debug!(target = "nsm.process", pid = handle.pid, "process group already gone"),
			Err(err) => warn!(target = "nsm.process", pid = handle.pid, error = %err, "graceful signal failed"),
		}

		if let Some(code) = wait_group_exit(&mut handle.exit, handle.pid, self.grace).await {
			info!(target = "nsm.process", pid = handle.pid, "development command stopped gracefully");
			self.state = ProcessState::Exited(code);
			drain(handle.tasks).await;
			return Ok(StopOutcome::Terminated);
		}

		warn!(target = "nsm.process", pid = handle.pid, grace = ?self.grace, "process group ignored termination, forcing kill");
		if let Err(err) = kill_group(handle.pid) {
			let pid = handle.pid;
			self.handle = Some(handle);
			return Err(Error::BackendStopFailed(format!("kill process group {pid}: {err}")));
		}

		if wait_group_exit(&mut handle.exit, handle.pid, REAP_TIMEOUT).await.is_none() {
			warn!(target = "nsm.process", pid = handle.pid, "process group not reaped after forced kill");
		}
		self.state = ProcessState::Killed;
		drain(handle.tasks).await;
		Ok(StopOutcome::Killed)
	}

	pub fn is_running(&self) -> bool {
		self.handle.as_ref().is_some_and(|h| h.exit.borrow().is_none())
	}

	/// Pid of the supervised process, or 0 when none was started.
	pub fn pid(&self) -> u32 {
		self.handle.as_ref().map_or(0, |h| h.pid)
	}

	pub fn state(&self) -> ProcessState {
		match &self.handle {
			Some(h) => match *h.exit.borrow() {
				Some(code) => ProcessState::Exited(code),
				None => ProcessState::Running,
			},
			None => self.state,
		}
	}

	/// Waits until the process exits by itself and returns its exit code.
	pub async fn wait(&mut self) -> Option<Option<i32>> {
		let handle = self.handle.as_mut()?;
		let mut exit = handle.exit.clone();
		let code = match exit.wait_for(Option::is_some).await {
			Ok(value) => *value,
			Err(_) => None,
		};
		code
	}
}

impl Drop for ProcessSupervisor {
	fn drop(&mut self) {
		if let Some(handle) = &self.handle {
			if handle.exit.borrow().is_none() || group_alive(handle.pid) {
				warn!(target = "nsm.process", pid = handle.pid, "supervisor dropped with a live process group, killing it");
				let _ = kill_group(handle.pid);
			}
		}
	}
}

/// Waits for the leader's exit code and then for the rest of its group.
async fn wait_group_exit(exit: &mut watch::Receiver<Option<Option<i32>>>, pid: u32, limit: Duration) -> Option<Option<i32>> {
	let wait = async {
		let code = match exit.wait_for(Option::is_some).await {
			Ok(value) => *value,
			Err(_) => None,
		};
		while group_alive(pid) {
			tokio::time::sleep(GROUP_POLL).await;
		}
		code
	};
	tokio::time::timeout(limit, wait).await.ok().flatten()
}

async fn drain(tasks: Vec<JoinHandle<()>>) {
	for mut task in tasks {
		if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
			task.abort();
		}
	}
}
