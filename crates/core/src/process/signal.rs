//! Group-wide termination of the supervised command.
//!
//! Unix children run in their own process group, so one signal reaches every
//! descendant. Windows has no process groups; there the whole tree rooted at
//! the child is terminated with `taskkill /T`.

use std::io;

/// Outcome of a signal delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
	Sent,
	/// Nothing left to signal.
	AlreadyGone,
}

/// Asks the group led by `pid` to exit.
pub(crate) fn terminate_group(pid: u32) -> io::Result<Delivery> {
	#[cfg(unix)]
	{
		send(pid, libc::SIGTERM)
	}

	#[cfg(windows)]
	{
		taskkill(pid, false)
	}

	#[cfg(not(any(unix, windows)))]
	{
		let _ = pid;
		Err(io::Error::new(io::ErrorKind::Unsupported, "process signalling is not supported on this platform"))
	}
}

/// Force-kills the group led by `pid`.
pub(crate) fn kill_group(pid: u32) -> io::Result<Delivery> {
	#[cfg(unix)]
	{
		send(pid, libc::SIGKILL)
	}

	#[cfg(windows)]
	{
		taskkill(pid, true)
	}

	#[cfg(not(any(unix, windows)))]
	{
		let _ = pid;
		Err(io::Error::new(io::ErrorKind::Unsupported, "process signalling is not supported on this platform"))
	}
}

/// Whether any member of the group led by `pid` still exists.
///
/// The leader may be gone while backgrounded descendants live on. Windows
/// cannot probe a tree, so there this only answers for the leader's exit.
pub(crate) fn group_alive(pid: u32) -> bool {
	#[cfg(unix)]
	{
		// Signal 0 performs the existence and permission checks only.
		match send(pid, 0) {
			Ok(Delivery::Sent) => true,
			Ok(Delivery::AlreadyGone) => false,
			Err(err) => err.raw_os_error() == Some(libc::EPERM),
		}
	}

	#[cfg(not(unix))]
	{
		let _ = pid;
		false
	}
}

#[cfg(unix)]
fn send(pid: u32, signal: libc::c_int) -> io::Result<Delivery> {
	let pgid = libc::pid_t::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
	if pgid <= 0 {
		return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid 0"));
	}

	// SAFETY: kill(2) has no memory-safety preconditions; a negative pid targets the process group.
	let rc = unsafe { libc::kill(-pgid, signal) };
	if rc == 0 {
		return Ok(Delivery::Sent);
	}

	let err = io::Error::last_os_error();
	if err.raw_os_error() == Some(libc::ESRCH) { Ok(Delivery::AlreadyGone) } else { Err(err) }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<Delivery> {
	let pid = pid.to_string();
	let mut args = vec!["/PID", pid.as_str(), "/T"];
	if force {
		args.push("/F");
	}

	let output = std::process::Command::new("taskkill").args(&args).output()?;
	if output.status.success() {
		return Ok(Delivery::Sent);
	}

	// taskkill exits with 128 when the process no longer exists.
	if output.status.code() == Some(128) {
		return Ok(Delivery::AlreadyGone);
	}
	Err(io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()))
}
