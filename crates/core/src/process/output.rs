//! Line handling for the supervised process' stdout/stderr.

use std::sync::LazyLock;

use chrono::Local;
use nsm_protocol::LogSource;
use regex_lite::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::events::EventBus;

static IMPORTANT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)error|warn|local:|network:|ready in|compiled|running at|listening on|server started")
		.expect("IMPORTANT_LINE_RE should compile")
});

/// Dev-server lines worth highlighting: errors, warnings, readiness banners.
pub fn is_important(line: &str) -> bool {
	IMPORTANT_LINE_RE.is_match(line)
}

/// Prefixes important lines with a `[HH:MM:SS]` wall-clock stamp.
pub fn annotate(line: &str) -> String {
	if is_important(line) {
		format!("[{}] {line}", Local::now().format("%H:%M:%S"))
	} else {
		line.to_string()
	}
}

/// Forwards every line of `reader` to `events` until EOF.
///
/// Lines are split on raw `\n` bytes and decoded lossily, so invalid UTF-8
/// never stops the stream (and never leaves the child writing to a closed pipe).
pub(crate) async fn stream_lines<R>(reader: R, source: LogSource, events: EventBus)
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::with_capacity(256);
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(trim_line_ending(&buf));
				debug!(target = "nsm.process", %source, line = %line, "child output");
				events.log(source, annotate(&line));
			}
			Err(err) => {
				warn!(target = "nsm.process", %source, error = %err, "failed reading child output");
				break;
			}
		}
	}
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
	let line = line.strip_suffix(b"\n").unwrap_or(line);
	line.strip_suffix(b"\r").unwrap_or(line)
}
