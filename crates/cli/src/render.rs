//! Headless rendering of session events as terminal lines.

use colored::Colorize;
use nsm::SessionConfig;
use nsm_protocol::{LogSource, SessionEvent, StepStatus};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

/// Prints events until the channel closes.
pub async fn render_events(mut rx: Receiver<SessionEvent>, mut config: SessionConfig) {
	loop {
		match rx.recv().await {
			Ok(event) => {
				if let SessionEvent::ServerStarted { http_port, https_port } = &event {
					config.http_port = *http_port;
					config.https_port = *https_port;
				}
				println!("{}", format_event(&event, &config));
			}
			Err(RecvError::Lagged(skipped)) => println!("{}", format!("... {skipped} events skipped").dimmed()),
			Err(RecvError::Closed) => break,
		}
	}
}

/// Display text for one event.
pub fn format_event(event: &SessionEvent, config: &SessionConfig) -> String {
	match event {
		SessionEvent::StepUpdate { step, status, details } => {
			let marker = match status {
				StepStatus::Pending => "·".dimmed(),
				StepStatus::Loading => "…".cyan(),
				StepStatus::Success => "✓".green(),
				StepStatus::Error => "✗".red().bold(),
			};
			if *status == StepStatus::Loading {
				format!("{marker} {}", step.description())
			} else {
				format!("{marker} {}: {}", step.description(), details.dimmed())
			}
		}
		SessionEvent::SetupComplete => format!("{} Setup complete", "✓".green()),
		SessionEvent::Log { source, text } => match source {
			LogSource::Stdout => format!("{} {text}", "│".dimmed()),
			LogSource::Stderr => format!("{} {text}", "│".yellow()),
		},
		SessionEvent::ServerStarted { http_port, .. } => format!(
			"\n{} {}\n  backend: http://127.0.0.1:{http_port}\n",
			"➜".green().bold(),
			config.public_url().bold().underline()
		),
		SessionEvent::Warning { message } => format!("{} {message}", "!".yellow().bold()),
		SessionEvent::ProcessExited { code: Some(0) } => format!("{} development server exited", "■".dimmed()),
		SessionEvent::ProcessExited { code: Some(code) } => format!("{} development server exited with code {code}", "■".red()),
		SessionEvent::ProcessExited { code: None } => format!("{} development server terminated by signal", "■".red()),
		SessionEvent::Fatal { message, hints } => {
			let mut out = format!("{} {message}", "✗".red().bold());
			for hint in hints {
				out.push_str(&format!("\n  → {hint}"));
			}
			out
		}
	}
}
