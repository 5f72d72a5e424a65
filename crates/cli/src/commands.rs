use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use nsm::config::{default_data_dir, project_name_for};
use nsm::{CertificateProvider, Error, Mkcert, Session};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{CertsAction, Cli, Commands, RunArgs, StoreArgs};
use crate::render;

/// How long the renderer may keep flushing after the session is gone.
const RENDER_FLUSH: Duration = Duration::from_millis(500);

pub async fn dispatch(cli: Cli) -> Result<()> {
	match cli.command {
		None => run(cli.run).await,
		Some(Commands::Certs { action }) => certs(action).await,
	}
}

async fn run(args: RunArgs) -> Result<()> {
	let config = args.to_config()?;
	info!(
		target = "nsm",
		project = %config.project_name,
		project_type = %config.project_type,
		command = %config.command,
		"starting session"
	);

	let mut session = Session::new(config.clone());
	let renderer = tokio::spawn(render::render_events(session.subscribe(), config));

	let cancel = CancellationToken::new();
	tokio::spawn(cancel_on_signal(cancel.clone()));

	let result = session.run(cancel).await;
	drop(session);
	if tokio::time::timeout(RENDER_FLUSH, renderer).await.is_err() {
		debug!(target = "nsm", "renderer still running after shutdown");
	}

	match result {
		Ok(()) => Ok(()),
		Err(err @ Error::ShutdownPartialFailure(_)) => {
			warn!(target = "nsm", error = %err, "session stopped with teardown errors");
			Ok(())
		}
		Err(err) => Err(err.into()),
	}
}

/// Cancels on Ctrl-C, and on SIGTERM where it exists.
async fn cancel_on_signal(cancel: CancellationToken) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = term.recv() => {}
				}
			}
			Err(e) => {
				warn!(target = "nsm", error = %e, "SIGTERM handler unavailable");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
	println!();
	info!(target = "nsm", "shutting down");
	cancel.cancel();
}

async fn certs(action: CertsAction) -> Result<()> {
	match action {
		CertsAction::List { store, json } => {
			let provider = read_only_provider(&store)?;
			let certs = provider.list_certificates()?;
			if json {
				let entries: Vec<_> = certs
					.iter()
					.map(|c| {
						json!({
							"domain": c.domain,
							"cert_path": c.cert_path,
							"key_path": c.key_path,
							"valid": c.validity.is_ok(),
							"expires_soon": c.validity.as_ref().is_ok_and(|s| s.expires_soon),
							"not_after": c.not_after().map(|t| t.to_rfc3339()),
							"problem": c.validity.as_ref().err().map(ToString::to_string),
						})
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&entries)?);
				return Ok(());
			}

			if certs.is_empty() {
				println!("No certificates in {}", provider.store().display());
				return Ok(());
			}
			for cert in &certs {
				let status = match &cert.validity {
					Ok(s) if s.expires_soon => format!("expires {}", s.not_after.format("%Y-%m-%d")).yellow(),
					Ok(s) => format!("valid until {}", s.not_after.format("%Y-%m-%d")).green(),
					Err(problem) => problem.to_string().red(),
				};
				println!("{:<32} {status}", cert.domain);
			}
			Ok(())
		}
		CertsAction::Clean { store } => {
			let provider = read_only_provider(&store)?;
			let removed = provider.cleanup_expired()?;
			if removed.is_empty() {
				println!("No invalid certificates found");
			}
			for domain in removed {
				println!("Removed {domain}");
			}
			Ok(())
		}
		CertsAction::Trust => {
			let provider = CertificateProvider::with_mkcert(PathBuf::new())?;
			provider.install_trust_root().await?;
			let root = provider.trust_root_location().await?;
			println!("Local CA installed from {}", root.display());
			Ok(())
		}
	}
}

/// Provider for listing and cleaning, which never invoke the authority.
fn read_only_provider(store: &StoreArgs) -> Result<CertificateProvider> {
	let dir = std::path::absolute(&store.dir).with_context(|| format!("resolve {}", store.dir.display()))?;
	let data_dir = match &store.data_dir {
		Some(dir) => dir.clone(),
		None => default_data_dir(&project_name_for(&dir))?,
	};
	Ok(CertificateProvider::new(data_dir.join("certs"), Arc::new(Mkcert::with_binary("mkcert"))))
}
