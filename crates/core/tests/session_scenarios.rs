//! End-to-end session behavior against real sockets and `/bin/sh` children.
#![cfg(unix)]

mod common;

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{InProcessAuthority, config, drain, flags, insecure_client, wait_for};
use nsm::config::FALLBACK_HTTPS_PORT;
use nsm::dns::DnsmasqBackend;
use nsm::ports::NEAR_SEARCH_RADIUS;
use nsm::{Error, FeatureFlags, ResolverBackend, Result, Session, SessionEvent, SessionState, StepName, StepStatus};
use tempfile::TempDir;

const IDLE: &str = "sh -c 'sleep 30'";

#[derive(Default)]
struct RecordingBackend {
	configured: AtomicUsize,
	fail_cleanup: bool,
}

#[async_trait]
impl ResolverBackend for RecordingBackend {
	fn name(&self) -> &'static str {
		"recording"
	}

	async fn configure(&self, _domain: &str, _tld: &str) -> Result<()> {
		self.configured.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn unconfigure(&self, domain: &str) -> Result<()> {
		if self.fail_cleanup {
			return Err(Error::DomainConfigurationFailed(format!("permission denied removing {domain}")));
		}
		Ok(())
	}
}

#[tokio::test]
async fn localhost_https_session_serves_holding_page() {
	let tmp = TempDir::new().unwrap();
	let authority = Arc::new(InProcessAuthority::default());
	let mut session = Session::new(config(&tmp, IDLE, "", flags(true, true, true))).with_certificate_authority(authority.clone());
	let mut rx = session.subscribe();

	session.start().await.unwrap();
	assert_eq!(session.state(), SessionState::Running);

	let cfg = session.config().clone();
	assert_ne!(cfg.http_port, 0);
	assert_ne!(cfg.https_port, 0);
	assert_ne!(cfg.http_port, cfg.https_port);
	assert!(cfg.cert_path.as_ref().unwrap().ends_with("certs/localhost.pem"));
	assert_eq!(authority.mint_count(), 1);

	let events = drain(&mut rx);
	assert!(events.contains(&SessionEvent::step(StepName::Dns, StepStatus::Success, "Skipped")));
	assert!(events.contains(&SessionEvent::ServerStarted {
		http_port: cfg.http_port,
		https_port: cfg.https_port,
	}));

	let response = insecure_client().get(format!("https://localhost:{}/", cfg.https_port)).send().await.unwrap();
	assert_eq!(response.status(), 502);
	let body = response.text().await.unwrap();
	assert!(body.contains("Starting shop project"));

	session.shutdown().await.unwrap();
	assert_eq!(session.state(), SessionState::Stopped);
	assert!(session.ports().reserved().is_empty());
}

#[tokio::test]
async fn busy_http_port_fails_before_certificates_or_dns() {
	let tmp = TempDir::new().unwrap();
	let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	let port = busy.local_addr().unwrap().port();

	let mut cfg = config(&tmp, IDLE, "shop.test", flags(true, true, true));
	cfg.http_port = port;
	let authority = Arc::new(InProcessAuthority::default());
	let backend = Arc::new(RecordingBackend::default());
	let mut session = Session::new(cfg)
		.with_certificate_authority(authority.clone())
		.with_resolver_backend(backend.clone());
	let mut rx = session.subscribe();

	let err = session.start().await.unwrap_err();
	assert_eq!(err.step(), Some(StepName::Ports));
	match &err {
		Error::StepFailed { source, .. } => assert!(matches!(**source, Error::PortUnavailable(p) if p == port)),
		other => panic!("unexpected error {other:?}"),
	}
	assert_eq!(session.state(), SessionState::Failed);

	assert_eq!(authority.mint_count(), 0);
	assert_eq!(backend.configured.load(Ordering::SeqCst), 0);
	let events = drain(&mut rx);
	assert!(!events.iter().any(|e| matches!(e, SessionEvent::StepUpdate { step: StepName::Certs | StepName::Dns, .. })));
	assert!(events.contains(&SessionEvent::step(StepName::Ports, StepStatus::Error, err.to_string())));

	session.shutdown().await.unwrap();
	assert!(!session.status().process_running);
}

#[tokio::test]
async fn missing_dns_forwarder_only_warns() {
	if which::which("dnsmasq").is_ok() {
		return;
	}
	let tmp = TempDir::new().unwrap();
	let backend = DnsmasqBackend::new(tmp.path().join("dnsmasq.conf"), tmp.path().join("dnsmasq.hosts")).require_binary();
	let mut session = Session::new(config(&tmp, IDLE, "shop.test", flags(false, true, true))).with_resolver_backend(Arc::new(backend));
	let mut rx = session.subscribe();

	session.start().await.unwrap();
	assert_eq!(session.state(), SessionState::Running);

	let events = drain(&mut rx);
	assert!(events.iter().any(|e| matches!(e, SessionEvent::Warning { message } if message.contains("dnsmasq not installed"))));
	assert!(events.iter().any(|e| matches!(
		e,
		SessionEvent::StepUpdate { step: StepName::Dns, status: StepStatus::Success, details } if details.starts_with("Degraded")
	)));
	assert!(!session.status().dns_configured);

	session.shutdown().await.unwrap();
}

#[tokio::test]
async fn crashing_command_reports_exit_and_keeps_holding_page() {
	let tmp = TempDir::new().unwrap();
	let mut session = Session::new(config(&tmp, "sh -c 'echo booting; exit 7'", "", flags(false, false, true)));
	let mut rx = session.subscribe();

	session.start().await.unwrap();
	let exited = wait_for(&mut rx, Duration::from_secs(5), |e| matches!(e, SessionEvent::ProcessExited { .. })).await;
	assert_eq!(exited, Some(SessionEvent::ProcessExited { code: Some(7) }));

	let https_port = session.config().https_port;
	let response = reqwest::get(format!("http://127.0.0.1:{https_port}/dashboard")).await.unwrap();
	assert_eq!(response.status(), 502);
	assert!(response.text().await.unwrap().contains("Starting shop project"));
	assert!(!session.status().process_running);

	session.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_runs_every_step_and_aggregates_failures() {
	let tmp = TempDir::new().unwrap();
	let backend = Arc::new(RecordingBackend {
		fail_cleanup: true,
		..RecordingBackend::default()
	});
	let mut session = Session::new(config(&tmp, IDLE, "shop.test", flags(false, true, true))).with_resolver_backend(backend.clone());
	session.start().await.unwrap();
	assert!(session.status().dns_configured);

	// A directory where the descriptor file was makes its removal fail too.
	let descriptor = session.config().project_dir.join(nsm_protocol::PORT_DESCRIPTOR_FILE);
	std::fs::remove_file(&descriptor).unwrap();
	std::fs::create_dir(&descriptor).unwrap();

	let https_port = session.config().https_port;
	let err = session.shutdown().await.unwrap_err();
	let Error::ShutdownPartialFailure(failures) = &err else {
		panic!("unexpected error {err:?}");
	};
	assert_eq!(failures.len(), 2);
	assert!(failures[0].starts_with("cleanup DNS: "));
	assert!(failures[1].starts_with("remove port descriptor"));
	assert!(!err.is_fatal());

	assert_eq!(session.state(), SessionState::Stopped);
	assert!(!session.status().process_running);
	assert!(session.ports().reserved().is_empty());
	assert!(TcpListener::bind((Ipv4Addr::UNSPECIFIED, https_port)).is_ok());
}

/// Both automatic public-port paths search around 8443, so they share one test.
#[tokio::test]
async fn automatic_public_port_lands_near_8443() {
	// Held when bindable, so 443 is unavailable even for root.
	let _held_443 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 443)).ok();
	let tmp = TempDir::new().unwrap();

	let mut cfg = config(&tmp, IDLE, "", FeatureFlags {
		prefer_privileged_port: true,
		..flags(false, false, true)
	});
	cfg.https_port = 0;
	let mut session = Session::new(cfg);
	let mut rx = session.subscribe();
	session.start().await.unwrap();

	let port = session.config().https_port;
	assert!(port.abs_diff(FALLBACK_HTTPS_PORT) <= NEAR_SEARCH_RADIUS, "got {port}");
	assert!(!session.config().clean_urls());
	let events = drain(&mut rx);
	assert!(events.iter().any(|e| matches!(
		e,
		SessionEvent::Warning { message } if message.starts_with("Port 443 ") && message.ends_with(&format!(":{port}"))
	)));
	session.shutdown().await.unwrap();

	let mut cfg = config(&tmp, IDLE, "", flags(false, false, true));
	cfg.https_port = 0;
	let mut session = Session::new(cfg);
	let mut rx = session.subscribe();
	session.start().await.unwrap();

	let port = session.config().https_port;
	assert!(port.abs_diff(FALLBACK_HTTPS_PORT) <= NEAR_SEARCH_RADIUS, "got {port}");
	assert!(!drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::Warning { message } if message.starts_with("Port 443 "))));
	session.shutdown().await.unwrap();
}
