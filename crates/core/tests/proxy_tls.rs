mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, Version};
use axum::routing::get;
use common::{insecure_client, write_pair};
use nsm::error::CertificateProblem;
use nsm::{Error, ProxyConfig, ReverseProxy};
use tempfile::TempDir;
use tokio::net::TcpListener;

async fn spawn_backend() -> u16 {
	let app = Router::new()
		.route("/proto", get(|headers: HeaderMap| async move { header_text(&headers, "x-forwarded-proto") }))
		.route("/host", get(|headers: HeaderMap| async move { header_text(&headers, "x-forwarded-host") }));
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
	port
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
	headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("").to_string()
}

fn https_config(tmp: &TempDir, backend_port: u16) -> ProxyConfig {
	let cert = tmp.path().join("localhost.pem");
	let key = tmp.path().join("localhost-key.pem");
	write_pair(&["localhost".to_string()], &cert, &key);
	ProxyConfig {
		backend_port,
		https: true,
		cert_path: Some(cert),
		key_path: Some(key),
		domain: "localhost".into(),
		project_name: "shop".into(),
		project_type: "vite".into(),
	}
}

#[tokio::test]
async fn https_requests_are_marked_as_such_upstream() {
	let tmp = TempDir::new().unwrap();
	let backend = spawn_backend().await;
	let mut proxy = ReverseProxy::new(https_config(&tmp, backend));
	let port = proxy.start(0).await.unwrap();

	let response = insecure_client().get(format!("https://localhost:{port}/proto")).send().await.unwrap();
	assert_eq!(response.status(), 200);
	assert_eq!(response.text().await.unwrap(), "https");

	proxy.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn forwarded_host_survives_http2() {
	let tmp = TempDir::new().unwrap();
	let backend = spawn_backend().await;
	let mut proxy = ReverseProxy::new(https_config(&tmp, backend));
	let port = proxy.start(0).await.unwrap();
	let url = format!("https://localhost:{port}/host");

	let h2 = reqwest::Client::builder()
		.danger_accept_invalid_certs(true)
		.http2_prior_knowledge()
		.build()
		.unwrap();
	let response = h2.get(&url).send().await.unwrap();
	assert_eq!(response.version(), Version::HTTP_2);
	assert_eq!(response.text().await.unwrap(), format!("localhost:{port}"));

	let h1 = reqwest::Client::builder().danger_accept_invalid_certs(true).http1_only().build().unwrap();
	let response = h1.get(&url).send().await.unwrap();
	assert_eq!(response.version(), Version::HTTP_11);
	assert_eq!(response.text().await.unwrap(), format!("localhost:{port}"));

	proxy.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn key_from_another_pair_is_rejected() {
	let tmp = TempDir::new().unwrap();
	let mut config = https_config(&tmp, 1);
	let other_cert = tmp.path().join("other.pem");
	let other_key = tmp.path().join("other-key.pem");
	write_pair(&["localhost".to_string()], &other_cert, &other_key);
	config.key_path = Some(other_key);

	let mut proxy = ReverseProxy::new(config);
	let err = proxy.start(0).await.unwrap_err();
	assert!(matches!(
		err,
		Error::CertificateInvalid {
			reason: CertificateProblem::KeyMismatch(_),
			..
		}
	));
	assert!(!proxy.is_running());
}
