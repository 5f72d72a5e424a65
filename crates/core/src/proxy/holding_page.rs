//! Page served while the backend is not accepting connections yet.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Seconds between automatic reloads of the holding page.
pub const REFRESH_SECS: u32 = 2;

/// What the holding page tells the user about the session.
#[derive(Debug, Clone)]
pub struct HoldingPage {
	pub project_name: String,
	pub project_type: String,
	pub domain: String,
	pub target: String,
}

impl HoldingPage {
	pub fn render(&self) -> String {
		let name = escape(&self.project_name);
		let kind = escape(&self.project_type);
		let domain = escape(&self.domain);
		let target = escape(&self.target);

		format!(
			r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<meta http-equiv="refresh" content="{REFRESH_SECS}">
<title>NSM - Development Server Starting</title>
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', system-ui, sans-serif; margin: 0; min-height: 100vh;
	display: flex; align-items: center; justify-content: center; color: #374151;
	background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); }}
.card {{ background: #fff; border-radius: 16px; padding: 3rem; max-width: 600px; text-align: center;
	box-shadow: 0 20px 25px -5px rgba(0, 0, 0, 0.1); }}
.spinner {{ border: 3px solid #f3f3f6; border-top: 3px solid #7c3aed; border-radius: 50%; width: 40px; height: 40px;
	margin: 0 auto 1rem; animation: spin 1s linear infinite; }}
@keyframes spin {{ to {{ transform: rotate(360deg); }} }}
dl {{ display: grid; grid-template-columns: auto 1fr; gap: 0.5rem 1rem; text-align: left; }}
dt {{ font-weight: 600; }}
dd {{ margin: 0; color: #6b7280; font-family: 'SF Mono', Monaco, monospace; }}
.note {{ background: #eff6ff; border: 1px solid #dbeafe; border-radius: 8px; padding: 1rem; color: #1e40af; }}
</style>
</head>
<body>
<div class="card">
<h1>NSM Development Environment</h1>
<p>Your development server is starting up...</p>
<div class="spinner"></div>
<p><strong>Starting {name} project</strong></p>
<p>Target: <code>{target}</code></p>
<dl>
<dt>Project:</dt><dd>{name}</dd>
<dt>Type:</dt><dd>{kind}</dd>
<dt>Domain:</dt><dd>{domain}</dd>
</dl>
<p class="note"><strong>This usually takes 10-30 seconds.</strong><br>The page refreshes automatically once your server is ready.</p>
</div>
<script>setTimeout(() => location.reload(), {REFRESH_SECS}000);</script>
</body>
</html>
"#
		)
	}
}

impl IntoResponse for &HoldingPage {
	fn into_response(self) -> Response {
		(
			StatusCode::BAD_GATEWAY,
			[(header::CONTENT_TYPE, "text/html; charset=utf-8"), (header::CACHE_CONTROL, "no-store")],
			self.render(),
		)
			.into_response()
	}
}

fn escape(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for c in raw.chars() {
		match c {
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'&' => out.push_str("&amp;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#39;"),
			c => out.push(c),
		}
	}
	out
}
