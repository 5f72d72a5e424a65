//! Session configuration and project detection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host every backend and forwarding target binds to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

pub const DEFAULT_DOMAIN: &str = "localhost";

/// Preferred HTTPS port when clean URLs are unavailable.
pub const FALLBACK_HTTPS_PORT: u16 = 8443;

pub const PRIVILEGED_HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
	Vite,
	React,
	Next,
	Node,
	Go,
	Rust,
	Python,
	Java,
	Dotnet,
	Unknown,
}

impl ProjectType {
	/// Inspects marker files in `dir`, most specific framework first.
	pub fn detect(dir: &Path) -> Self {
		let has = |name: &str| dir.join(name).is_file();

		if has("next.config.js") || has("next.config.ts") {
			return ProjectType::Next;
		}
		if ["vite.config.ts", "vite.config.js", "vite.config.mjs"].iter().any(|f| has(f)) {
			return ProjectType::Vite;
		}
		if has("package.json") {
			return if is_react_package(&dir.join("package.json")) {
				ProjectType::React
			} else {
				ProjectType::Node
			};
		}
		if has("go.mod") || has("main.go") {
			return ProjectType::Go;
		}
		if has("Cargo.toml") {
			return ProjectType::Rust;
		}
		if ["requirements.txt", "pyproject.toml", "app.py", "main.py"].iter().any(|f| has(f)) {
			return ProjectType::Python;
		}
		if has("pom.xml") || has("build.gradle") {
			return ProjectType::Java;
		}

		let dotnet = std::fs::read_dir(dir).into_iter().flatten().flatten().any(|entry| {
			entry
				.path()
				.extension()
				.and_then(|ext| ext.to_str())
				.is_some_and(|ext| matches!(ext, "csproj" | "sln" | "fsproj"))
		});
		if dotnet { ProjectType::Dotnet } else { ProjectType::Unknown }
	}

	/// Command used when none is configured; empty for [`ProjectType::Unknown`].
	pub fn default_command(self) -> &'static str {
		match self {
			ProjectType::Vite | ProjectType::Next | ProjectType::Node => "npm run dev",
			ProjectType::React => "npm start",
			ProjectType::Go => "go run .",
			ProjectType::Rust => "cargo run",
			ProjectType::Python => "python app.py",
			ProjectType::Java => "mvn spring-boot:run",
			ProjectType::Dotnet => "dotnet run",
			ProjectType::Unknown => "",
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ProjectType::Vite => "vite",
			ProjectType::React => "react",
			ProjectType::Next => "next",
			ProjectType::Node => "node",
			ProjectType::Go => "go",
			ProjectType::Rust => "rust",
			ProjectType::Python => "python",
			ProjectType::Java => "java",
			ProjectType::Dotnet => "dotnet",
			ProjectType::Unknown => "unknown",
		}
	}
}

impl fmt::Display for ProjectType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ProjectType {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let parsed = match s.trim().to_ascii_lowercase().as_str() {
			"vite" => ProjectType::Vite,
			"react" => ProjectType::React,
			"next" | "nextjs" => ProjectType::Next,
			"node" => ProjectType::Node,
			"go" => ProjectType::Go,
			"rust" => ProjectType::Rust,
			"python" => ProjectType::Python,
			"java" => ProjectType::Java,
			"dotnet" | ".net" => ProjectType::Dotnet,
			other => return Err(Error::Validation(format!("unknown project type '{other}'"))),
		};
		Ok(parsed)
	}
}

fn is_react_package(path: &Path) -> bool {
	let Ok(raw) = std::fs::read_to_string(path) else {
		return false;
	};
	let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&raw) else {
		return false;
	};
	let depends_on = |name: &str| {
		["dependencies", "devDependencies"]
			.iter()
			.any(|section| manifest.get(section).and_then(|deps| deps.get(name)).is_some())
	};
	depends_on("react") && !depends_on("next")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
	pub https: bool,
	pub dns: bool,
	pub proxy: bool,
	/// Try the privileged HTTPS port for URLs without a port suffix.
	pub prefer_privileged_port: bool,
}

impl Default for FeatureFlags {
	fn default() -> Self {
		Self {
			https: true,
			dns: true,
			proxy: true,
			prefer_privileged_port: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
	/// Upper bound for each setup pipeline step.
	pub step: Duration,
	pub backend_ready: Duration,
	pub proxy_ready: Duration,
	pub proxy_shutdown: Duration,
	/// Wait between the graceful and the forced stop of the child.
	pub process_grace: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			step: Duration::from_secs(30),
			backend_ready: Duration::from_secs(30),
			proxy_ready: Duration::from_secs(10),
			proxy_shutdown: Duration::from_secs(5),
			process_grace: Duration::from_secs(10),
		}
	}
}

/// Everything a session needs. Port and certificate fields are filled in by the setup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
	pub project_type: ProjectType,
	pub project_dir: PathBuf,
	pub project_name: String,
	pub command: String,
	pub domain: String,
	/// Backend port; 0 until allocated.
	pub http_port: u16,
	/// Public proxy port; 0 until allocated.
	pub https_port: u16,
	pub flags: FeatureFlags,
	pub data_dir: PathBuf,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	pub timeouts: Timeouts,
}

impl SessionConfig {
	pub fn builder(project_dir: impl Into<PathBuf>) -> SessionConfigBuilder {
		SessionConfigBuilder::new(project_dir.into())
	}

	pub fn validate(&self) -> Result<()> {
		if self.command.trim().is_empty() {
			return Err(match self.project_type {
				ProjectType::Unknown => Error::Validation(format!(
					"could not detect a project type in {}; pass a command explicitly",
					self.project_dir.display()
				)),
				_ => Error::Validation("development command is required".into()),
			});
		}
		if self.domain.is_empty() || self.domain.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
			return Err(Error::Validation(format!("invalid domain '{}'", self.domain)));
		}
		Ok(())
	}

	pub fn is_localhost(&self) -> bool {
		self.domain == DEFAULT_DOMAIN
	}

	/// `true` when the public port is the privileged HTTPS port.
	pub fn clean_urls(&self) -> bool {
		self.https_port == PRIVILEGED_HTTPS_PORT
	}

	pub fn cert_dir(&self) -> PathBuf {
		self.data_dir.join("certs")
	}

	/// Directories created by the validation step.
	pub fn data_subdirs(&self) -> [PathBuf; 3] {
		[self.cert_dir(), self.data_dir.join("logs"), self.data_dir.join("config")]
	}

	/// URL users open in the browser.
	pub fn public_url(&self) -> String {
		let (scheme, default_port) = if self.flags.https { ("https", 443) } else { ("http", 80) };
		let port = if self.flags.proxy { self.https_port } else { self.http_port };
		if port == default_port || port == 0 {
			format!("{scheme}://{}", self.domain)
		} else {
			format!("{scheme}://{}:{port}", self.domain)
		}
	}

	/// Variables layered over the inherited environment of the child.
	pub fn child_env(&self) -> Vec<(String, String)> {
		let mut env = vec![
			("NSM_ENABLED".to_string(), "true".to_string()),
			("NSM_VERSION".to_string(), crate::VERSION.to_string()),
			("NSM_PROJECT_TYPE".to_string(), self.project_type.to_string()),
			("NSM_PROJECT_NAME".to_string(), self.project_name.clone()),
			("NSM_DOMAIN".to_string(), self.domain.clone()),
			("NSM_DATA_DIR".to_string(), self.data_dir.display().to_string()),
			("NSM_HTTP_PORT".to_string(), self.http_port.to_string()),
			("NSM_HTTPS_PORT".to_string(), self.https_port.to_string()),
			("PORT".to_string(), self.http_port.to_string()),
			("HOST".to_string(), LOOPBACK_HOST.to_string()),
		];

		if self.flags.https {
			env.push(("NSM_HTTPS_ENABLED".to_string(), "true".to_string()));
			if let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) {
				env.push(("NSM_CERT_PATH".to_string(), cert.display().to_string()));
				env.push(("NSM_KEY_PATH".to_string(), key.display().to_string()));
			}
		}
		if self.clean_urls() {
			env.push(("NSM_CLEAN_URLS".to_string(), "true".to_string()));
		}
		env
	}
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
	project_dir: PathBuf,
	project_type: Option<ProjectType>,
	command: Option<String>,
	domain: Option<String>,
	http_port: u16,
	https_port: u16,
	flags: FeatureFlags,
	data_dir: Option<PathBuf>,
	timeouts: Timeouts,
}

impl SessionConfigBuilder {
	fn new(project_dir: PathBuf) -> Self {
		Self {
			project_dir,
			project_type: None,
			command: None,
			domain: None,
			http_port: 0,
			https_port: 0,
			flags: FeatureFlags::default(),
			data_dir: None,
			timeouts: Timeouts::default(),
		}
	}

	pub fn project_type(mut self, project_type: ProjectType) -> Self {
		self.project_type = Some(project_type);
		self
	}

	pub fn command(mut self, command: impl Into<String>) -> Self {
		self.command = Some(command.into());
		self
	}

	pub fn domain(mut self, domain: impl Into<String>) -> Self {
		self.domain = Some(domain.into());
		self
	}

	pub fn http_port(mut self, port: u16) -> Self {
		self.http_port = port;
		self
	}

	pub fn https_port(mut self, port: u16) -> Self {
		self.https_port = port;
		self
	}

	pub fn flags(mut self, flags: FeatureFlags) -> Self {
		self.flags = flags;
		self
	}

	pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.data_dir = Some(dir.into());
		self
	}

	pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
		self.timeouts = timeouts;
		self
	}

	/// Resolves defaults and validates the result.
	pub fn build(self) -> Result<SessionConfig> {
		let project_dir = std::path::absolute(&self.project_dir)?;
		let project_name = project_name_for(&project_dir);
		let project_type = self.project_type.unwrap_or_else(|| ProjectType::detect(&project_dir));

		let command = match self.command.filter(|c| !c.trim().is_empty()) {
			Some(command) => command,
			None => project_type.default_command().to_string(),
		};

		let domain = match self.domain.map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase()) {
			Some(d) if !d.is_empty() => d,
			_ => DEFAULT_DOMAIN.to_string(),
		};

		let data_dir = match self.data_dir {
			Some(dir) => dir,
			None => default_data_dir(&project_name)?,
		};

		let config = SessionConfig {
			project_type,
			project_dir,
			project_name,
			command,
			domain,
			http_port: self.http_port,
			https_port: self.https_port,
			flags: self.flags,
			data_dir,
			cert_path: None,
			key_path: None,
			timeouts: self.timeouts,
		};
		config.validate()?;
		Ok(config)
	}
}

/// `~/.nsm/<project-name>`.
pub fn default_data_dir(project_name: &str) -> Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| Error::Validation("could not determine the home directory".into()))?;
	Ok(home.join(".nsm").join(project_name))
}

/// Directory base name, lowercased, spaces replaced by `-`.
pub fn project_name_for(dir: &Path) -> String {
	let base = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "project".to_string());
	base.replace(' ', "-").to_lowercase()
}
