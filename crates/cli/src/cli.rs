use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nsm::{FeatureFlags, ProjectType, SessionConfig};

use crate::styles::cli_styles;

#[derive(Parser, Debug)]
#[command(name = "nsm")]
#[command(about = "Run a local project behind an HTTPS URL with a custom domain")]
#[command(version)]
#[command(styles = cli_styles())]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
	/// Increase verbosity (-v debug, -vv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(flatten)]
	pub run: RunArgs,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

/// Starting a session (the default when no subcommand is given).
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
	/// Project directory
	#[arg(short = 'C', long = "dir", default_value = ".")]
	pub dir: PathBuf,

	/// Development command (defaults to the detected project type's command)
	#[arg(long = "command", env = "NSM_COMMAND", value_name = "CMD")]
	pub dev_command: Option<String>,

	/// Domain to serve on; empty means localhost
	#[arg(short, long, env = "NSM_DOMAIN")]
	pub domain: Option<String>,

	/// Backend port handed to the command (0 picks a free one)
	#[arg(long, env = "NSM_HTTP_PORT", default_value_t = 0)]
	pub http_port: u16,

	/// Public proxy port (0 prefers 443, then ports near 8443)
	#[arg(long, env = "NSM_HTTPS_PORT", default_value_t = 0)]
	pub https_port: u16,

	/// Override project type detection
	#[arg(short = 't', long = "type", value_name = "TYPE")]
	pub project_type: Option<ProjectType>,

	/// Serve plain HTTP instead of HTTPS
	#[arg(long)]
	pub no_https: bool,

	/// Skip domain resolution setup
	#[arg(long)]
	pub no_dns: bool,

	/// Run the command without the reverse proxy
	#[arg(long)]
	pub no_proxy: bool,

	/// Do not try port 443 for clean URLs
	#[arg(long)]
	pub no_clean_urls: bool,

	/// Session data directory (defaults to ~/.nsm/<project>)
	#[arg(long, value_name = "DIR")]
	pub data_dir: Option<PathBuf>,
}

impl RunArgs {
	pub fn flags(&self) -> FeatureFlags {
		FeatureFlags {
			https: !self.no_https,
			dns: !self.no_dns,
			proxy: !self.no_proxy,
			prefer_privileged_port: !self.no_clean_urls,
		}
	}

	pub fn to_config(&self) -> nsm::Result<SessionConfig> {
		let mut builder = SessionConfig::builder(&self.dir)
			.http_port(self.http_port)
			.https_port(self.https_port)
			.flags(self.flags());
		if let Some(project_type) = self.project_type {
			builder = builder.project_type(project_type);
		}
		if let Some(command) = &self.dev_command {
			builder = builder.command(command);
		}
		if let Some(domain) = &self.domain {
			builder = builder.domain(domain);
		}
		if let Some(dir) = &self.data_dir {
			builder = builder.data_dir(dir);
		}
		builder.build()
	}
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Inspect and maintain the certificate store
	Certs {
		#[command(subcommand)]
		action: CertsAction,
	},
}

/// Where the certificate store lives.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
	/// Project directory whose store is used
	#[arg(short = 'C', long = "dir", default_value = ".")]
	pub dir: PathBuf,

	/// Session data directory (defaults to ~/.nsm/<project>)
	#[arg(long, value_name = "DIR")]
	pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum CertsAction {
	/// List stored certificates and whether they are still valid
	#[command(alias = "ls")]
	List {
		#[command(flatten)]
		store: StoreArgs,
		/// Print JSON instead of a table
		#[arg(long)]
		json: bool,
	},
	/// Remove expired or otherwise invalid certificates
	Clean {
		#[command(flatten)]
		store: StoreArgs,
	},
	/// Install the local certificate authority into the system trust stores
	Trust,
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn bare_invocation_runs_a_session() {
		let cli = Cli::try_parse_from(["nsm", "--domain", "shop.dev", "--no-dns", "--http-port", "5173"]).unwrap();
		assert!(cli.command.is_none());
		assert_eq!(cli.run.domain.as_deref(), Some("shop.dev"));
		assert_eq!(cli.run.http_port, 5173);
		let flags = cli.run.flags();
		assert!(flags.https && !flags.dns && flags.proxy);
	}

	#[test]
	fn project_type_parses_from_name() {
		let cli = Cli::try_parse_from(["nsm", "-t", "vite"]).unwrap();
		assert_eq!(cli.run.project_type, Some(ProjectType::Vite));
	}

	#[test]
	fn certs_subcommands_parse() {
		let cli = Cli::try_parse_from(["nsm", "certs", "ls", "--json"]).unwrap();
		assert!(matches!(cli.command, Some(Commands::Certs { action: CertsAction::List { json: true, .. } })));
		let cli = Cli::try_parse_from(["nsm", "certs", "trust"]).unwrap();
		assert!(matches!(cli.command, Some(Commands::Certs { action: CertsAction::Trust })));
	}

	#[test]
	fn explicit_command_builds_config() {
		let tmp = tempfile::TempDir::new().unwrap();
		let dir = tmp.path().to_str().unwrap();
		let data = tmp.path().join("data");
		let cli = Cli::try_parse_from(["nsm", "-C", dir, "--command", "python -m http.server", "--data-dir", data.to_str().unwrap()]).unwrap();
		let config = cli.run.to_config().unwrap();
		assert_eq!(config.command, "python -m http.server");
		assert_eq!(config.domain, "localhost");
		assert_eq!(config.data_dir, data);
	}
}
