use clap::Parser;
use nsm_cli::cli::Cli;
use nsm_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli).await {
		error!(target = "nsm", error = %err, "command failed");
		eprintln!("{err:#}");
		std::process::exit(1);
	}
}
