use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `-v` when set.
pub fn init_logging(verbosity: u8) {
	let filter = match std::env::var("RUST_LOG") {
		Ok(spec) if !spec.is_empty() => EnvFilter::try_new(&spec).unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity))),
		_ => EnvFilter::new(default_directives(verbosity)),
	};

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(verbosity > 0)
		.try_init();
}

fn default_directives(verbosity: u8) -> &'static str {
	match verbosity {
		0 => "warn,nsm=info",
		1 => "info,nsm=debug",
		_ => "debug,nsm=trace",
	}
}
