use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` wins over the defaults; the ledger crate itself logs at `level` unless told
/// otherwise. Calling this twice is harmless, the second call is ignored.
pub fn init_tracing(level: tracing::Level) {
	let directive: Directive = format!("federation_ledger={}", level)
		.parse()
		.unwrap_or_else(|_| tracing::Level::INFO.into());

	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::from_default_env()
				.add_directive(directive)
				.add_directive(tracing::Level::WARN.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.try_init();
}
