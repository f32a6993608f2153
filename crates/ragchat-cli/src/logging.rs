use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use ragchat_core::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over everything else.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config, verbose)));

    let to_stdout = config.is_some_and(|c| c.output == "stdout");
    let writer = if to_stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    if config.is_some_and(|c| c.format == "json") {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

/// Base level (`--verbose`, then config, then `info`) followed by per-crate filters.
fn filter_directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug".to_string()
    } else {
        config
            .and_then(|c| c.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let mut directives = vec![level];
    if let Some(c) = config {
        directives.extend(c.filters.iter().cloned());
    }
    directives.join(",")
}
