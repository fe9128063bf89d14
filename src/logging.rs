use tracing_subscriber::EnvFilter;

/// Filter directive used when `RUST_LOG` is not set.
fn default_directive(quiet: bool, level: &str) -> String {
    if quiet {
        "off".to_string()
    } else {
        level.to_string()
    }
}

/// Install the global subscriber: timestamped lines on stderr.
/// `quiet` wins over both `RUST_LOG` and `level`.
pub fn init(quiet: bool, level: &str) {
    let directive = default_directive(quiet, level);
    let filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
