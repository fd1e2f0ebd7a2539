use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than once is a no-op,
/// which lets tests and embedding applications call it freely.
pub fn init_logging(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_is_noop() {
        init_logging("debug", false);
        init_logging("info", true);
        tracing::info!(component = "logging", "Subscriber installed");
    }
}
