use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,peek_lib=debug";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init() {
    let filter = std::env::var("PEEK_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_twice_is_harmless() {
        super::init();
        super::init();
        tracing::info!("logging initialised");
    }
}
