use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "featured_sync=info,deviant_core=info,h2=warn,hyper=warn,reqwest=warn";

/// Installs the stderr subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
