use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber. Later calls are ignored so tests can share it.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("invalid log filter {filter:?} ({err}); falling back to info");
        EnvFilter::new("info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}
