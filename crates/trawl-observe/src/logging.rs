use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TRAWL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for trawl daemons:
/// - Always include `client_id` when a request carries one.
/// - Include `identity` and `work_item` on any lease/assignment event.
/// - Include `sequence` on completion and invalidation events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TRAWL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
