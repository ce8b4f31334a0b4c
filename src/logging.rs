use log::LevelFilter;

/// Dependency targets that log every RPC round trip.
const QUIET_TARGETS: &[&str] = &["bitcoincore_rpc", "jsonrpc", "minreq"];

/// Build the logger: `level` by default, noisy dependencies clamped to
/// `warn`, and `RUST_LOG` applied on top of both.
pub fn builder(level: LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    for target in QUIET_TARGETS {
        builder.filter_module(target, LevelFilter::Warn.min(level));
    }
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder
}

/// Install the global logger. A second call is a no-op.
pub fn init(level: LevelFilter) {
    if builder(level).try_init().is_err() {
        log::debug!("logger already initialised");
    }
}
