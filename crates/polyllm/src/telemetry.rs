// polyllm/crates/polyllm/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Crate-level directives used when `RUST_LOG` is unset. The HTTP stack
/// stays at `warn` so health polling and hub downloads do not flood the log.
pub fn default_directives(debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!("{level},polyllm={level},hyper=warn,reqwest=warn,h2=warn")
}

/// Install the global subscriber. A subscriber that is already installed
/// (tests, embedding applications) is left in place.
pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let installed = fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(debug)
        .with_thread_names(debug)
        .compact()
        .try_init()
        .is_ok();
    if installed {
        let debug_enabled = debug;
        tracing::debug!("Tracing initialised (debug={})", debug_enabled);
    }
}
