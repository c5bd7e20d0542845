//! Structured-logging setup. Scheduler steps, JIT swaps, proxy handshakes,
//! and interrupt drains emit `tracing` events at `debug`/`trace`; `Fatal`
//! errors are logged at `error` before the process unwinds.

use std::sync::Once;

use crate::config::Config;

static INIT: Once = Once::new();

/// Install a global `tracing_subscriber::fmt` subscriber, honoring
/// `config.enable_log`. Safe to call more than once (including from
/// multiple tests in the same process): only the first call takes effect.
/// Also safe if some other global logger (e.g. a test harness's) won the
/// race to install first — `try_init` reports that as an error, which this
/// function swallows rather than panics on.
pub fn init(config: &Config) {
    if !config.enable_log {
        return;
    }
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(&Config::default());
        init(&Config::default());
    }

    #[test]
    fn disabled_logging_does_not_install_a_subscriber() {
        init(&Config {
            enable_log: false,
            ..Config::default()
        });
    }
}
