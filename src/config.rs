//! Typed runtime configuration: the subset of CLI-level knobs the runtime
//! core consumes. Flag parsing itself is an external collaborator's concern
//! (§1); this is just the place the parsed values land.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Runtime-core configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// The `__target` annotation backend used when a module doesn't request one (`--march`).
    pub default_backend: String,
    /// Wall-clock budget handed to the open-loop optimisation (`--open_loop_target`).
    #[cfg_attr(feature = "serde", serde(with = "duration_secs_f64"))]
    pub open_loop_target: Duration,
    /// Size of the compiler dispatcher's worker pool.
    pub worker_threads: usize,
    /// Sampling interval for the optional profiler (`--profile`); `None` disables it.
    #[cfg_attr(feature = "serde", serde(with = "option_duration_secs_f64"))]
    pub profile_interval: Option<Duration>,
    /// Disable backend inlining optimisations where a backend supports the flag.
    pub disable_inlining: bool,
    /// Enable structured logging at startup.
    pub enable_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_backend: "sw".to_string(),
            open_loop_target: Duration::from_millis(100),
            worker_threads: 4,
            profile_interval: None,
            disable_inlining: false,
            enable_log: true,
        }
    }
}

#[cfg(feature = "serde")]
mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?))
    }
}

#[cfg(feature = "serde")]
mod option_duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_source_defaults() {
        let config = Config::default();
        assert_eq!(config.default_backend, "sw");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.profile_interval, None);
    }
}
