//! # Per-application tunable policy.
//!
//! A [`Profile`] carries pool sizing, per-slave concurrency, the lifecycle
//! timeouts and the isolation backend selector. It is loaded from JSON with
//! kebab-case keys; durations are expressed in (fractional) seconds.
//!
//! ```json
//! {
//!   "pool-limit": 4,
//!   "queue-limit": 16,
//!   "heartbeat-timeout": 10.0,
//!   "isolate": { "type": "process", "args": {} }
//! }
//! ```
//!
//! ## Defaults
//! | key                 | default                                   |
//! |---------------------|-------------------------------------------|
//! | `spawn-timeout`     | 1.0s                                      |
//! | `handshake-timeout` | 5.0s                                      |
//! | `heartbeat-timeout` | 30.0s                                     |
//! | `seal-timeout`      | 60.0s                                     |
//! | `terminate-timeout` | 10.0s                                     |
//! | `request-timeout`   | 86400s                                    |
//! | `concurrency`       | 10                                        |
//! | `crashlog-limit`    | 50                                        |
//! | `pool-limit`        | 10                                        |
//! | `queue-limit`       | 100 (0 = pressure based)                  |
//! | `grow-threshold`    | `max(1, queue_limit / pool_limit / 2)`    |
//! | `log-output`        | false                                     |
//!
//! A running application may be re-profiled; slaves keep the copy they were
//! spawned with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stream::Headers;

/// Header carrying a per-invocation timeout override in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "request_timeout";

/// Isolation backend selector and its opaque arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsolateSpec {
    /// Backend type, looked up in the [`Context`](crate::Context) registry.
    #[serde(rename = "type")]
    pub kind: String,
    /// Backend-specific arguments.
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for IsolateSpec {
    fn default() -> Self {
        Self {
            kind: "process".to_string(),
            args: empty_args(),
        }
    }
}

/// Tunable policy of one application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Profile {
    /// Profile name (reported by `info`).
    pub name: String,

    /// Time allowed for the isolation backend to report readiness.
    #[serde(with = "secs")]
    pub spawn_timeout: Duration,
    /// Time allowed for the worker handshake after readiness.
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,
    /// Maximum gap between two heartbeats.
    #[serde(with = "secs")]
    pub heartbeat_timeout: Duration,
    /// Time allowed for open channels to drain once sealing.
    #[serde(with = "secs")]
    pub seal_timeout: Duration,
    /// Time allowed for the worker to acknowledge termination.
    #[serde(with = "secs")]
    pub terminate_timeout: Duration,
    /// Default invocation deadline, measured from the load's birthstamp.
    #[serde(with = "secs")]
    pub request_timeout: Duration,

    /// Maximum simultaneous channels per slave.
    pub concurrency: usize,
    /// Number of output lines kept for crash artifacts.
    pub crashlog_limit: usize,
    /// Maximum number of slaves.
    pub pool_limit: usize,
    /// Maximum number of queued loads (`0` = pressure based).
    pub queue_limit: usize,
    /// Queued loads per slave before growing (automatic policy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grow_threshold: Option<usize>,

    /// Isolation backend selector.
    pub isolate: IsolateSpec,
    /// Echo worker output to the log at debug level.
    pub log_output: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            spawn_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            seal_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(86_400),
            concurrency: 10,
            crashlog_limit: 50,
            pool_limit: 10,
            queue_limit: 100,
            grow_threshold: None,
            isolate: IsolateSpec::default(),
            log_output: false,
        }
    }
}

impl Profile {
    /// Parses and validates a JSON profile, naming it `name`.
    pub fn from_json(name: impl Into<String>, raw: &str) -> Result<Self, ConfigError> {
        let mut profile: Profile = serde_json::from_str(raw)
            .map_err(|source| ConfigError::Malformed { what: "profile", source })?;
        profile.name = name.into();
        profile.validate()?;
        Ok(profile)
    }

    /// Rejects profiles the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "heartbeat-timeout",
                reason: "must be positive",
            });
        }
        if self.pool_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "pool-limit",
                reason: "must be positive",
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "must be positive",
            });
        }
        if self.grow_threshold == Some(0) {
            return Err(ConfigError::Invalid {
                field: "grow-threshold",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Queued loads per slave before the automatic policy grows the pool.
    pub fn grow_threshold(&self) -> usize {
        match self.grow_threshold {
            Some(n) => n.max(1),
            None => (self.queue_limit / self.pool_limit.max(1) / 2).max(1),
        }
    }

    /// Invocation timeout: the `request_timeout` header (ms) if valid, else the default.
    pub fn request_timeout(&self, headers: &Headers) -> Duration {
        headers
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout)
    }
}

/// Durations as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let profile = Profile::from_json("default", "{}").expect("valid");
        assert_eq!(profile, Profile::default());
        assert_eq!(profile.grow_threshold(), 5);
        assert_eq!(profile.isolate.kind, "process");
    }

    #[test]
    fn test_kebab_case_keys_and_seconds() {
        let profile = Profile::from_json(
            "fast",
            r#"{"pool-limit":2,"queue-limit":0,"heartbeat-timeout":0.5,"log-output":true}"#,
        )
        .expect("valid");
        assert_eq!(profile.name, "fast");
        assert_eq!(profile.pool_limit, 2);
        assert_eq!(profile.queue_limit, 0);
        assert_eq!(profile.heartbeat_timeout, Duration::from_millis(500));
        assert!(profile.log_output);
        assert_eq!(profile.grow_threshold(), 1);
    }

    #[test]
    fn test_validation() {
        for raw in [
            r#"{"heartbeat-timeout":0}"#,
            r#"{"pool-limit":0}"#,
            r#"{"concurrency":0}"#,
            r#"{"grow-threshold":0}"#,
        ] {
            let err = Profile::from_json("bad", raw).unwrap_err();
            assert_eq!(err.as_label(), "config_invalid", "{raw}");
        }

        let err = Profile::from_json("bad", r#"{"spawn-timeout":-1}"#).unwrap_err();
        assert_eq!(err.as_label(), "config_malformed");
    }

    #[test]
    fn test_out_of_range_duration_is_rejected() {
        let err = Profile::from_json("huge", r#"{"request-timeout":1e300}"#).unwrap_err();
        assert_eq!(err.as_label(), "config_malformed");

        let err = Profile::from_json("negative", r#"{"seal-timeout":-1.0}"#).unwrap_err();
        assert_eq!(err.as_label(), "config_malformed");
    }

    #[test]
    fn test_request_timeout_header_override() {
        let profile = Profile::default();
        let headers = Headers::new().with(REQUEST_TIMEOUT_HEADER, "250");
        assert_eq!(profile.request_timeout(&headers), Duration::from_millis(250));

        let garbage = Headers::new().with(REQUEST_TIMEOUT_HEADER, "soon");
        assert_eq!(profile.request_timeout(&garbage), profile.request_timeout);
        assert_eq!(profile.request_timeout(&Headers::new()), profile.request_timeout);
    }

    #[test]
    fn test_round_trips_through_json() {
        let profile = Profile::default();
        let raw = serde_json::to_string(&profile).expect("serialize");
        assert!(raw.contains("\"spawn-timeout\":1.0"));
        let back: Profile = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, profile);
    }
}
