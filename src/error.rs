//! Error types used by the appvisor runtime.
//!
//! This module defines the error enums of the crate:
//!
//! - [`ErrorCode`]: the shutdown/admission taxonomy carried by slaves, channels and
//!   client streams (also sent over the wire as a numeric code + message).
//! - [`NodeError`]: errors raised by the control-plane surface ([`Node`](crate::Node)).
//! - [`ConfigError`]: manifest/profile parsing and validation failures.
//! - [`RuntimeError`]: errors raised by the node runtime itself (shutdown grace).
//! - [`StreamError`]: failures reported by transport streams.
//!
//! All types provide helper methods (`as_label`, `as_message`) for logging/metrics.

use std::time::Duration;
use thiserror::Error;

/// # Error codes shared by the engine, slaves and channels.
///
/// Every slave shutdown carries one of these (or none for a clean exit), and every
/// client stream that is failed by the runtime receives one as a structured error.
///
/// ## Categories
/// - **Admission**: `QueueFull`, `DeadlineExpired`, `Timeout`, `InvalidAssignment`, `PoolFull`
/// - **Lifecycle timeouts**: `SpawnTimeout`, `ActivateTimeout`, `HeartbeatTimeout`,
///   `SealTimeout`, `TerminateTimeout`
/// - **IPC**: `ControlIpc`, `ClientDisconnected`
/// - **Voluntary**: `CommittedSuicide`, `SlaveIsSealing`, `OverseerShutdown`
/// - **Infrastructure**: `LocatorNotFound`, `EmptyLocatorEndpoints`, `Isolate`, `Auth`
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// The application queue has reached its limit.
    #[error("queue is full")]
    QueueFull,

    /// Spawning was attempted past the profile's pool limit.
    #[error("pool is full")]
    PoolFull,

    /// The invocation deadline passed while the load was still queued.
    #[error("invocation deadline has passed")]
    DeadlineExpired,

    /// The invocation deadline passed while the channel was open.
    #[error("invocation has timed out")]
    Timeout,

    /// A load tagged for a specific slave could not be delivered to it.
    #[error("failed to assign event to the tagged slave")]
    InvalidAssignment,

    /// The isolation backend did not report readiness in time.
    #[error("timed out while spawning")]
    SpawnTimeout,

    /// The worker did not complete its handshake in time.
    #[error("timed out while activating")]
    ActivateTimeout,

    /// No heartbeat arrived within the heartbeat timeout.
    #[error("timed out while waiting for heartbeat")]
    HeartbeatTimeout,

    /// Open channels did not drain within the seal timeout.
    #[error("timed out while sealing")]
    SealTimeout,

    /// The worker did not acknowledge termination in time.
    #[error("timed out while terminating")]
    TerminateTimeout,

    /// An operation was called on a state that does not accept it.
    #[error("invalid state - {state}")]
    InvalidState {
        /// Name of the state that rejected the operation.
        state: &'static str,
    },

    /// Control channel send/receive failure.
    #[error("unexpected control IPC error")]
    ControlIpc,

    /// The client side of a channel went away.
    #[error("client has been disconnected")]
    ClientDisconnected,

    /// The engine is shutting down.
    #[error("overseer is shutting down")]
    OverseerShutdown,

    /// The worker asked to be terminated.
    #[error("slave has committed suicide")]
    CommittedSuicide,

    /// The slave finished sealing and terminated voluntarily.
    #[error("slave is sealing")]
    SlaveIsSealing,

    /// The slave went away while the channel was still open.
    #[error("slave has been discarded")]
    SlaveDiscarded,

    /// A worker handshake did not match any registered slave.
    #[error("rejecting slave as unexpected")]
    UnexpectedSlave,

    /// No locator collaborator is configured.
    #[error("locator not found")]
    LocatorNotFound,

    /// The locator returned no endpoints.
    #[error("locator endpoints set is empty")]
    EmptyLocatorEndpoints,

    /// The isolation backend failed.
    #[error("isolate failure: {reason}")]
    Isolate {
        /// Backend-provided description.
        reason: String,
    },

    /// Obtaining an authentication token failed.
    #[error("authentication failure: {reason}")]
    Auth {
        /// Collaborator-provided description.
        reason: String,
    },

    /// The isolation backend reported an abnormal worker exit.
    #[error("worker terminated: [{code}] {message}")]
    Terminated {
        /// Exit code reported by the backend.
        code: i32,
        /// Backend-provided message.
        message: String,
    },
}

impl ErrorCode {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use appvisor::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::HeartbeatTimeout.as_label(), "heartbeat_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorCode::QueueFull => "queue_is_full",
            ErrorCode::PoolFull => "pool_is_full",
            ErrorCode::DeadlineExpired => "deadline_expired",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidAssignment => "invalid_assignment",
            ErrorCode::SpawnTimeout => "spawn_timeout",
            ErrorCode::ActivateTimeout => "activate_timeout",
            ErrorCode::HeartbeatTimeout => "heartbeat_timeout",
            ErrorCode::SealTimeout => "seal_timeout",
            ErrorCode::TerminateTimeout => "terminate_timeout",
            ErrorCode::InvalidState { .. } => "invalid_state",
            ErrorCode::ControlIpc => "control_ipc_error",
            ErrorCode::ClientDisconnected => "client_disconnected",
            ErrorCode::OverseerShutdown => "overseer_shutdown",
            ErrorCode::CommittedSuicide => "committed_suicide",
            ErrorCode::SlaveIsSealing => "slave_is_sealing",
            ErrorCode::SlaveDiscarded => "slave_discarded",
            ErrorCode::UnexpectedSlave => "unexpected_slave",
            ErrorCode::LocatorNotFound => "locator_not_found",
            ErrorCode::EmptyLocatorEndpoints => "empty_locator_endpoints",
            ErrorCode::Isolate { .. } => "isolate_error",
            ErrorCode::Auth { .. } => "auth_error",
            ErrorCode::Terminated { .. } => "abnormal_termination",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Stable numeric code used when the error crosses the wire.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::QueueFull => 1,
            ErrorCode::PoolFull => 2,
            ErrorCode::DeadlineExpired => 3,
            ErrorCode::Timeout => 4,
            ErrorCode::InvalidAssignment => 5,
            ErrorCode::SpawnTimeout => 10,
            ErrorCode::ActivateTimeout => 11,
            ErrorCode::HeartbeatTimeout => 12,
            ErrorCode::SealTimeout => 13,
            ErrorCode::TerminateTimeout => 14,
            ErrorCode::InvalidState { .. } => 20,
            ErrorCode::ControlIpc => 21,
            ErrorCode::ClientDisconnected => 22,
            ErrorCode::OverseerShutdown => 30,
            ErrorCode::CommittedSuicide => 31,
            ErrorCode::SlaveIsSealing => 32,
            ErrorCode::SlaveDiscarded => 33,
            ErrorCode::UnexpectedSlave => 34,
            ErrorCode::LocatorNotFound => 40,
            ErrorCode::EmptyLocatorEndpoints => 41,
            ErrorCode::Isolate { .. } => 42,
            ErrorCode::Auth { .. } => 43,
            ErrorCode::Terminated { .. } => 44,
        }
    }

    /// Indicates whether a slave shutdown with this code counts as a crash.
    ///
    /// Voluntary termination (`CommittedSuicide`, `SlaveIsSealing`) and engine
    /// shutdown do not feed the crash backoff.
    ///
    /// # Example
    /// ```
    /// use appvisor::ErrorCode;
    ///
    /// assert!(ErrorCode::SpawnTimeout.is_crash());
    /// assert!(!ErrorCode::SlaveIsSealing.is_crash());
    /// ```
    pub fn is_crash(&self) -> bool {
        !matches!(
            self,
            ErrorCode::CommittedSuicide | ErrorCode::SlaveIsSealing | ErrorCode::OverseerShutdown
        )
    }
}

/// # Errors produced by the control-plane surface.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NodeError {
    /// An application with this name is already running.
    #[error("app '{name}' is already started")]
    AlreadyStarted {
        /// Application name.
        name: String,
    },

    /// No application with this name is running.
    #[error("app '{name}' is not running")]
    NotRunning {
        /// Application name.
        name: String,
    },

    /// The application is still spooling and has no engine yet.
    #[error("app '{name}' is spooling")]
    Spooling {
        /// Application name.
        name: String,
    },

    /// Manifest or profile rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error raised by the application engine.
    #[error(transparent)]
    Engine(#[from] ErrorCode),

    /// The application's dedicated reactor thread could not be started.
    #[error("unable to start reactor: {0}")]
    Reactor(#[from] std::io::Error),
}

impl NodeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeError::AlreadyStarted { .. } => "node_already_started",
            NodeError::NotRunning { .. } => "node_not_running",
            NodeError::Spooling { .. } => "node_app_spooling",
            NodeError::Config(_) => "node_config",
            NodeError::Engine(code) => code.as_label(),
            NodeError::Reactor(_) => "node_reactor",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors produced while loading manifests and profiles.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Document could not be parsed.
    #[error("malformed {what}: {source}")]
    Malformed {
        /// Which document (`manifest` or `profile`).
        what: &'static str,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A value failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Malformed { .. } => "config_malformed",
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

/// # Errors produced by the node runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some slaves were still alive.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Slaves (`app/id`) that did not shut down in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use appvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck slaves={stuck:?}")
            }
        }
    }
}

/// # Errors reported by transport streams.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The stream was already closed.
    #[error("stream is closed")]
    Closed,

    /// The peer connection is gone.
    #[error("connection aborted: {reason}")]
    Aborted {
        /// Transport-provided description.
        reason: String,
    },
}
