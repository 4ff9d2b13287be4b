use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// The stable taxonomy of error codes this crate ever surfaces.
///
/// Every [`CoreError`] carries exactly one of these, so that callers can
/// `match` on failure category instead of parsing error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Rejected at construction time (out-of-range config, no URLs, etc.).
    Configuration,
    /// `connect()` was called while the circuit breaker is open.
    CircuitBreakerOpen,
    /// An API call was made with no open connection or default channel.
    NotConnected,
    /// A transport-level failure occurred while (re)connecting.
    Connection,
    /// A connection attempt exceeded its configured timeout.
    ConnectionTimeout,
    /// Failure creating, acquiring, or using a channel.
    Channel,
    /// `acquire()` exceeded `pool.acquire_timeout`.
    ChannelAcquisitionTimeout,
    /// A publish's confirm callback reported a broker-side nack.
    Publish,
    /// A publish exceeded its armed timeout before being confirmed.
    PublishTimeout,
    /// Failure to register a consumer, or a delivery-pipeline error.
    Consume,
    /// Reconnect retries were exhausted.
    Reconnection,
    /// Every configured URL failed within a single connect cycle.
    Cluster,
}

impl ErrorCode {
    /// Renders this code as the stable string used in `details`/serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::NotConnected => "not_connected",
            Self::Connection => "connection",
            Self::ConnectionTimeout => "connection_timeout",
            Self::Channel => "channel",
            Self::ChannelAcquisitionTimeout => "channel_acquisition_timeout",
            Self::Publish => "publish",
            Self::PublishTimeout => "publish_timeout",
            Self::Consume => "consume",
            Self::Reconnection => "reconnection",
            Self::Cluster => "cluster",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error type surfaced by every public operation in this crate.
///
/// Carries a stable [`ErrorCode`], a human-readable message, and a `details`
/// map of operation context (queue name, exchange name, attempt count, URL,
/// etc.) so that consumers can both `match` on `code` and log/serialize the
/// rest.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct CoreError {
    code: ErrorCode,
    message: String,
    details: BTreeMap<String, String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// Creates a new error with the given code and message, with no details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Attaches a context key/value to this error's `details` map.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attaches an underlying cause to this error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Reports this error's stable code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Reports this error's human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Reports this error's context details.
    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    /// Produces a lightweight copy for distribution over the event bus,
    /// dropping any wrapped `source` (the original cause is for the error
    /// site's own logging, not for re-propagation to observers).
    pub fn to_event_copy(&self) -> CoreError {
        CoreError {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            source: None,
        }
    }
}

#[cfg(feature = "json")]
impl CoreError {
    /// Renders this error as a JSON value, for consumers that want to forward
    /// it verbatim across a process boundary.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "details": self.details,
        })
    }
}

/// Convenience alias used throughout this crate's public API.
pub type CoreResult<T> = Result<T, CoreError>;
