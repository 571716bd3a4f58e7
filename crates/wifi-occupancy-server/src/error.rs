//! Error types for the occupancy fusion server.
//!
//! Each failure domain has its own [`thiserror`] enum so that callers can
//! decide locally whether to recover:
//!
//! - [`ProtocolError`]: malformed or unroutable wire message (ack'd, session continues)
//! - [`DecodeError`] / [`InferenceError`]: detection pipeline failures (last count kept)
//! - [`EstimatorError`]: CSI estimation failures (last count kept)
//! - [`TransportError`]: socket-level failure (session terminates)
//! - [`PersistenceError`]: training log write failure (buffered, retried)
//! - [`PushError`]: backend push failure (logged, next tick retries)
//! - [`ConfigError`]: invalid configuration (start-up only)
//!
//! [`ServerError`] aggregates all of them.

use std::path::PathBuf;

use thiserror::Error;

/// A specialized `Result` type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Top-level error type for the server.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServerError {
    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Detection pipeline error
    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    /// CSI estimator error
    #[error("Estimator error: {0}")]
    Estimator(#[from] EstimatorError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Backend push error
    #[error("Push error: {0}")]
    Push(#[from] PushError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}


// ── Wire protocol ───────────────────────────────────────────────────────────

/// Malformed or unroutable device message.
///
/// The `Display` text is what the device receives in the error ack, so the
/// messages match the firmware's own wording where one exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Text frame was not valid JSON
    #[error("Invalid JSON payload")]
    InvalidJson {
        /// Parser detail, logged but not sent to the device
        detail: String,
    },

    /// JSON was valid but not an object
    #[error("JSON payload must be an object")]
    NotAnObject,

    /// `type` field named an unknown message kind
    #[error("Unsupported message type '{0}'")]
    UnknownType(String),

    /// Required field absent
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    /// Camera-control field was not a number
    #[error("Field '{0}' must be numeric")]
    NonNumericField(&'static str),

    /// Field present but unusable
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// No camera-control field recognised
    #[error("No supported camera fields in JSON payload")]
    NoSupportedFields,

    /// CSI `len` disagreed with the amplitude array
    #[error("Subcarrier count mismatch: len={declared}, amplitudes={actual}")]
    LengthMismatch {
        /// Value of the `len` field
        declared: usize,
        /// Actual amplitude count
        actual: usize,
    },

    /// CSI sample without amplitudes
    #[error("CSI sample has no amplitudes")]
    EmptyAmplitudes,

    /// CSI sample longer than the configured bound
    #[error("CSI sample has {actual} subcarriers (max {max})")]
    TooManySubcarriers {
        /// Actual amplitude count
        actual: usize,
        /// Configured maximum
        max: usize,
    },
}

impl ProtocolError {
    /// Creates a new invalid field error.
    #[must_use]
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

// ── Detection pipeline ──────────────────────────────────────────────────────

/// Frame bytes could not be decoded as an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to decode frame: {message}")]
pub struct DecodeError {
    /// Decoder message
    pub message: String,
}

impl DecodeError {
    /// Creates a new decode error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Model inference failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// Model could not be loaded
    #[error("Failed to load model from {path}: {message}")]
    ModelLoad {
        /// Model path
        path: PathBuf,
        /// Loader message
        message: String,
    },

    /// The model ran and reported an error
    #[error("Inference failed: {0}")]
    Model(String),

    /// Model output had an unexpected shape
    #[error("Unexpected model output shape {shape:?}")]
    OutputShape {
        /// Observed shape
        shape: Vec<i64>,
    },

    /// The worker running the inference panicked or was cancelled
    #[error("Inference worker '{pool}' failed: {message}")]
    Worker {
        /// Pool name
        pool: &'static str,
        /// Join error message
        message: String,
    },
}

impl InferenceError {
    /// Creates a new model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }
}

/// Failure anywhere in the frame → detection result path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// Image decode failure
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Detector failure
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Annotated frame could not be re-encoded
    #[error("Failed to encode annotated frame: {0}")]
    Encode(String),
}


// ── CSI estimator ───────────────────────────────────────────────────────────

/// CSI estimator failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    /// Trained model file could not be read or parsed
    #[error("Failed to load estimator model from {path}: {message}")]
    ModelLoad {
        /// Model path
        path: PathBuf,
        /// Loader message
        message: String,
    },

    /// Model was trained against a different feature layout
    #[error("Estimator model incompatible with feature layout: {0}")]
    Incompatible(String),

    /// Prediction was NaN or infinite
    #[error("Estimator produced a non-finite prediction ({0})")]
    NonFinite(f64),

    /// Worker failure
    #[error(transparent)]
    Inference(#[from] InferenceError),
}


// ── Transport ───────────────────────────────────────────────────────────────

/// Socket-level failure; terminates the session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer closed the connection
    #[error("Connection closed by device")]
    Closed,

    /// No message within the idle window
    #[error("No message received for {secs}s")]
    IdleTimeout {
        /// Idle window in seconds
        secs: u64,
    },

    /// Underlying socket error
    #[error("WebSocket error: {0}")]
    Socket(String),

    /// Outbound channel to the socket writer is gone
    #[error("Outbound channel closed")]
    OutboundClosed,
}


// ── Persistence ─────────────────────────────────────────────────────────────

/// Training log write failure.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// File system error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Log path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Record could not be serialized
    #[error("Failed to serialize training record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Creates a new I/O error for `path`.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ── Backend push ────────────────────────────────────────────────────────────

/// Backend push failure.
#[derive(Error, Debug)]
pub enum PushError {
    /// Request could not be sent
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("Backend returned status {0}")]
    Status(u16),
}


// ── Configuration ───────────────────────────────────────────────────────────

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field failed validation
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Why the value was rejected
        message: String,
    },

    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    FileRead {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Creates a new invalid value error.
    #[must_use]
    pub fn invalid_value(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}
