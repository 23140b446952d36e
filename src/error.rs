use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Fatal configuration problems, detected before any tile is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading input file {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid input file {path}: {source}")]
    ParseInput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("template `{template}` must contain each of {{z}}, {{x}} and {{y}} exactly once")]
    MissingPlaceholders { template: String },

    #[error("template `{template}` is not a valid format string: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("region `{region}` has an invalid centroid ({lat}, {lon})")]
    InvalidCentroid { region: String, lat: f64, lon: f64 },

    #[error("region `{region}` has an invalid radius of {radius_km} km")]
    InvalidRadius { region: String, radius_km: f64 },

    #[error("region `{region}` declares `{variant}` both region-wide and per subregion")]
    MixedSubregionLayout { region: String, variant: String },

    #[error("region `{0}` is declared more than once")]
    DuplicateRegion(String),

    #[error("zoom level {0} is out of range (0..=22)")]
    InvalidZoom(u8),

    #[error("missing storage setting `{0}`")]
    MissingStorageSetting(&'static str),

    #[error("invalid storage endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("failed reading storage config {path}: {reason}")]
    StorageConfigFile { path: PathBuf, reason: String },

    #[error("bucket `{bucket}` is not reachable: {reason}")]
    UnreachableBucket { bucket: String, reason: FailureReason },

    #[error("failed creating HTTP client: {0}")]
    HttpClient(String),

    #[error("no tiles to fetch: the template registry yielded no descriptors")]
    NothingToFetch,
}

/// Failures of the local tile tree and its sibling state files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed walking tile tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("background task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single tile fetch or object upload failed.
///
/// The variant names are the stable names written into reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind")]
pub enum FailureReason {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("HTTP status {code}")]
    HttpStatus { code: u16 },

    #[error("invalid image: {message}")]
    InvalidImage { message: String },

    #[error("disk error: {message}")]
    Disk { message: String },

    #[error("throttled by provider")]
    Throttled { retry_after_ms: Option<u64> },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FailureReason {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        FailureReason::Transport {
            message: err.to_string(),
        }
    }

    pub fn disk(err: impl std::fmt::Display) -> Self {
        FailureReason::Disk {
            message: err.to_string(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        FailureReason::Internal {
            message: err.to_string(),
        }
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        FailureReason::InvalidImage {
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy; 429 is throttling.
    pub fn from_status(code: u16, retry_after_ms: Option<u64>) -> Self {
        if code == 429 {
            FailureReason::Throttled { retry_after_ms }
        } else {
            FailureReason::HttpStatus { code }
        }
    }

    /// Stable taxonomy name.
    pub fn name(&self) -> &'static str {
        match self {
            FailureReason::Config { .. } => "Config",
            FailureReason::Transport { .. } => "Transport",
            FailureReason::HttpStatus { .. } => "HttpStatus",
            FailureReason::InvalidImage { .. } => "InvalidImage",
            FailureReason::Disk { .. } => "Disk",
            FailureReason::Throttled { .. } => "Throttled",
            FailureReason::Cancelled => "Cancelled",
            FailureReason::Internal { .. } => "Internal",
        }
    }

    /// Transport errors, 5xx and throttling are retried; everything else is final.
    pub fn is_retriable(&self) -> bool {
        match self {
            FailureReason::Transport { .. } | FailureReason::Throttled { .. } => true,
            FailureReason::HttpStatus { code } => *code >= 500,
            _ => false,
        }
    }

    /// Whether this failure says the remote side could not be reached at all.
    pub(crate) fn is_transport_like(&self) -> bool {
        match self {
            FailureReason::Transport { .. } | FailureReason::Throttled { .. } => true,
            FailureReason::HttpStatus { code } => *code >= 500,
            _ => false,
        }
    }
}

/// Errors that abort a whole run phase.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(FailureReason),

    #[error("run was cancelled")]
    Cancelled,
}

/// Process exit status of a run phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    ConfigError,
    PartialFailure,
    TransportFailure,
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ConfigError => 2,
            ExitStatus::PartialFailure => 3,
            ExitStatus::TransportFailure => 4,
            ExitStatus::Cancelled => 130,
        }
    }

    /// Exit status for a run that ended in a fatal error.
    pub fn from_error(err: &RunError) -> Self {
        match err {
            RunError::Config(_) => ExitStatus::ConfigError,
            // Disk errors are surfaced as configuration-class failures: the
            // environment, not the remote side, is at fault.
            RunError::Store(_) => ExitStatus::ConfigError,
            RunError::Transport(_) => ExitStatus::TransportFailure,
            RunError::Cancelled => ExitStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(FailureReason::HttpStatus { code: 503 }.is_retriable());
        assert!(!FailureReason::HttpStatus { code: 404 }.is_retriable());
        assert!(FailureReason::from_status(429, None).is_retriable());
        assert!(!FailureReason::invalid_image("tiny").is_retriable());
        assert!(!FailureReason::Cancelled.is_retriable());
    }

    #[test]
    fn serialized_with_stable_names() {
        let json = serde_json::to_value(FailureReason::HttpStatus { code: 503 }).unwrap();
        assert_eq!(json["kind"], "HttpStatus");
        assert_eq!(json["code"], 503);

        let json = serde_json::to_value(FailureReason::Cancelled).unwrap();
        assert_eq!(json["kind"], "Cancelled");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::ConfigError.code(), 2);
        assert_eq!(ExitStatus::PartialFailure.code(), 3);
        assert_eq!(ExitStatus::TransportFailure.code(), 4);
        assert_eq!(ExitStatus::Cancelled.code(), 130);
        assert_eq!(
            ExitStatus::from_error(&RunError::Config(ConfigError::NothingToFetch)),
            ExitStatus::ConfigError
        );
    }
}
