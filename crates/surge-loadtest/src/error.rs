//! Error types for the load driver

use thiserror::Error;

/// Result type alias for load driver operations
pub type Result<T> = std::result::Result<T, LoadTestError>;

/// Errors that can stop a run before or after the workload executes.
///
/// Failures of individual probed requests are never surfaced here: they are
/// outcomes, recorded into the metric sinks.
#[derive(Error, Debug)]
pub enum LoadTestError {
    // === Configuration ===
    /// Configuration file could not be read
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("Invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be rendered back to TOML
    #[error("Config serialization error: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    /// Configuration parsed but violates a constraint
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === HTTP ===
    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),

    /// Request failed before a response was received
    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    // === Reporting ===
    /// Summary could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Artifact could not be written
    #[error("Failed to write {path}: {source}")]
    ArtifactWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Prometheus encoding failed
    #[error("Metrics export error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A stage task panicked or was cancelled
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl LoadTestError {
    /// Errors caused by the operator's input rather than the environment
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigRead { .. }
                | Self::ConfigParse(_)
                | Self::ConfigRender(_)
                | Self::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoadTestError::Transport {
            url: "http://localhost/api/login".to_string(),
            message: "connection refused".to_string(),
        };

        let msg = format!("{}", err);
        assert!(msg.contains("Transport error"));
        assert!(msg.contains("/api/login"));
    }

    #[test]
    fn test_config_errors() {
        assert!(LoadTestError::InvalidConfig("empty".into()).is_config_error());
        assert!(!LoadTestError::Scheduler("boom".into()).is_config_error());
    }
}
