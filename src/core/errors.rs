use std::fmt;
use thiserror::Error;

use crate::topology::StageKind;

/// Unified error type for topology building, packaging and worker bootstrap
#[derive(Debug, Error)]
pub enum SquallError {
    /// A stage id was registered twice
    #[error("Configuration error: stage id '{id}' is already registered as a {existing}")]
    DuplicateId { id: String, existing: StageKind },

    /// Parallelism overrides that name no stage
    #[error("Configuration error: parallelism overrides name no stage: {}", .keys.join(","))]
    UnmatchedOverrides { keys: Vec<String> },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        /// The offending artifact (manifest line, config key, path)
        artifact: Option<String>,
    },

    /// A required resource resolved to zero files
    #[error("No files found matching: {pattern}")]
    ResourceNotFound {
        pattern: String,
        context: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed ({format}): {source}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Deploy-time environment provisioning errors
    #[error("Provisioning failed during {step}: {message}")]
    Provisioning {
        step: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The host cannot lock files; provisioning continues unsynchronized
    #[error("Locking unavailable for {lock_file}, provisioning without synchronization")]
    DegradedLock {
        lock_file: String,
        #[source]
        source: std::io::Error,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Archive format errors
    #[error("Archive operation failed: {operation}")]
    Archive {
        operation: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// Errors raised by a caller's topology definition
    #[error("Topology definition failed: {message}")]
    Definition {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A package build step failed
    #[error("Build step '{step}' failed: {source}")]
    Build {
        step: BuildStep,
        #[source]
        source: Box<SquallError>,
    },
}

/// Steps of the package build, named in build failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    CopyBaseArchive,
    Manifest,
    Metadata,
    Definition,
    StageResources,
    ParallelismOverrides,
    Serialize,
    Finish,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStep::CopyBaseArchive => "copy base archive",
            BuildStep::Manifest => "add manifest entries",
            BuildStep::Metadata => "add metadata",
            BuildStep::Definition => "run topology definition",
            BuildStep::StageResources => "add stage resources",
            BuildStep::ParallelismOverrides => "apply parallelism overrides",
            BuildStep::Serialize => "serialize topology",
            BuildStep::Finish => "finish archive",
        };
        f.write_str(name)
    }
}

impl SquallError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            artifact: None,
        }
    }

    /// Create a configuration error naming the offending artifact
    pub fn configuration_in<S: Into<String>, A: Into<String>>(message: S, artifact: A) -> Self {
        Self::Configuration {
            message: message.into(),
            artifact: Some(artifact.into()),
        }
    }

    /// Create a resource-not-found error
    pub fn resource_not_found<S: Into<String>>(pattern: S) -> Self {
        Self::ResourceNotFound {
            pattern: pattern.into(),
            context: None,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error from a message
    pub fn serialization_msg<S: Into<String>, M: Into<String>>(format: S, message: M) -> Self {
        let message: String = message.into();
        Self::Serialization {
            format: format.into(),
            source: message.into(),
        }
    }

    /// Create a provisioning error
    pub fn provisioning<S: Into<String>, M: Into<String>>(step: S, message: M) -> Self {
        Self::Provisioning {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an archive error
    pub fn archive<S: Into<String>>(operation: S, source: zip::result::ZipError) -> Self {
        Self::Archive {
            operation: operation.into(),
            source,
        }
    }

    /// Wrap an error with the build step that produced it
    pub fn in_step(self, step: BuildStep) -> Self {
        match self {
            already @ Self::Build { .. } => already,
            other => Self::Build {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error, looking through build step wrappers
    pub fn root(&self) -> &SquallError {
        match self {
            Self::Build { source, .. } => source.root(),
            other => other,
        }
    }

    /// The failing build step, if this came out of a package build
    pub fn step(&self) -> Option<BuildStep> {
        match self {
            Self::Build { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Whether the error aborts the operation that raised it
    pub fn is_fatal(&self) -> bool {
        !matches!(self.root(), Self::DegradedLock { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::DuplicateId { .. }
            | Self::UnmatchedOverrides { .. }
            | Self::Configuration { .. } => "configuration",
            Self::ResourceNotFound { .. } => "resource",
            Self::Serialization { .. } => "serialization",
            Self::Provisioning { .. } => "provisioning",
            Self::DegradedLock { .. } => "degraded_lock",
            Self::Io { .. } => "io",
            Self::Archive { .. } => "archive",
            Self::Definition { .. } => "definition",
            Self::Build { source, .. } => source.category(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SquallError>;

impl From<std::io::Error> for SquallError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for SquallError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for SquallError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<thrift::Error> for SquallError {
    fn from(err: thrift::Error) -> Self {
        Self::serialization("thrift", err)
    }
}

impl From<anyhow::Error> for SquallError {
    fn from(err: anyhow::Error) -> Self {
        Self::Definition {
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_is_configuration() {
        let err = SquallError::DuplicateId {
            id: "split".into(),
            existing: StageKind::Source,
        };
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("'split'"));
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn test_unmatched_overrides_lists_keys() {
        let err = SquallError::UnmatchedOverrides {
            keys: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().ends_with("a,b"));
    }

    #[test]
    fn test_build_step_wrapping() {
        let err = SquallError::resource_not_found("*.txt").in_step(BuildStep::Manifest);
        assert_eq!(err.step(), Some(BuildStep::Manifest));
        assert_eq!(err.category(), "resource");
        assert!(matches!(err.root(), SquallError::ResourceNotFound { pattern, .. } if pattern == "*.txt"));
        assert!(err.to_string().contains("add manifest entries"));

        // Re-wrapping keeps the innermost step
        let err = err.in_step(BuildStep::Finish);
        assert_eq!(err.step(), Some(BuildStep::Manifest));
    }

    #[test]
    fn test_fatality() {
        let degraded = SquallError::DegradedLock {
            lock_file: "/tmp/x.lock".into(),
            source: std::io::Error::new(std::io::ErrorKind::Unsupported, "no flock"),
        };
        assert!(!degraded.is_fatal());
        assert!(SquallError::configuration("bad").is_fatal());
    }
}
