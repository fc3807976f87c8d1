use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DISCOVERY_FAILED: {message}")]
    Discovery {
        message: String,
        details: Vec<String>,
    },

    #[error("NO_FRAMEWORK: No test framework is currently configured.")]
    NoFrameworkConfigured,

    #[error("INVALID_FRAMEWORK_CONFIG: {0}")]
    InvalidFrameworkConfig(String),

    #[error("RUN_IN_PROGRESS: Tests are currently running; please wait or stop the tests first.")]
    RunInProgress,

    #[error("UNKNOWN_TEST: Unknown test \"{0}\"")]
    UnknownTest(String),

    #[error("PATH_CONFLICT: Test \"{0}\" would be nested under an existing test")]
    PathConflict(String),

    #[error("INVALID_PATTERN: Invalid executable pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("PROCESS_LAUNCH_FAILED: Failed to launch '{command}': {source}")]
    ProcessLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("COMMAND_FAILED: '{command}' exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an aggregate discovery error from per-executable failures.
    pub fn discovery(details: Vec<String>) -> Self {
        Error::Discovery {
            message: "Error when discovering tests. See details for more information.".to_string(),
            details,
        }
    }

    /// Detail lines attached to the error, if any.
    pub fn details(&self) -> &[String] {
        match self {
            Error::Discovery { details, .. } => details,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
