//! Error taxonomy for the gateway core.

use std::time::Duration;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the resilience primitives, the registry and the upstream client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Upstream unreachable, timed out, or answered with a non-2xx status.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        status: Option<u16>,
    },

    /// The retry policy ran out of attempts.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },

    #[error("Unknown tool: {name}. Available tools: {}", format_available(.available))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },

    #[error("Missing required parameter: {parameter}")]
    MissingParameter { tool: String, parameter: String },

    #[error("Invalid type for parameter '{parameter}': expected {expected}, got {actual}")]
    InvalidParameterType {
        tool: String,
        parameter: String,
        expected: String,
        actual: String,
    },

    /// Structurally malformed parameters or requests.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The circuit breaker rejected the call without attempting it.
    #[error("Service unavailable, retry after {}s", .retry_after.as_secs().max(1))]
    CircuitOpen { retry_after: Duration },

    #[error("Path escapes sandbox: {path}")]
    SandboxViolation { path: String },
}

fn format_available(available: &[String]) -> String {
    if available.is_empty() {
        "(none)".to_string()
    } else {
        available.join(", ")
    }
}

impl GatewayError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            status: None,
        }
    }

    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether a retry policy may try the operation again.
    ///
    /// Client errors from the upstream (4xx other than 429) are not retried;
    /// validation, sandbox and circuit-open errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { status: None, .. } => true,
            Self::Connection {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            Self::ToolExecution { .. } => true,
            _ => false,
        }
    }

    /// Caller or model mistakes: reported immediately, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool { .. }
                | Self::MissingParameter { .. }
                | Self::InvalidParameterType { .. }
                | Self::InvalidParams(_)
                | Self::SandboxViolation { .. }
        )
    }

    /// Human-readable message with upstream detail stripped.
    pub fn public_message(&self) -> String {
        match self {
            Self::Connection { .. } => "The language model backend is unreachable".to_string(),
            Self::RetryExhausted { attempts, last } => match last.as_ref() {
                Self::ToolExecution { tool, .. } => {
                    format!("Tool '{}' failed after {} attempts", tool, attempts)
                }
                _ => format!(
                    "The language model backend is unreachable (gave up after {} attempts)",
                    attempts
                ),
            },
            Self::ToolExecution { tool, .. } => format!("Tool '{}' failed", tool),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_lists_available() {
        let err = GatewayError::UnknownTool {
            name: "nope".to_string(),
            available: vec!["readFile".to_string(), "writeFile".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown tool: nope. Available tools: readFile, writeFile"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::connection("refused").is_retryable());
        assert!(GatewayError::Connection {
            message: "bad gateway".to_string(),
            status: Some(502)
        }
        .is_retryable());
        assert!(!GatewayError::Connection {
            message: "bad request".to_string(),
            status: Some(400)
        }
        .is_retryable());
        assert!(GatewayError::tool_execution("exec", "boom").is_retryable());
        assert!(!GatewayError::CircuitOpen {
            retry_after: Duration::from_secs(3)
        }
        .is_retryable());
        assert!(!GatewayError::SandboxViolation {
            path: "../x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = GatewayError::RetryExhausted {
            attempts: 4,
            last: Box::new(GatewayError::connection("tcp connect 10.0.0.4:8080 refused")),
        };
        let message = err.public_message();
        assert!(message.contains("4 attempts"));
        assert!(!message.contains("10.0.0.4"));

        let missing = GatewayError::MissingParameter {
            tool: "deleteFile".to_string(),
            parameter: "path".to_string(),
        };
        assert_eq!(missing.public_message(), "Missing required parameter: path");
    }
}
