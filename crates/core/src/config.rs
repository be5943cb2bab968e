//! Configuration types shared by the core components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behaviour for a class of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::upstream()
    }
}

impl RetryPolicy {
    /// Policy for calls to the language-model backend.
    pub fn upstream() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }

    /// Policy for tool execution: fewer retries, shorter backoff.
    pub fn tool() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }

    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::upstream()
        }
    }

    /// Calculate the delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Connection settings for the OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL up to and including the API version, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Bound on connecting and receiving response headers.
    pub request_timeout_ms: u64,
    /// Bound on the gap between two body reads of a streaming response.
    pub idle_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            retry: RetryPolicy::upstream(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Orchestration loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of model turns that may request tools.
    pub max_iterations: u32,
    pub tool_retry: RetryPolicy,
    /// Include upstream and tool error detail in client-facing error events.
    pub expose_error_details: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_retry: RetryPolicy::tool(),
            expose_error_details: false,
        }
    }
}

/// Per-request sampling overrides forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
}

impl GenerationOverrides {
    /// Range-check the numeric overrides.
    pub fn validate(&self) -> Result<(), String> {
        fn check(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), String> {
            match value {
                Some(v) if !(min..=max).contains(&v) => {
                    Err(format!("{} must be between {} and {}, got {}", name, min, max, v))
                }
                _ => Ok(()),
            }
        }

        check("temperature", self.temperature, 0.0, 2.0)?;
        check("top_p", self.top_p, 0.0, 1.0)?;
        check("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check("presence_penalty", self.presence_penalty, -2.0, 2.0)?;

        if self.max_tokens == Some(0) {
            return Err("max_tokens must be at least 1".to_string());
        }
        if let Some(stop) = &self.stop {
            if stop.len() > 4 {
                return Err("at most 4 stop sequences are allowed".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::upstream();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
    }

    #[test]
    fn test_tool_policy_capped() {
        let policy = RetryPolicy::tool();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(2_000));
    }

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.base_delay_ms, 1_000);
    }

    #[test]
    fn test_overrides_serialize_only_set_fields() {
        let overrides = GenerationOverrides {
            temperature: Some(0.2),
            stop: Some(vec!["\n\n".to_string()]),
            ..Default::default()
        };
        let value = serde_json::to_value(&overrides).unwrap();
        assert_eq!(value, serde_json::json!({"temperature": 0.2, "stop": ["\n\n"]}));
    }

    #[test]
    fn test_overrides_validation() {
        assert!(GenerationOverrides::default().validate().is_ok());

        let hot = GenerationOverrides {
            temperature: Some(2.5),
            ..Default::default()
        };
        assert!(hot.validate().unwrap_err().contains("temperature"));

        let zero = GenerationOverrides {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.tool_retry, RetryPolicy::tool());
        assert!(!config.expose_error_details);
    }
}
