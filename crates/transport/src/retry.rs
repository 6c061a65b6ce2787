//! Rate-limit retry policy.
//!
//! A 429 response carries a structured error body; when one of its details is
//! a `RetryInfo` with a `retryDelay`, that is how long we wait before the next
//! attempt. Otherwise the policy's default delay applies.

use std::time::Duration;

use serde::Deserialize;
use turnloop_config::RetryConfig;

/// How many times to retry a rate-limited request, and the fallback wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    pub default_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            default_delay: config.default_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorPayload,
}

#[derive(Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "@type", default)]
    kind: String,
    #[serde(rename = "retryDelay", default)]
    retry_delay: Option<String>,
}

/// Extract the server-requested retry delay from a 429 body.
///
/// Body shape: `{"error":{"details":[{"@type":"...RetryInfo","retryDelay":"0.42s"}]}}`.
/// Returns `default` when the body is not JSON or carries no usable delay.
pub fn parse_retry_delay(body: &[u8], default: Duration) -> Duration {
    let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) else {
        return default;
    };
    parsed
        .error
        .details
        .iter()
        .filter(|d| d.kind.ends_with("RetryInfo"))
        .filter_map(|d| d.retry_delay.as_deref())
        .find_map(parse_duration)
        .unwrap_or(default)
}

/// Parse a duration string such as `"0.5s"`, `"250ms"`, `"1m"` or `"1m30s"`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = s;
    let mut total_secs = 0f64;

    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total_secs += value * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total_secs).ok()
}
