//! Code-generation service interface
//!
//! The external service is reached through one trait:
//! `generate(prompt) -> {file_path, operation, content}*`. The HTTP client
//! wraps it with a token-bucket rate limit and exponential-backoff retry for
//! transient failures; authentication and malformed-output failures are
//! permanent and fail the task immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{message_looks_transient, NecroError, Result};

/// What to do with one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
}

/// One file change produced by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub file_path: String,
    pub operation: FileOperation,
    #[serde(default)]
    pub content: String,
}

/// Full response for one generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedChanges {
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The single seam to the external code-generation service
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<GeneratedChanges>;
}

// ═══════════════════════════════════════════════════════════════
// Token bucket
// ═══════════════════════════════════════════════════════════════

/// Token bucket limiting request rate to the service
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate_per_second: rate_per_second.max(0.1),
            burst: burst.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let wait = (1.0 - state.tokens) / self.rate_per_second;
            Some(Duration::from_secs_f64(wait))
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// HTTP client
// ═══════════════════════════════════════════════════════════════

/// Retry shape for transient generation failures
#[derive(Debug, Clone)]
pub struct CodegenRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: f64,
    /// Randomization factor (0.0 to 1.0) applied to each delay
    pub jitter: f64,
}

impl Default for CodegenRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_base: 2.0,
            jitter: 0.1,
        }
    }
}

impl CodegenRetry {
    /// `min(initial · base^(attempt-1), max)` for 1-indexed attempts, with
    /// optional jitter on top.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        let capped = delay.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let range = capped * self.jitter.clamp(0.0, 1.0);
            (capped + rand::random::<f64>() * range * 2.0 - range).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// reqwest-backed client for the generation endpoint
pub struct HttpCodeGenerator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    limiter: RateLimiter,
    retry: CodegenRetry,
}

impl HttpCodeGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        rate_per_second: f64,
        burst: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token,
            limiter: RateLimiter::new(rate_per_second, burst),
            retry: CodegenRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: CodegenRetry) -> Self {
        self.retry = retry;
        self
    }

    async fn request_once(&self, prompt: &str) -> Result<GeneratedChanges> {
        let mut request = self.client.post(&self.endpoint).json(&json!({ "prompt": prompt }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            // Connect/timeout errors are transient by definition.
            NecroError::CodegenTransient {
                attempts: 1,
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(NecroError::CodegenPermanent {
                reason: format!("authentication rejected ({status})"),
            });
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(NecroError::CodegenTransient {
                attempts: 1,
                reason: format!("service returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(NecroError::CodegenPermanent {
                reason: format!("service returned {status}"),
            });
        }

        let body = response.text().await.map_err(|e| NecroError::CodegenTransient {
            attempts: 1,
            reason: format!("body read failed: {e}"),
        })?;
        serde_json::from_str(&body).map_err(|e| NecroError::CodegenPermanent {
            reason: format!("malformed response: {e}"),
        })
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    async fn generate(&self, prompt: &str) -> Result<GeneratedChanges> {
        let mut last_reason = String::new();

        for attempt in 1..=self.retry.max_attempts {
            self.limiter.acquire().await;
            debug!(attempt, endpoint = %self.endpoint, "codegen request");

            match self.request_once(prompt).await {
                Ok(changes) => return Ok(changes),
                Err(e @ NecroError::CodegenPermanent { .. }) => return Err(e),
                Err(NecroError::CodegenTransient { reason, .. }) => {
                    warn!(attempt, reason = %reason, "transient codegen failure");
                    last_reason = reason;
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
                Err(other) => {
                    if message_looks_transient(&other.to_string()) {
                        last_reason = other.to_string();
                        if attempt < self.retry.max_attempts {
                            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        }
                    } else {
                        return Err(other);
                    }
                }
            }
        }

        Err(NecroError::CodegenTransient {
            attempts: self.retry.max_attempts,
            reason: last_reason,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════════

/// Deterministic generator for tests and dry runs
#[derive(Clone, Default)]
pub struct MockCodeGenerator {
    responses: Arc<Mutex<Vec<Result<GeneratedChanges>>>>,
    pub prompts_seen: Arc<Mutex<Vec<String>>>,
}

impl MockCodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned response; popped in FIFO order. An empty queue yields a
    /// single-file create so end-to-end tests always commit something.
    pub fn push_response(&self, response: Result<GeneratedChanges>) {
        self.responses.lock().push(response);
    }

    pub fn single_file(path: &str, content: &str) -> GeneratedChanges {
        GeneratedChanges {
            changes: vec![FileChange {
                file_path: path.to_string(),
                operation: FileOperation::Create,
                content: content.to_string(),
            }],
            notes: None,
        }
    }
}

#[async_trait]
impl CodeGenerator for MockCodeGenerator {
    async fn generate(&self, prompt: &str) -> Result<GeneratedChanges> {
        self.prompts_seen.lock().push(prompt.to_string());
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            Ok(Self::single_file(
                "GENERATED.md",
                "generated placeholder content\n",
            ))
        } else {
            responses.remove(0)
        }
    }
}
