//! Generation transport for turnloop.
//!
//! [`GeminiTransport`] implements `turnloop_core::Transport` against the Code
//! Assist flavoured `generateContent` / `streamGenerateContent` endpoints:
//! it wraps requests in the API envelope, retries HTTP 429 using the delay the
//! server asks for, and decodes the SSE stream into `StreamEvent`s.

pub mod gemini;
pub mod retry;
pub mod sse;
pub mod wire;

pub use gemini::GeminiTransport;
pub use retry::{RetryPolicy, parse_duration, parse_retry_delay};
pub use sse::{SseDecoder, SseRecord};
