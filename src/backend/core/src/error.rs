//! Error handling for Warden Core.
//!
//! Every fallible public operation returns [`WardenError`]. An error carries:
//! - a stable [`ErrorCode`] that decides HTTP status, retryability and severity
//! - a message that is safe to hand to callers, plus an optional internal one
//! - structured [`ErrorDetails`] and an optional source error
//!
//! Domain errors (`AuthorizationError`, `EnvelopeError`, `QueueError`) live
//! next to the components that raise them and convert through `From`.
//! Constructing an error bumps `warden_errors_total{code,category,retryable}`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_rules(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path).with_error_code(ErrorCode::MissingConfiguration)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

pub type Result<T> = std::result::Result<T, WardenError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, machine-readable error codes. Serialized as `SCREAMING_SNAKE_CASE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Access (1000-1099)
    Forbidden,
    PermissionDenied,
    ClassificationMismatch,
    ResidencyMismatch,
    TenantNotFound,
    MembershipNotFound,
    TenantSuspended,

    // Rejected input (1100-1199)
    ValidationError,
    InvalidInput,
    InvalidEnvelope,

    // Queues and jobs (1200-1299)
    QueueSaturated,
    QueueClosed,
    JobNotFound,
    JobTimeout,
    InvalidSchedule,

    // Payload encoding (1300-1399)
    SerializationError,
    DeserializationError,

    // Configuration (1400-1499)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Anything else (1900)
    InternalError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::Forbidden => 1000,
            Self::PermissionDenied => 1001,
            Self::ClassificationMismatch => 1002,
            Self::ResidencyMismatch => 1003,
            Self::TenantNotFound => 1004,
            Self::MembershipNotFound => 1005,
            Self::TenantSuspended => 1006,

            Self::ValidationError => 1100,
            Self::InvalidInput => 1101,
            Self::InvalidEnvelope => 1102,

            Self::QueueSaturated => 1200,
            Self::QueueClosed => 1201,
            Self::JobNotFound => 1202,
            Self::JobTimeout => 1203,
            Self::InvalidSchedule => 1204,

            Self::SerializationError => 1300,
            Self::DeserializationError => 1301,

            Self::ConfigurationError => 1400,
            Self::MissingConfiguration => 1401,
            Self::InvalidConfiguration => 1402,

            Self::InternalError => 1900,
        }
    }

    /// HTTP status for handlers that surface the error directly.
    ///
    /// Every access failure maps to 403, unknown tenants included, so a
    /// caller cannot learn which organizations exist.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Forbidden
            | Self::PermissionDenied
            | Self::ClassificationMismatch
            | Self::ResidencyMismatch
            | Self::TenantNotFound
            | Self::MembershipNotFound
            | Self::TenantSuspended => StatusCode::FORBIDDEN,

            Self::ValidationError
            | Self::InvalidInput
            | Self::InvalidEnvelope
            | Self::InvalidSchedule => StatusCode::UNPROCESSABLE_ENTITY,

            Self::QueueSaturated => StatusCode::TOO_MANY_REQUESTS,
            Self::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::JobNotFound => StatusCode::NOT_FOUND,
            Self::JobTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the same call may succeed if repeated later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueSaturated | Self::JobTimeout)
    }

    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "authorization",
            1100..=1199 => "validation",
            1200..=1299 => "queue",
            1300..=1399 => "serialization",
            1400..=1499 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides the log level an error is reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected rejections (bad input, missing permission)
    Low,
    /// Backpressure and timeouts
    Medium,
    /// Possible tampering or broken deployment
    High,
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::JobNotFound
            | ErrorCode::PermissionDenied
            | ErrorCode::MembershipNotFound => Self::Low,

            ErrorCode::QueueSaturated | ErrorCode::QueueClosed | ErrorCode::JobTimeout => {
                Self::Medium
            }

            // Classification or residency drift and forged tenant ids point at
            // tampering.
            ErrorCode::Forbidden
            | ErrorCode::ClassificationMismatch
            | ErrorCode::ResidencyMismatch
            | ErrorCode::TenantNotFound
            | ErrorCode::TenantSuspended
            | ErrorCode::InvalidEnvelope
            | ErrorCode::InvalidSchedule
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured data attached to an error and echoed in API responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Kind of the entity involved (`job`, `tenant`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Hint for saturated queues
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WardenError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct WardenError {
    code: ErrorCode,
    /// Safe to return to callers
    user_message: Cow<'static, str>,
    /// Logged, never serialized
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for WardenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl WardenError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.count();
        error
    }

    /// Error whose diagnostic text stays out of the user message.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "Internal error", message)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    pub fn job_not_found(queue: &str, job_id: impl fmt::Display) -> Self {
        let job_id = job_id.to_string();
        Self::new(
            ErrorCode::JobNotFound,
            format!("Job {} not found in queue {}", job_id, queue),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builders
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = self.details.with_context(key, value);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Raised by the authorization guard.
    pub fn is_authorization(&self) -> bool {
        self.code.category() == "authorization"
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reporting
    // ─────────────────────────────────────────────────────────────────────────

    /// Emit one event at the level matching [`Self::severity`].
    pub fn log(&self) {
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                error_code = %self.code,
                category,
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "Request failed"
            ),
            ErrorSeverity::Medium => warn!(
                error_code = %self.code,
                category,
                http_status = status,
                user_message = %self.user_message,
                "Request rejected"
            ),
            ErrorSeverity::Low => debug!(
                error_code = %self.code,
                category,
                http_status = status,
                user_message = %self.user_message,
                "Request rejected"
            ),
        }
    }

    fn count(&self) {
        counter!(
            "warden_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
            "retryable" => if self.is_retryable() { "true" } else { "false" },
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body returned when a handler fails.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&WardenError> for ErrorBody {
    fn from(error: &WardenError) -> Self {
        Self {
            code: error.code,
            numeric_code: error.code.numeric_code(),
            message: error.user_message.to_string(),
            details: (!error.details.is_empty()).then(|| error.details.clone()),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        self.log();
        let mut response = (self.http_status(), Json(ErrorBody::from(&self))).into_response();
        if let Some(secs) = self.details.retry_after_secs {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, secs.into());
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifts foreign errors and missing values into [`WardenError`].
pub trait ErrorContext<T> {
    /// Wrap as an internal error with `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap with an explicit code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| WardenError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| WardenError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| WardenError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| WardenError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for WardenError {
    fn from(error: serde_json::Error) -> Self {
        let code = match error.classify() {
            serde_json::error::Category::Io => ErrorCode::SerializationError,
            _ => ErrorCode::DeserializationError,
        };
        Self::with_internal(code, "Payload could not be encoded", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for WardenError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::JobTimeout, "Timed out", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for WardenError {
    fn from(error: anyhow::Error) -> Self {
        error
            .downcast::<WardenError>()
            .unwrap_or_else(|other| Self::internal(format!("{:#}", other)))
    }
}

impl From<config::ConfigError> for WardenError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::PathParse(_)
            | config::ConfigError::FileParse { .. }
            | config::ConfigError::Type { .. } => ErrorCode::InvalidConfiguration,
            _ => ErrorCode::ConfigurationError,
        };
        Self::with_internal(code, "Configuration could not be loaded", error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_failures_are_forbidden() {
        for code in [
            ErrorCode::PermissionDenied,
            ErrorCode::TenantNotFound,
            ErrorCode::MembershipNotFound,
            ErrorCode::ClassificationMismatch,
        ] {
            assert_eq!(code.http_status(), StatusCode::FORBIDDEN, "{code}");
            assert_eq!(code.category(), "authorization");
        }
    }

    #[test]
    fn test_status_and_retryability() {
        assert_eq!(ErrorCode::InvalidEnvelope.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorCode::QueueSaturated.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(ErrorCode::QueueSaturated.is_retryable());
        assert!(ErrorCode::JobTimeout.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
        assert!(!ErrorCode::InvalidEnvelope.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::InvalidEnvelope.category(), "validation");
        assert_eq!(ErrorCode::QueueClosed.category(), "queue");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::PermissionDenied), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::QueueSaturated), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::ResidencyMismatch), ErrorSeverity::High);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::InternalError), ErrorSeverity::Critical);
    }

    #[test]
    fn test_body_hides_internal_message() {
        let error = WardenError::with_internal(
            ErrorCode::InvalidEnvelope,
            "Invalid job envelope",
            "missing field `orgId`",
        )
        .with_context("queue", "hr-leave-accrual");

        let json = serde_json::to_string(&ErrorBody::from(&error)).unwrap();
        assert!(json.contains("INVALID_ENVELOPE"));
        assert!(json.contains("hr-leave-accrual"));
        assert!(!json.contains("orgId"));
        assert!(error.to_string().contains("orgId"));
    }

    #[test]
    fn test_saturated_response_sets_retry_after() {
        let response = WardenError::new(ErrorCode::QueueSaturated, "busy")
            .with_details(ErrorDetails::new().with_retry_after(1))
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[axum::http::header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_anyhow_round_trip_keeps_code() {
        let original = anyhow::Error::new(WardenError::forbidden("no"));
        assert_eq!(WardenError::from(original).code(), ErrorCode::Forbidden);
    }
}
