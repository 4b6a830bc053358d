//! The error envelope returned by every failing API call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A machine-readable error code.
///
/// Codes serialize in kebab case (e.g. `version-exists`) and each maps to a
/// fixed HTTP status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Malformed request: bad JSON, YAML, semver, or query parameters.
    BadRequest,
    /// No token or an invalid token was presented.
    Unauthorized,
    /// The token is valid but lacks the required scope.
    Forbidden,
    /// The package, version, session, or resource does not exist.
    NotFound,
    /// The version already exists with a different archive.
    VersionExists,
    /// The uploaded archive exceeds the configured size limit.
    PayloadTooLarge,
    /// The upload session is missing, expired, or already completed.
    UploadExpired,
    /// The uploaded data is not a gzipped tar archive.
    UnsupportedMediaType,
    /// The archive or manifest violates an invariant.
    Unprocessable,
    /// The per-source rate limit was exceeded.
    RateLimited,
    /// The upstream registry could not be reached.
    UpstreamUnavailable,
    /// An internal error occurred.
    Internal,
    /// The service cannot serve requests (pending migrations, unconfigured storage).
    Unavailable,
}

impl ErrorCode {
    /// Returns the HTTP status associated with this code.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::VersionExists => 409,
            Self::UploadExpired => 410,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::Unprocessable => 422,
            Self::RateLimited => 429,
            Self::Internal => 500,
            Self::UpstreamUnavailable => 502,
            Self::Unavailable => 503,
        }
    }

    /// Returns the kebab-case string form of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::VersionExists => "version-exists",
            Self::PayloadTooLarge => "payload-too-large",
            Self::UploadExpired => "upload-expired",
            Self::UnsupportedMediaType => "unsupported-media-type",
            Self::Unprocessable => "unprocessable",
            Self::RateLimited => "rate-limited",
            Self::UpstreamUnavailable => "upstream-unavailable",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
        }
    }
}

/// The body of an error response: `{"error":{"code":..., "message":...}}`.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{}: {}", .error.code.as_str(), .error.message)]
pub struct ErrorEnvelope {
    /// The error detail.
    pub error: ErrorDetail,
}

impl ErrorEnvelope {
    /// Creates an envelope from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }
    }
}

/// The `error` member of the envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// The machine-readable code.
    pub code: ErrorCode,
    /// The human-readable message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_serialize_in_kebab_case() {
        let json = serde_json::to_string(&ErrorCode::VersionExists).unwrap();
        assert_eq!(json, "\"version-exists\"");
        let json = serde_json::to_string(&ErrorCode::UnsupportedMediaType).unwrap();
        assert_eq!(json, "\"unsupported-media-type\"");
    }

    #[test]
    fn serde_matches_as_str() {
        for code in [
            ErrorCode::BadRequest,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::VersionExists,
            ErrorCode::PayloadTooLarge,
            ErrorCode::UploadExpired,
            ErrorCode::UnsupportedMediaType,
            ErrorCode::Unprocessable,
            ErrorCode::RateLimited,
            ErrorCode::UpstreamUnavailable,
            ErrorCode::Internal,
            ErrorCode::Unavailable,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, serde_json::Value::String(code.as_str().to_string()));
        }
    }

    #[test]
    fn envelope_shape() {
        let envelope = ErrorEnvelope::new(ErrorCode::NotFound, "package `foo` was not found");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": {
                    "code": "not-found",
                    "message": "package `foo` was not found",
                }
            })
        );
    }
}
