//! Types for the two-step publish flow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The response to `GET /api/packages/versions/new`.
///
/// `url` is where the client must POST the archive as `multipart/form-data`;
/// `fields` are extra form fields that must precede the `file` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSessionResponse {
    /// The upload URL for step two.
    pub url: String,
    /// Extra multipart form fields the client must echo.
    pub fields: BTreeMap<String, String>,
}

/// The success envelope returned by `newUploadFinish`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    /// The success detail.
    pub success: SuccessMessage,
}

impl SuccessEnvelope {
    /// Creates an envelope from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: SuccessMessage {
                message: message.into(),
            },
        }
    }
}

/// The `success` member of the envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// The human-readable message.
    pub message: String,
}
