//! Types for the hosted pub v2 version-listing document.

use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

/// The version-listing document for a package.
///
/// Serialization matches the upstream v2 wire format: retraction and
/// discontinuation fields are omitted entirely when unset so the document
/// stays byte-compatible with registries that never emit them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionListing {
    /// The package name.
    pub name: String,
    /// The latest version, per the registry's selection rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<VersionEntry>,
    /// All known versions, oldest first.
    pub versions: Vec<VersionEntry>,
    /// Whether the package is discontinued.
    #[serde(
        rename = "isDiscontinued",
        default,
        skip_serializing_if = "is_false"
    )]
    pub is_discontinued: bool,
    /// The suggested replacement for a discontinued package.
    #[serde(rename = "replacedBy", default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
}

/// A single version within a listing document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// The version string, exactly as published.
    pub version: String,
    /// The URL the archive may be downloaded from.
    pub archive_url: String,
    /// The lowercase hex SHA-256 of the archive bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
    /// The package manifest, as published.
    pub pubspec: serde_json::Value,
    /// Whether the version is retracted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub retracted: bool,
    /// The optional retraction message.
    #[serde(
        rename = "retractionMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retraction_message: Option<String>,
}
