//! Serializable types for the repub registry REST API.
//!
//! This crate contains only the wire representation of the API: the hosted
//! pub v2 version-listing document, the publish flow bodies, the admin API
//! bodies, and the error envelope. It performs no I/O.

#![deny(missing_docs)]

pub mod admin;
pub mod error;
pub mod listing;
pub mod publish;

/// The content type of the version-listing document.
pub const PUB_MEDIA_TYPE: &str = "application/vnd.pub.v2+json";

/// The name of the webhook event header.
pub const EVENT_HEADER_NAME: &str = "X-Repub-Event";

/// The name of the webhook delivery id header.
pub const DELIVERY_ID_HEADER_NAME: &str = "X-Repub-Delivery-Id";

/// The name of the webhook signature header.
pub const SIGNATURE_HEADER_NAME: &str = "X-Repub-Signature";
