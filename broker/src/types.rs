//! Shared identifiers and wire-adjacent value types used across the engine,
//! the control channel, and the HTTP ingress adapter.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque request id assigned at admission and used to correlate a
/// forwarded request with its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated slug: the character class and length check in the input
/// validator have already passed by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    /// The one slug value that is never bindable.
    pub const RESERVED: &'static str = "status";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constructs a `Slug` without re-validating. Callers must have already
    /// run the value through the validator.
    pub(crate) fn new_unchecked(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request captured from the HTTP ingress adapter, sanitised and ready to
/// be framed onto the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: std::collections::BTreeMap<String, String>,
    pub body: String,
}

/// A structured response as received from a handler over the control
/// channel. Every field is optional on the wire; defaults are applied at
/// the point of use (§3: status 200, empty headers, empty body).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl StructuredResponse {
    pub fn status(&self) -> u16 {
        self.status_code.unwrap_or(200)
    }
}
