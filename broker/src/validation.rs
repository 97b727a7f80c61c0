//! Slug syntax, injection-pattern, header sanitisation, and body-size
//! checks applied during admission (§4.1 step d/e/f/g).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{Error, Result};
use crate::types::Slug;

static SLUG_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"<script",
        r"javascript:",
        r"on\w+\s*=",
        r"eval\s*\(",
        r"expression\s*\(",
        r"vbscript:",
        r"data:text/html",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Validates a raw slug string: syntax, length, and the reserved literal.
pub fn validate_slug(raw: &str) -> Result<Slug> {
    if raw.is_empty() || raw.len() > 50 || !SLUG_PATTERN.is_match(raw) {
        return Err(Error::InvalidSlug);
    }
    if raw == Slug::RESERVED {
        return Err(Error::ReservedSlug(raw.to_string()));
    }
    Ok(Slug::new_unchecked(raw))
}

/// True if the value contains a recognised injection pattern.
pub fn contains_injection(value: &str) -> bool {
    INJECTION_PATTERNS.iter().any(|re| re.is_match(value))
}

/// Drops hop-by-hop headers and any header whose value fails the injection
/// check. Idempotent: running it twice over its own output is a no-op,
/// since nothing it keeps could have been dropped by a second pass.
pub fn sanitise_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            !HOP_BY_HOP_HEADERS.contains(&lower.as_str()) && !contains_injection(value)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Rejects a request whose target or method strings look like an injection
/// attempt rather than a legitimate request line.
pub fn validate_request_line(method: &str, target: &str) -> Result<()> {
    if contains_injection(method) || contains_injection(target) {
        return Err(Error::InvalidSlug);
    }
    Ok(())
}

pub fn check_body_size(len: usize, max: usize) -> Result<()> {
    if len > max { Err(Error::PayloadTooLarge) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_lengths() {
        assert!(validate_slug(&"a".repeat(50)).is_ok());
        assert!(validate_slug(&"a".repeat(51)).is_err());
        assert!(validate_slug("").is_err());
    }

    #[test]
    fn rejects_reserved_slug() {
        assert!(matches!(validate_slug("status"), Err(Error::ReservedSlug(_))));
    }

    #[test]
    fn header_filter_is_idempotent() {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), "example.com".to_string());
        headers.insert("X-Custom".to_string(), "value".to_string());
        headers.insert("X-Bad".to_string(), "<script>alert(1)</script>".to_string());

        let once = sanitise_headers(&headers);
        let twice = sanitise_headers(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
        assert!(once.contains_key("X-Custom"));
    }

    #[test]
    fn body_size_boundary() {
        assert!(check_body_size(10, 10).is_ok());
        assert!(check_body_size(11, 10).is_err());
    }
}
