//! Control-channel wire frames (§4.4). Ingress variants are discriminated
//! structurally by field presence, so decoding goes through an untagged
//! enum rather than ad-hoc field probing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CapturedRequest, RequestId, StructuredResponse};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngressFrame {
    Response {
        slug: String,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        response: StructuredResponse,
    },
    DashboardAttach {
        #[serde(rename = "type")]
        kind: DashboardAttachTag,
    },
    Registration {
        slug: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub enum DashboardAttachTag {
    #[serde(rename = "status-client")]
    StatusClient,
}

/// Parses a raw text frame into a tagged ingress variant. Field order in
/// the untagged enum above matters: `Response` and `DashboardAttach` are
/// structurally distinguishable from `Registration` only by trying the more
/// specific shapes first.
pub fn decode_ingress(raw: &str) -> Result<IngressFrame, serde_json::Error> {
    serde_json::from_str(raw)
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum EgressFrame {
    Registered {
        #[serde(rename = "type")]
        kind: &'static str,
        slug: String,
    },
    ForwardedRequest {
        slug: String,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        request: CapturedRequest,
    },
    ErrorHint {
        error: String,
    },
    Observability(Value),
}

impl EgressFrame {
    pub fn registered(slug: impl Into<String>) -> Self {
        Self::Registered { kind: "registered", slug: slug.into() }
    }

    pub fn error_hint(message: impl Into<String>) -> Self {
        Self::ErrorHint { error: message.into() }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"failed to encode frame"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_registration() {
        let frame = decode_ingress(r#"{"slug":"svc-a"}"#).unwrap();
        assert!(matches!(frame, IngressFrame::Registration { slug } if slug == "svc-a"));
    }

    #[test]
    fn decodes_response() {
        let id = RequestId::new();
        let raw = format!(r#"{{"slug":"svc-a","requestId":"{id}","response":{{"statusCode":201,"body":"ok"}}}}"#);
        let frame = decode_ingress(&raw).unwrap();
        match frame {
            IngressFrame::Response { slug, response, .. } => {
                assert_eq!(slug, "svc-a");
                assert_eq!(response.status(), 201);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_dashboard_attach() {
        let frame = decode_ingress(r#"{"type":"status-client"}"#).unwrap();
        assert!(matches!(frame, IngressFrame::DashboardAttach { .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(decode_ingress("not json").is_err());
    }
}
