//! Admission webhooks for UnitedDeployment resources
//!
//! ## Endpoints
//! - POST /validate - rejects specs the reconciler would refuse to plan
//! - POST /mutate - fills defaults into `spec`
//!
//! Both accept and return `admission.k8s.io/v1` AdmissionReview objects.
//! Validation runs on the defaulted spec, so a request is judged the same
//! way whether or not the mutating webhook ran first.

use axum::{http::StatusCode, response::IntoResponse, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::controller::uniteddeployment::validate;
use crate::crd::defaults::apply_defaults;
use crate::crd::UnitedDeployment;

const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_KIND: &str = "AdmissionReview";

/// Incoming AdmissionReview
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    /// CREATE, UPDATE, DELETE or CONNECT
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Absent on DELETE
    #[serde(default)]
    pub object: Option<Value>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AdmissionStatus {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    /// Base64-encoded JSONPatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl AdmissionResponse {
    fn allow(uid: String) -> Self {
        Self {
            uid,
            allowed: true,
            status: None,
            patch_type: None,
            patch: None,
        }
    }

    fn deny(uid: String, code: u16, message: String) -> Self {
        Self {
            uid,
            allowed: false,
            status: Some(AdmissionStatus { code, message }),
            patch_type: None,
            patch: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

impl AdmissionReviewResponse {
    fn new(response: AdmissionResponse) -> Self {
        Self {
            api_version: ADMISSION_API_VERSION.to_string(),
            kind: ADMISSION_KIND.to_string(),
            response,
        }
    }
}

fn parse_object(request: &AdmissionRequest) -> Result<Option<UnitedDeployment>, String> {
    match &request.object {
        None | Some(Value::Null) => Ok(None),
        Some(obj) => serde_json::from_value(obj.clone())
            .map(Some)
            .map_err(|e| format!("invalid UnitedDeployment: {}", e)),
    }
}

/// Decide whether the object in `request` is admissible
pub fn review_validation(request: &AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.clone();
    let mut ud = match parse_object(request) {
        Ok(Some(ud)) => ud,
        Ok(None) => return AdmissionResponse::allow(uid),
        Err(e) => return AdmissionResponse::deny(uid, 400, e),
    };

    apply_defaults(&mut ud.spec);
    match validate(&ud) {
        Ok(()) => AdmissionResponse::allow(uid),
        Err(message) => AdmissionResponse::deny(uid, 422, message),
    }
}

/// Build the defaulting patch for the object in `request`
///
/// The whole spec is replaced; an object that is already fully defaulted
/// gets no patch.
pub fn review_mutation(request: &AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.clone();
    let ud = match parse_object(request) {
        Ok(Some(ud)) => ud,
        Ok(None) => return AdmissionResponse::allow(uid),
        Err(e) => return AdmissionResponse::deny(uid, 400, e),
    };

    let mut defaulted = ud.spec.clone();
    apply_defaults(&mut defaulted);
    if defaulted == ud.spec {
        return AdmissionResponse::allow(uid);
    }

    let value = match serde_json::to_value(&defaulted) {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::deny(uid, 500, e.to_string()),
    };
    let patch = json!([{ "op": "replace", "path": "/spec", "value": value }]);

    AdmissionResponse {
        patch_type: Some("JSONPatch".to_string()),
        patch: Some(STANDARD.encode(patch.to_string())),
        ..AdmissionResponse::allow(uid)
    }
}

fn respond(
    review: AdmissionReview,
    endpoint: &str,
    decide: fn(&AdmissionRequest) -> AdmissionResponse,
) -> (StatusCode, Json<Value>) {
    let Some(request) = review.request else {
        warn!(endpoint, kind = %review.kind, "AdmissionReview without request");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing request" })),
        );
    };

    let response = decide(&request);
    match &response.status {
        Some(status) => warn!(
            endpoint,
            uid = %response.uid,
            operation = %request.operation,
            namespace = ?request.namespace,
            united_deployment = ?request.name,
            reason = %status.message,
            "Admission denied"
        ),
        None => debug!(
            endpoint,
            uid = %response.uid,
            operation = %request.operation,
            patched = response.patch.is_some(),
            "Admission allowed"
        ),
    }

    let body = serde_json::to_value(AdmissionReviewResponse::new(response))
        .unwrap_or_else(|e| json!({ "error": e.to_string() }));
    (StatusCode::OK, Json(body))
}

/// Axum handler for the /validate endpoint
pub async fn handle_validate(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    respond(review, "validate", review_validation)
}

/// Axum handler for the /mutate endpoint
pub async fn handle_mutate(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    respond(review, "mutate", review_mutation)
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod tests;
