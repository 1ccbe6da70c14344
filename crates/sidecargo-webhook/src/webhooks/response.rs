//! Admission responses for requests the webhook cannot process normally.
//!
//! Both kinds reject the admission and carry an HTTP status code in their
//! `status`, so the API server can tell a malformed request apart from an
//! internal failure.
use axum::http::StatusCode;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};

/// Rejects a request which could not be decoded or lacks required fields.
///
/// `uid` is the request UID if it could be recovered, the API server matches
/// responses to requests with it.
pub fn bad_request(uid: Option<&str>, message: impl ToString) -> AdmissionResponse {
    let mut response = AdmissionResponse::invalid(message);
    response.uid = uid.unwrap_or_default().to_owned();
    response.result.code = StatusCode::BAD_REQUEST.as_u16();
    response
}

/// Rejects a well-formed request the webhook failed to process.
pub fn internal_error<R>(request: &AdmissionRequest<R>, message: impl ToString) -> AdmissionResponse
where
    R: kube::Resource,
{
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
    response
}
