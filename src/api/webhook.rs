//! Webhook handler for push events

use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::error::DeployError;
use crate::notifier::{NotificationMessage, Severity};
use crate::runner::Dispatch;
use crate::signature::{self, SIGNATURE_1_HEADER, SIGNATURE_256_HEADER};
use crate::webhook::parse_push_event;

const EVENT_HEADER: &str = "X-GitHub-Event";

/// Handles the webhook POST request.
///
/// Answers as soon as the run is planned; the script itself runs on a
/// background task and reports through the notifier.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    info!("Received webhook call");

    // Prefer the SHA-256 signature when the host sends both
    let provided = header_str(&headers, SIGNATURE_256_HEADER)
        .or_else(|| header_str(&headers, SIGNATURE_1_HEADER));
    if !signature::verify(&body, provided, state.config.webhook_secret.as_deref()) {
        let err = DeployError::Authentication(
            if provided.is_none() {
                "no signature header supplied"
            } else {
                "signature mismatch, make sure the webhook secret is set correctly"
            }
            .to_string(),
        );
        warn!("{}", err);
        if state.config.notify_on_auth_failure {
            state.notifier.notify_detached(NotificationMessage::new(
                Severity::Security,
                "webhook",
                "rejected a call with an invalid signature",
            ));
        }
        return (StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    debug!("Successfully verified signature");

    match header_str(&headers, EVENT_HEADER) {
        None | Some("push") => {}
        Some("ping") => {
            info!("Received ping event");
            return (StatusCode::OK, "pong");
        }
        Some(other) => {
            info!("Not push event; Received {:?} event", other);
            return (StatusCode::OK, "Event ignored");
        }
    }

    let event = match parse_push_event(&body) {
        Ok(event) => event,
        Err(e) => {
            error!("{}", e);
            return (StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    match state.runner.dispatch(event) {
        // Return immediately, the host does not wait for long deployments
        Ok(Dispatch::Started(_)) => (StatusCode::OK, "Webhook received"),
        Ok(Dispatch::Ignored { branch }) => {
            debug!("Ignored push to branch '{}'", branch);
            (StatusCode::OK, "Branch ignored")
        }
        Err(e) => {
            error!("Rejecting push: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid repository name")
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
