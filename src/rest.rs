//! REST API and live monitor
//!
//! Read-side consumer of the manager. All JSON is kebab-cased. The
//! monitor endpoint upgrades to a WebSocket and relays a wildcard hub
//! subscription; a slow browser loses oldest events rather than
//! slowing the ingress.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Error;
use crate::manager::MessageManager;
use crate::message::{MessageSummary, ParsedMessage};
use crate::metrics;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<MessageManager>,
}

/// The full route table.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/v1/mailbox/{name}",
            get(list_mailbox).delete(purge_mailbox),
        )
        .route(
            "/v1/mailbox/{name}/{id}",
            get(get_message).patch(patch_message).delete(delete_message),
        )
        .route("/v1/mailbox/{name}/{id}/source", get(get_source))
        .route("/v2/monitor/messages", get(monitor))
        .route("/debug/metrics", get(debug_metrics))
        .with_state(state)
}

/// Crate errors mapped onto HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::BadInput(_) | Error::BadAddress(_) => StatusCode::BAD_REQUEST,
            Error::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Mailbox names in request paths may be bare names or full addresses;
/// addresses are reduced through the naming policy.
fn mailbox_param(state: &ApiState, name: &str) -> Result<String, ApiError> {
    if name.contains('@') {
        Ok(state.manager.policy().mailbox_name(name)?)
    } else if name.trim().is_empty() {
        Err(Error::BadAddress(name.to_string()).into())
    } else {
        Ok(name.trim().to_lowercase())
    }
}

async fn list_mailbox(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<MessageSummary>>, ApiError> {
    let mailbox = mailbox_param(&state, &name)?;
    Ok(Json(state.manager.get_messages(&mailbox)?))
}

async fn get_message(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<ParsedMessage>, ApiError> {
    let mailbox = mailbox_param(&state, &name)?;
    let message = state.manager.get_message(&mailbox, &id)?;
    Ok(Json(ParsedMessage::from_message(&message)?))
}

async fn get_source(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let mailbox = mailbox_param(&state, &name)?;
    let message = state.manager.get_message(&mailbox, &id)?;
    Ok((
        [(header::CONTENT_TYPE, "message/rfc822")],
        message.source,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct PatchBody {
    seen: bool,
}

async fn patch_message(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
    Json(body): Json<PatchBody>,
) -> Result<StatusCode, ApiError> {
    if !body.seen {
        // Seen is sticky; only a purge clears it.
        return Err(Error::BadInput("seen may only be set to true".into()).into());
    }
    let mailbox = mailbox_param(&state, &name)?;
    state.manager.mark_seen(&mailbox, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let mailbox = mailbox_param(&state, &name)?;
    // 404 for a message that was never there keeps DELETE informative
    // even though the underlying remove is idempotent.
    state.manager.get_message(&mailbox, &id)?;
    state.manager.remove_message(&mailbox, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn purge_mailbox(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mailbox = mailbox_param(&state, &name)?;
    state.manager.purge_messages(&mailbox).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn monitor(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| relay_notifications(socket, state))
}

/// Pump hub notifications into the socket until either side goes away.
async fn relay_notifications(socket: WebSocket, state: ApiState) {
    let subscription = state.manager.hub().subscribe_all();
    let (mut sender, mut receiver) = socket.split();
    debug!("monitor connected");

    loop {
        tokio::select! {
            notification = subscription.recv() => {
                let Some(notification) = notification else {
                    // Hub closed; the service is shutting down.
                    break;
                };
                let Ok(text) = serde_json::to_string(&notification) else {
                    continue;
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other frames are noise.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(dropped = subscription.dropped(), "monitor disconnected");
}

async fn debug_metrics() -> Json<metrics::Snapshot> {
    Json(metrics::snapshot())
}
