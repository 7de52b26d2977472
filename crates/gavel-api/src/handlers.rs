//! HTTP request handlers
//!
//! The client-facing surface (`/state`, `/bid`, `/add`, `/auction`,
//! `/checkpoint`, `/`) plus the `/rpc` endpoint carrying the peer
//! protocol. `/bid` is form-encoded; `/add` and `/auction` accept either a
//! form or a JSON body, picked by content type.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap};
use axum::response::Html;
use axum::Json;
use gavel_core::{
    ControlAction, NewItemArgs, Node, QueueSnapshot, Request, Response, RpcService,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub(crate) struct BidForm {
    amount: Option<String>,
    bidder: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewItemForm {
    name: String,
    description: String,
    starting_price: u64,
    duration_sec: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ControlForm {
    action: ControlAction,
}

/// Decode a body as JSON or a URL-encoded form, by content type
fn decode_body<T: DeserializeOwned>(headers: &HeaderMap, body: &str) -> ApiResult<T> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        serde_json::from_str(body).map_err(|error| ApiError::BadRequest(error.to_string()))
    } else {
        serde_urlencoded::from_str(body).map_err(|error| ApiError::BadRequest(error.to_string()))
    }
}

/// `GET /`: minimal human page; the JSON surface is the real interface
pub(crate) async fn index_handler(State(node): State<Arc<Node>>) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><title>gavel {id}</title></head>\
         <body><h1>gavel auction node {id}</h1>\
         <p>Live state: <a href=\"/state\">/state</a> | \
         Checkpoint: <a href=\"/checkpoint\">/checkpoint</a></p></body></html>",
        id = node.id()
    ))
}

/// `GET /state`: the node's current queue snapshot
pub(crate) async fn state_handler(State(node): State<Arc<Node>>) -> Json<QueueSnapshot> {
    Json(node.snapshot())
}

/// `POST /bid`: place a bid, forwarded to the coordinator when needed
pub(crate) async fn bid_handler(
    State(node): State<Arc<Node>>,
    Form(form): Form<BidForm>,
) -> ApiResult<String> {
    let amount = form
        .amount
        .as_deref()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|amount| *amount > 0)
        .ok_or_else(|| ApiError::BadRequest("Invalid bid amount".into()))?;
    let bidder = match form.bidder {
        Some(bidder) if !bidder.trim().is_empty() => bidder,
        _ => node.id().to_string(),
    };

    let outcome = node.submit_bid(amount, bidder).await?;
    if outcome.accepted {
        Ok(outcome.message)
    } else {
        Err(ApiError::BadRequest(outcome.message))
    }
}

/// `POST /add`: queue a new auction item
pub(crate) async fn add_handler(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<String> {
    let form: NewItemForm = decode_body(&headers, &body)?;
    if form.starting_price == 0 || form.duration_sec == 0 {
        return Err(ApiError::BadRequest(
            "starting price and duration must be positive".into(),
        ));
    }
    let outcome = node
        .submit_item(NewItemArgs {
            name: form.name,
            description: form.description,
            starting_price: form.starting_price,
            duration_sec: form.duration_sec,
        })
        .await?;
    if outcome.accepted {
        Ok(outcome.message)
    } else {
        Err(ApiError::BadRequest(outcome.message))
    }
}

/// `POST /auction`: start or restart the auction
pub(crate) async fn auction_handler(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<String> {
    let form: ControlForm = decode_body(&headers, &body)?;
    let outcome = node.submit_control(form.action).await?;
    if outcome.accepted {
        Ok(outcome.message)
    } else {
        Err(ApiError::BadRequest(outcome.message))
    }
}

/// `GET /checkpoint`: raw checkpoint file, 404 until one exists
pub(crate) async fn checkpoint_handler(
    State(node): State<Arc<Node>>,
) -> ApiResult<([(header::HeaderName, &'static str); 1], String)> {
    match node.checkpoint_json() {
        Ok(Some(body)) => Ok(([(header::CONTENT_TYPE, "application/json")], body)),
        Ok(None) => Err(ApiError::NotFound),
        Err(error) => Err(ApiError::Internal(error.to_string())),
    }
}

/// `POST /rpc`: peer protocol endpoint
pub(crate) async fn rpc_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<Request>,
) -> Json<Response> {
    Json(node.dispatch(request).await)
}
