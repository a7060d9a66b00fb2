//! HTTP API
//!
//! Thin JSON front end over a shared [`Watcher`]. Handlers only call the watcher's
//! public operations.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::watcher::Watcher;

/// `?address=` query parameter
#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    pub address: Option<String>,
}

impl AddressQuery {
    fn address(self) -> Option<String> {
        self.address.filter(|a| !a.trim().is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentBlockResponse {
    pub current_block: u64,
}

/// Build the router with the watcher as shared state
pub fn router(watcher: Arc<Watcher>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/getCurrentBlock", get(current_block))
        .route("/subscribe", get(subscribe).post(subscribe))
        .route("/getSubscriptions", get(subscriptions))
        .route("/getTransactions", get(transactions))
        .layer(TraceLayer::new_for_http())
        .with_state(watcher)
}

async fn health() -> &'static str {
    "Hello, the server is running!"
}

async fn current_block(State(watcher): State<Arc<Watcher>>) -> Json<CurrentBlockResponse> {
    Json(CurrentBlockResponse {
        current_block: watcher.current_height(),
    })
}

async fn subscribe(
    State(watcher): State<Arc<Watcher>>,
    Query(query): Query<AddressQuery>,
) -> Response {
    let Some(address) = query.address() else {
        return (StatusCode::BAD_REQUEST, "Missing address parameter").into_response();
    };

    if !watcher.subscribe(&address) {
        return (StatusCode::BAD_REQUEST, "Address already subscribed").into_response();
    }

    (
        StatusCode::OK,
        format!("Address {} subscribed successfully", address),
    )
        .into_response()
}

async fn subscriptions(State(watcher): State<Arc<Watcher>>) -> Json<Vec<String>> {
    Json(watcher.list_subscriptions())
}

async fn transactions(
    State(watcher): State<Arc<Watcher>>,
    Query(query): Query<AddressQuery>,
) -> Response {
    let Some(address) = query.address() else {
        return (StatusCode::BAD_REQUEST, "Missing address parameter").into_response();
    };

    match watcher.transactions_for(&address) {
        Some(transactions) => Json(transactions).into_response(),
        None => (StatusCode::NOT_FOUND, "Address is not subscribed").into_response(),
    }
}
