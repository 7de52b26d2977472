//! # gavel-api: HTTP facade for the gavel auction cluster
//!
//! One axum server per node carries both surfaces on a single port:
//!
//! - the client-facing endpoints (`/state`, `/bid`, `/add`, `/auction`,
//!   `/checkpoint`, `/`), and
//! - the peer protocol as `POST /rpc`, so the `--peers` addresses work for
//!   bids and protocol traffic alike.
//!
//! [`HttpTransport`] is the outbound half: a reqwest client posting the
//! same envelope to peers with bounded timeouts.

#![warn(missing_docs)]

mod client;
mod error;
mod handlers;

pub use client::{HttpTransport, DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use gavel_core::Node;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use handlers::{
    add_handler, auction_handler, bid_handler, checkpoint_handler, index_handler, rpc_handler,
    state_handler,
};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Address to bind the server on
    pub bind_addr: SocketAddr,
}

/// HTTP server for one auction node
pub struct ApiServer {
    config: ApiConfig,
    node: Arc<Node>,
}

impl ApiServer {
    /// Create a server for the given node
    pub fn new(node: Arc<Node>, config: ApiConfig) -> Self {
        Self { config, node }
    }

    /// Build the router with every route and middleware
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler))
            .route("/state", get(state_handler))
            .route("/bid", post(bid_handler))
            .route("/add", post(add_handler))
            .route("/auction", post(auction_handler))
            .route("/checkpoint", get(checkpoint_handler))
            .route("/rpc", post(rpc_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.node))
    }

    /// Bind and serve forever
    ///
    /// Failing to bind is the one fatal startup error the node has.
    pub async fn serve(self) -> ApiResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|error| {
                ApiError::Internal(format!("bind {}: {error}", self.config.bind_addr))
            })?;
        info!(addr = %self.config.bind_addr, node = %self.node.id(), "http listener bound");
        axum::serve(listener, self.router())
            .await
            .map_err(|error| ApiError::Internal(error.to_string()))
    }
}
