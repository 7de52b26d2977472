//! Transport seam for the peer protocol
//!
//! The core only assumes a unary request/response call with a bounded
//! timeout; a peer that fails to answer is indistinguishable from one that
//! refused. [`LocalRouter`] is an in-process implementation over tokio
//! channels, suitable for tests and single-machine clusters; the HTTP
//! transport for real deployments lives in the API crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::rpc::{Request, Response, RpcService};

/// Unary request/response call to a peer
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Call `peer` (a `host:port` address) with one request
    ///
    /// Dial failures, timeouts, and malformed replies all surface as
    /// errors; callers treat every error as "no answer".
    async fn call(&self, peer: &str, request: Request) -> Result<Response>;
}

struct Inbound {
    request: Request,
    reply_tx: oneshot::Sender<Response>,
}

#[derive(Default)]
struct RouterInner {
    nodes: DashMap<String, mpsc::Sender<Inbound>>,
    down: DashSet<String>,
}

impl RouterInner {
    fn reachable(&self, addr: &str) -> bool {
        !self.down.contains(addr)
    }
}

/// In-process message router connecting nodes by address
///
/// Each registered node gets a channel drained by a serve loop that
/// dispatches every request on its own task, so a node stays responsive
/// to inbound traffic while it waits on its own fan-outs. Addresses can be
/// marked down to simulate partitions. Cloning the router clones a handle
/// to the same cluster.
#[derive(Clone, Default)]
pub struct LocalRouter {
    inner: Arc<RouterInner>,
}

impl LocalRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's service under its address
    pub fn register(&self, addr: impl Into<String>, service: Arc<dyn RpcService>) {
        let (tx, mut rx) = mpsc::channel::<Inbound>(64);
        self.inner.nodes.insert(addr.into(), tx);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let response = service.dispatch(inbound.request).await;
                    let _ = inbound.reply_tx.send(response);
                });
            }
        });
    }

    /// Remove a node entirely
    pub fn unregister(&self, addr: &str) {
        self.inner.nodes.remove(addr);
    }

    /// Cut an address off from the cluster in both directions
    pub fn partition(&self, addr: &str) {
        self.inner.down.insert(addr.to_string());
    }

    /// Undo [`partition`](Self::partition)
    pub fn heal(&self, addr: &str) {
        self.inner.down.remove(addr);
    }

    /// Build a transport whose calls originate from `origin`
    pub fn transport(&self, origin: impl Into<String>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            inner: Arc::clone(&self.inner),
            origin: origin.into(),
            call_timeout: Duration::from_millis(500),
        })
    }
}

/// [`Transport`] over a [`LocalRouter`]
pub struct LocalTransport {
    inner: Arc<RouterInner>,
    origin: String,
    call_timeout: Duration,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, peer: &str, request: Request) -> Result<Response> {
        if !self.inner.reachable(&self.origin) || !self.inner.reachable(peer) {
            return Err(Error::Unreachable(peer.to_string()));
        }
        let sender = self
            .inner
            .nodes
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Unreachable(peer.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Inbound { request, reply_tx })
            .await
            .map_err(|_| Error::Unreachable(peer.to_string()))?;

        match timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Unreachable(peer.to_string())),
            Err(_) => Err(Error::Timeout(peer.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Acceptance, BidArgs};

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn dispatch(self: Arc<Self>, request: Request) -> Response {
            match request {
                Request::SubmitBidToCoordinator(bid) => {
                    Response::SubmitBid(Acceptance::ok(format!("saw {}", bid.amount)))
                }
                _ => Response::Sync(false),
            }
        }
    }

    #[tokio::test]
    async fn calls_reach_registered_nodes() {
        let router = LocalRouter::new();
        router.register("n2", Arc::new(EchoService));
        let transport = router.transport("n1");

        let bid = BidArgs { amount: 500, bidder: "alice".into() };
        let response = transport
            .call("n2", Request::SubmitBidToCoordinator(bid))
            .await
            .unwrap();
        match response {
            Response::SubmitBid(outcome) => assert_eq!(outcome.message, "saw 500"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_peers_are_unreachable() {
        let router = LocalRouter::new();
        let transport = router.transport("n1");
        let err = transport.call("nowhere", Request::GetQueueState).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn partitions_cut_both_directions() {
        let router = LocalRouter::new();
        router.register("n1", Arc::new(EchoService));
        router.register("n2", Arc::new(EchoService));

        router.partition("n2");
        let from_n1 = router.transport("n1");
        assert!(from_n1.call("n2", Request::GetQueueState).await.is_err());
        let from_n2 = router.transport("n2");
        assert!(from_n2.call("n1", Request::GetQueueState).await.is_err());

        router.heal("n2");
        assert!(from_n1.call("n2", Request::GetQueueState).await.is_ok());
    }
}
