//! Ricart–Agrawala distributed mutual exclusion
//!
//! One [`RaMutex`] per node guards the cluster-wide critical section that
//! serialises every state-mutating operation. A node that wants the CS
//! stamps a request with its Lamport clock, fans it out to every peer, and
//! waits for one reply per peer. Peers reply immediately unless they are
//! themselves requesting with an earlier stamp (node id breaks ties), in
//! which case the reply is deferred until they release.
//!
//! A peer that cannot be reached has its reply forged locally, so
//! acquisition always terminates; the cost is that a crashed peer which
//! recovers mid-section is not excluded.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::LamportClock;
use crate::rpc::{NodeId, RaReplyArgs, RaRequestArgs, Request, Response};
use crate::transport::Transport;

#[derive(Default)]
struct RaState {
    requesting: bool,
    request_time: u64,
    awaiting: usize,
    deferred: Vec<String>,
    reply_tx: Option<mpsc::UnboundedSender<()>>,
    holder_gate: Option<tokio::sync::OwnedMutexGuard<()>>,
}

/// Per-node Ricart–Agrawala state and driver
pub struct RaMutex {
    node_id: NodeId,
    addr: String,
    peers: Vec<String>,
    clock: Arc<LamportClock>,
    transport: Arc<dyn Transport>,
    inner: Mutex<RaState>,
    // Serialises local users; the protocol serialises across nodes.
    local_gate: Arc<tokio::sync::Mutex<()>>,
}

impl RaMutex {
    /// Create the mutex for one node
    pub fn new(
        node_id: NodeId,
        addr: String,
        peers: Vec<String>,
        clock: Arc<LamportClock>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node_id,
            addr,
            peers,
            clock,
            transport,
            inner: Mutex::new(RaState::default()),
            local_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Enter the cluster-wide critical section
    ///
    /// Blocks until one reply per peer has been collected. Failed calls
    /// count as replies, so the wait is bounded by the transport timeout.
    pub async fn acquire(&self) {
        let gate = Arc::clone(&self.local_gate).lock_owned().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request_time = {
            let mut st = self.inner.lock();
            st.requesting = true;
            st.request_time = self.clock.tick();
            st.awaiting = self.peers.len();
            st.reply_tx = Some(tx.clone());
            st.holder_gate = Some(gate);
            st.request_time
        };
        debug!(node = %self.node_id, time = request_time, "requesting critical section");

        for peer in &self.peers {
            let transport = Arc::clone(&self.transport);
            let tx = tx.clone();
            let node_id = self.node_id.clone();
            let peer = peer.clone();
            let args = RaRequestArgs {
                timestamp: request_time,
                node_id: node_id.clone(),
                addr: self.addr.clone(),
            };
            tokio::spawn(async move {
                match transport.call(&peer, Request::HandleRARequest(args)).await {
                    Ok(Response::RaRequest(true)) => {
                        let _ = tx.send(());
                    }
                    Ok(Response::RaRequest(false)) => {
                        // Deferred; the peer replies when it releases.
                    }
                    Ok(_) | Err(_) => {
                        // Unreachable or confused peer: forge its reply so
                        // acquisition cannot hang on a dead node.
                        warn!(node = %node_id, peer = %peer, "no usable reply, forging one");
                        let _ = tx.send(());
                    }
                }
            });
        }
        drop(tx);

        for _ in 0..self.peers.len() {
            let _ = rx.recv().await;
        }
        debug!(node = %self.node_id, "entered critical section");
    }

    /// Leave the critical section and answer every deferred peer
    pub fn release(&self) {
        let (deferred, gate) = {
            let mut st = self.inner.lock();
            st.requesting = false;
            st.awaiting = 0;
            st.reply_tx = None;
            (std::mem::take(&mut st.deferred), st.holder_gate.take())
        };
        debug!(node = %self.node_id, deferred = deferred.len(), "releasing critical section");

        for peer in deferred {
            let transport = Arc::clone(&self.transport);
            let node_id = self.node_id.clone();
            tokio::spawn(async move {
                let args = RaReplyArgs { node_id: node_id.clone() };
                if let Err(error) = transport
                    .call(&peer, Request::HandleRADeferredReply(args))
                    .await
                {
                    warn!(node = %node_id, peer = %peer, %error, "deferred reply lost");
                }
            });
        }

        drop(gate);
    }

    /// Handle an inbound CS request; returns true to reply immediately
    ///
    /// The reply is deferred iff this node is requesting with an earlier
    /// stamp, or an equal stamp and a smaller node id.
    pub fn receive_request(&self, args: &RaRequestArgs) -> bool {
        self.clock.update(args.timestamp);

        let mut st = self.inner.lock();
        let defer = st.requesting
            && (st.request_time < args.timestamp
                || (st.request_time == args.timestamp && self.node_id < args.node_id));
        if defer {
            debug!(node = %self.node_id, from = %args.node_id, "deferring reply");
            st.deferred.push(args.addr.clone());
            false
        } else {
            debug!(node = %self.node_id, from = %args.node_id, "replying immediately");
            true
        }
    }

    /// Count one deferred reply toward the current acquisition
    ///
    /// Replies arriving outside an acquisition round are dropped.
    pub fn note_reply(&self) {
        let mut st = self.inner.lock();
        if st.awaiting > 0 {
            st.awaiting -= 1;
            if let Some(tx) = &st.reply_tx {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn call(&self, peer: &str, _request: Request) -> Result<Response> {
            Err(Error::Unreachable(peer.to_string()))
        }
    }

    fn mutex_with_peers(peers: Vec<String>) -> RaMutex {
        RaMutex::new(
            "Node2".into(),
            "n2".into(),
            peers,
            Arc::new(LamportClock::new()),
            Arc::new(DeadTransport),
        )
    }

    fn request(timestamp: u64, node_id: &str) -> RaRequestArgs {
        RaRequestArgs { timestamp, node_id: node_id.into(), addr: node_id.to_lowercase() }
    }

    #[tokio::test]
    async fn idle_node_replies_immediately() {
        let mutex = mutex_with_peers(vec![]);
        assert!(mutex.receive_request(&request(5, "Node1")));
    }

    #[tokio::test]
    async fn requester_defers_later_stamps_and_yields_to_earlier_ones() {
        let mutex = mutex_with_peers(vec![]);
        mutex.acquire().await;
        let my_time = mutex.inner.lock().request_time;

        // A later request waits for us.
        assert!(!mutex.receive_request(&request(my_time + 1, "Node1")));
        // An earlier request goes first.
        assert!(mutex.receive_request(&request(my_time.saturating_sub(1), "Node1")));
        mutex.release();
    }

    #[tokio::test]
    async fn equal_stamps_break_ties_by_node_id() {
        let mutex = mutex_with_peers(vec![]);
        mutex.acquire().await;
        let my_time = mutex.inner.lock().request_time;

        // Node2 defers to equal-stamped higher ids, not to lower ones.
        assert!(!mutex.receive_request(&request(my_time, "Node3")));
        assert!(mutex.receive_request(&request(my_time, "Node1")));
        mutex.release();
    }

    #[tokio::test]
    async fn dead_peers_do_not_block_acquisition() {
        let mutex = mutex_with_peers(vec!["n1".into(), "n3".into()]);
        // Both peers are unreachable; forged replies must let this return.
        tokio::time::timeout(std::time::Duration::from_secs(1), mutex.acquire())
            .await
            .expect("acquisition should not hang on dead peers");
        mutex.release();
    }

    #[tokio::test]
    async fn release_drains_the_deferred_queue() {
        let mutex = mutex_with_peers(vec![]);
        mutex.acquire().await;
        let my_time = mutex.inner.lock().request_time;
        mutex.receive_request(&request(my_time + 3, "Node9"));
        assert_eq!(mutex.inner.lock().deferred.len(), 1);
        mutex.release();
        assert!(mutex.inner.lock().deferred.is_empty());
    }
}
