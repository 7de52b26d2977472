//! Two-phase-commit bid engine
//!
//! The coordinator turns a candidate bid into a cluster-wide commit or
//! abort: it enters the critical section, re-validates, fans PREPARE out to
//! every peer, and counts YES votes against the quorum
//! `⌊(peers + 1) / 2⌋ + 1` (itself included, starting at one). Collection
//! stops as soon as the outcome is settled either way or the vote window
//! closes, at which point every outstanding peer counts as NO. The decision
//! is applied locally and broadcast fire-and-forget; peers that lost their
//! pending entry fall back to the bid carried in the decision.
//!
//! There is no write-ahead log. A peer that prepared a transaction and
//! never heard a decision drops it once the TTL sweeper finds it.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::info;

use crate::error::{Error, Result};
use crate::node::{now_unix, CoordinatorRoute, Node};
use crate::rpc::{
    Acceptance, BidArgs, DecisionArgs, PrepareArgs, PrepareReply, Request, Response,
};

/// A prepared-but-undecided transaction
pub(crate) struct PendingTxn {
    pub(crate) bid: BidArgs,
    pub(crate) prepared_at: Instant,
}

impl Node {
    /// Accept a bid on any node: run it here when coordinating, else
    /// forward it to the coordinator
    ///
    /// Errors mean the coordinator could not be reached; policy rejections
    /// come back as an unaccepted [`Acceptance`].
    pub async fn submit_bid(self: Arc<Self>, amount: u64, bidder: String) -> Result<Acceptance> {
        match self.coordinator_route() {
            CoordinatorRoute::Local => Ok(self.propose_bid(amount, bidder).await),
            CoordinatorRoute::Remote(addr) => {
                let bid = BidArgs { amount, bidder };
                match self
                    .transport
                    .call(&addr, Request::SubmitBidToCoordinator(bid))
                    .await?
                {
                    Response::SubmitBid(outcome) => Ok(outcome),
                    _ => Err(Error::UnexpectedReply {
                        peer: addr,
                        method: "SubmitBidToCoordinator",
                    }),
                }
            }
            CoordinatorRoute::Unknown => Err(Error::CoordinatorUnavailable),
        }
    }

    /// Run the full bid protocol as coordinator
    pub async fn propose_bid(self: Arc<Self>, amount: u64, bidder: String) -> Acceptance {
        let bid = BidArgs { amount, bidder };
        if !self.can_prepare(&bid) {
            return Acceptance::rejected(
                "Bid must be higher than current highest bid (or auction inactive)",
            );
        }

        self.mutex.acquire().await;
        let outcome = self.run_bid_round(&bid).await;
        self.mutex.release();

        if outcome.accepted {
            self.broadcast_snapshot();
            Arc::clone(&self).maybe_extend_deadline();
        }
        outcome
    }

    fn can_prepare(&self, bid: &BidArgs) -> bool {
        self.state.lock().can_accept(bid.amount, now_unix())
    }

    /// Prepare, collect votes, decide. Runs inside the critical section.
    async fn run_bid_round(&self, bid: &BidArgs) -> Acceptance {
        if !self.can_prepare(bid) {
            return Acceptance::rejected("Bid became stale during coordination");
        }

        let txn_id = format!("{}-{}", self.config.id, self.clock.tick());
        let quorum = (self.config.peers.len() + 1) / 2 + 1;
        let mut votes = 1usize;
        self.pending.insert(
            txn_id.clone(),
            PendingTxn { bid: bid.clone(), prepared_at: Instant::now() },
        );

        let (tx, mut rx) = mpsc::channel::<bool>(self.config.peers.len().max(1));
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let tx = tx.clone();
            let args = PrepareArgs {
                txn_id: txn_id.clone(),
                bid: bid.clone(),
                timestamp: self.clock.tick(),
            };
            let peer = peer.clone();
            tokio::spawn(async move {
                let vote = matches!(
                    transport.call(&peer, Request::PrepareBid(args)).await,
                    Ok(Response::Prepare(PrepareReply { vote: true, .. }))
                );
                let _ = tx.send(vote).await;
            });
        }
        drop(tx);

        let mut outstanding = self.config.peers.len();
        let window_closes = tokio::time::Instant::now() + self.config.vote_wait;
        while outstanding > 0 && votes < quorum && votes + outstanding >= quorum {
            match tokio::time::timeout_at(window_closes, rx.recv()).await {
                Ok(Some(vote)) => {
                    outstanding -= 1;
                    if vote {
                        votes += 1;
                    }
                }
                Ok(None) => break,
                // Window closed: every outstanding peer counts as NO.
                Err(_) => outstanding = 0,
            }
        }

        let commit = votes >= quorum;
        self.apply_decision(&txn_id, commit, bid);

        let decision = DecisionArgs {
            txn_id: txn_id.clone(),
            commit,
            bid: bid.clone(),
            leader: self.config.id.clone(),
        };
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let msg = decision.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let _ = transport.call(&peer, Request::DecideBid(msg)).await;
            });
        }

        if commit {
            info!(
                node = %self.config.id,
                txn = %txn_id,
                amount = bid.amount,
                bidder = %bid.bidder,
                votes,
                quorum,
                "bid committed by quorum"
            );
            Acceptance::ok("Bid committed by quorum")
        } else {
            info!(node = %self.config.id, txn = %txn_id, votes, quorum, "bid aborted");
            Acceptance::rejected(format!("Bid aborted: quorum not reached ({votes}/{quorum})"))
        }
    }

    /// Vote on a PREPARE from the coordinator
    pub(crate) fn handle_prepare(&self, args: PrepareArgs) -> PrepareReply {
        self.clock.update(args.timestamp);
        if !self.state.lock().can_accept(args.bid.amount, now_unix()) {
            return PrepareReply {
                vote: false,
                reason: "bid not higher, auction inactive, or time expired".into(),
            };
        }
        self.pending.insert(
            args.txn_id,
            PendingTxn { bid: args.bid, prepared_at: Instant::now() },
        );
        PrepareReply { vote: true, reason: "prepared".into() }
    }

    /// Apply a commit or abort decision
    ///
    /// The pending entry is consumed either way; a decision for an unknown
    /// transaction falls back to the bid it carries. Re-applying a commit
    /// is harmless because the state only adopts strictly higher bids.
    pub(crate) fn apply_decision(&self, txn_id: &str, commit: bool, fallback: &BidArgs) {
        let bid = self
            .pending
            .remove(txn_id)
            .map(|(_, pending)| pending.bid)
            .unwrap_or_else(|| fallback.clone());
        if !commit {
            return;
        }
        self.state.lock().commit_bid(bid.amount, &bid.bidder);
    }

    /// Drop prepared transactions whose decision never arrived
    pub(crate) fn sweep_once(&self) {
        let ttl = self.config.txn_ttl;
        self.pending.retain(|txn_id, pending| {
            let keep = pending.prepared_at.elapsed() <= ttl;
            if !keep {
                info!(node = %self.config.id, txn = %txn_id, "dropping stale prepared transaction");
            }
            keep
        });
    }

    /// Periodic stale-transaction sweeper
    pub(crate) async fn sweep_stale_txns(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(self.config.sweep_interval) => self.sweep_once(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn call(&self, peer: &str, _request: Request) -> Result<Response> {
            Err(Error::Unreachable(peer.to_string()))
        }
    }

    fn lone_node(dir: &tempfile::TempDir) -> Arc<Node> {
        let config = NodeConfig::new("Node1", "node1:0", vec![]).with_checkpoint_dir(dir.path());
        let node = Node::new(config, Arc::new(DeadTransport)).unwrap();
        node.state.lock().deadline_unix = now_unix() + 120;
        node
    }

    #[tokio::test]
    async fn a_lone_coordinator_commits_by_itself() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);

        let outcome = Arc::clone(&node).propose_bid(500, "alice".into()).await;
        assert!(outcome.accepted, "{}", outcome.message);
        assert_eq!(node.state.lock().current_highest_bid, 500);
        assert_eq!(node.state.lock().current_winner, "alice");

        // The same amount again is no longer higher.
        let outcome = Arc::clone(&node).propose_bid(500, "bob".into()).await;
        assert!(!outcome.accepted);
        assert_eq!(node.state.lock().current_winner, "alice");
    }

    #[tokio::test]
    async fn prepare_votes_yes_then_records_the_pending_txn() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);

        let reply = node.handle_prepare(PrepareArgs {
            txn_id: "Node4-9".into(),
            bid: BidArgs { amount: 600, bidder: "carol".into() },
            timestamp: 9,
        });
        assert!(reply.vote);
        assert!(node.pending.contains_key("Node4-9"));

        let reply = node.handle_prepare(PrepareArgs {
            txn_id: "Node4-10".into(),
            bid: BidArgs { amount: 100, bidder: "carol".into() },
            timestamp: 10,
        });
        assert!(!reply.vote);
        assert!(!node.pending.contains_key("Node4-10"));
    }

    #[tokio::test]
    async fn duplicate_commit_decisions_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let bid = BidArgs { amount: 700, bidder: "dave".into() };

        node.apply_decision("Node4-1", true, &bid);
        assert_eq!(node.state.lock().current_highest_bid, 700);
        assert_eq!(node.state.lock().current_winner, "dave");

        // Redelivered decision: same state afterwards.
        node.apply_decision("Node4-1", true, &bid);
        assert_eq!(node.state.lock().current_highest_bid, 700);
        assert_eq!(node.state.lock().current_winner, "dave");
    }

    #[tokio::test]
    async fn abort_decisions_only_clear_the_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let bid = BidArgs { amount: 800, bidder: "erin".into() };

        node.handle_prepare(PrepareArgs { txn_id: "t1".into(), bid: bid.clone(), timestamp: 1 });
        node.apply_decision("t1", false, &bid);
        assert!(!node.pending.contains_key("t1"));
        assert_eq!(node.state.lock().current_winner, "");
    }

    #[tokio::test]
    async fn the_sweeper_drops_only_expired_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);

        node.pending.insert(
            "old".into(),
            PendingTxn {
                bid: BidArgs { amount: 1, bidder: "x".into() },
                prepared_at: Instant::now() - Duration::from_secs(9),
            },
        );
        node.pending.insert(
            "fresh".into(),
            PendingTxn {
                bid: BidArgs { amount: 2, bidder: "y".into() },
                prepared_at: Instant::now(),
            },
        );

        node.sweep_once();
        assert!(!node.pending.contains_key("old"));
        assert!(node.pending.contains_key("fresh"));
    }
}
