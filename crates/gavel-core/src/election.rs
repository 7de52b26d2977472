//! Bully leader election with heartbeat failure detection
//!
//! The highest-ranked live node coordinates the cluster. A node that
//! suspects the leader is gone probes every peer with ELECTION; any peer
//! that outranks it answers OK and starts its own election. A node that
//! hears no OK within the election window declares itself coordinator,
//! bumps its epoch, announces COORDINATOR to everyone, and starts the
//! heartbeat loop. Followers that miss heartbeats long enough re-elect.
//!
//! Epochs make reigns comparable: COORDINATOR and HEARTBEAT messages carry
//! the sender's epoch, and any announcement older than the highest epoch a
//! node has observed is ignored. A healed stale leader therefore cannot
//! re-assert itself with old heartbeats.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::rpc::{BullyMessage, NodeId, Request, Response};

/// Election state guarded by the leader mutex
#[derive(Debug, Default)]
pub(crate) struct LeaderState {
    /// Coordinator this node currently follows; `None` until the first
    /// election or announcement
    pub(crate) coordinator_id: Option<NodeId>,

    /// Highest coordinator epoch observed so far
    pub(crate) epoch: u64,
}

impl Node {
    fn leads(&self) -> bool {
        self.leader.lock().coordinator_id.as_deref() == Some(self.config.id.as_str())
    }

    fn bully_message(&self, epoch: u64) -> BullyMessage {
        BullyMessage {
            node_id: self.config.id.clone(),
            rank: self.rank,
            addr: self.config.addr.clone(),
            epoch,
        }
    }

    /// Watch the leader and re-elect on heartbeat silence
    ///
    /// Runs for the lifetime of the node; kicks off the initial election.
    pub(crate) async fn monitor_leader(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        Arc::clone(&self).start_election().await;

        loop {
            if self.leads() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = sleep(self.config.leader_idle) => continue,
                }
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.heartbeat_seen.notified() => {}
                _ = sleep(self.config.heartbeat_timeout) => {
                    warn!(node = %self.config.id, "leader heartbeat timed out");
                    Arc::clone(&self).start_election().await;
                }
            }
        }
    }

    /// Probe every peer; declare self coordinator if nobody outranks us
    pub(crate) async fn start_election(self: Arc<Self>) {
        if self.election_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.config.id, rank = self.rank, "starting election");

        let (tx, mut rx) = mpsc::channel::<()>(self.config.peers.len().max(1));
        let probe = self.bully_message(self.current_epoch());
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let tx = tx.clone();
            let msg = probe.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Ok(Response::Election(true)) =
                    transport.call(&peer, Request::HandleElection(msg)).await
                {
                    let _ = tx.send(()).await;
                }
            });
        }
        drop(tx);

        let outranked = matches!(
            timeout(self.config.election_window, rx.recv()).await,
            Ok(Some(()))
        );
        if outranked {
            debug!(node = %self.config.id, "a higher-ranked peer is taking over");
        } else {
            Arc::clone(&self).become_coordinator();
        }
        self.election_in_flight.store(false, Ordering::SeqCst);
    }

    /// Assume coordination: bump the epoch, announce, heartbeat, resume timers
    fn become_coordinator(self: Arc<Self>) {
        let epoch = {
            let mut leader = self.leader.lock();
            leader.epoch += 1;
            leader.coordinator_id = Some(self.config.id.clone());
            leader.epoch
        };
        info!(node = %self.config.id, epoch, "no higher-ranked peer answered, assuming coordination");

        let announcement = self.bully_message(epoch);
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let msg = announcement.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let _ = transport.call(&peer, Request::HandleCoordinator(msg)).await;
            });
        }

        let node = Arc::clone(&self);
        tokio::spawn(async move { node.heartbeat_loop(epoch).await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.on_become_coordinator().await });
    }

    /// Broadcast heartbeats while this node still leads the given epoch
    async fn heartbeat_loop(self: Arc<Self>, epoch: u64) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            {
                let leader = self.leader.lock();
                let still_leading = leader.coordinator_id.as_deref()
                    == Some(self.config.id.as_str())
                    && leader.epoch == epoch;
                if !still_leading {
                    break;
                }
            }
            let beat = self.bully_message(epoch);
            for peer in &self.config.peers {
                let transport = Arc::clone(&self.transport);
                let msg = beat.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let _ = transport.call(&peer, Request::HandleHeartbeat(msg)).await;
                });
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
        }
        debug!(node = %self.config.id, epoch, "heartbeat loop ended");
    }

    /// Inbound ELECTION probe; true means "I outrank you and will take over"
    pub(crate) fn handle_election(self: Arc<Self>, msg: BullyMessage) -> bool {
        self.learn_peer(&msg.node_id, &msg.addr);
        let take_over = self.rank > msg.rank;
        if take_over {
            debug!(node = %self.config.id, challenger = %msg.node_id, "outranking challenger, countering");
            let node = Arc::clone(&self);
            tokio::spawn(async move { node.start_election().await });
        }
        take_over
    }

    /// Inbound COORDINATOR announcement; false when the epoch is stale
    pub(crate) fn accept_coordinator(&self, msg: BullyMessage) -> bool {
        self.learn_peer(&msg.node_id, &msg.addr);
        {
            let mut leader = self.leader.lock();
            if msg.epoch < leader.epoch {
                warn!(
                    node = %self.config.id,
                    claimant = %msg.node_id,
                    claimed = msg.epoch,
                    current = leader.epoch,
                    "ignoring stale coordinator announcement"
                );
                return false;
            }
            if leader.coordinator_id.as_deref() != Some(msg.node_id.as_str()) {
                info!(node = %self.config.id, leader = %msg.node_id, epoch = msg.epoch, "new coordinator");
            }
            leader.epoch = msg.epoch;
            leader.coordinator_id = Some(msg.node_id.clone());
        }
        self.heartbeat_seen.notify_one();
        true
    }

    /// Inbound HEARTBEAT; false when refused
    ///
    /// A leader refuses heartbeats from lower-ranked claimants; everyone
    /// ignores heartbeats from a stale epoch. An accepted heartbeat also
    /// repairs a follower that missed the COORDINATOR announcement.
    pub(crate) fn observe_heartbeat(&self, msg: BullyMessage) -> bool {
        {
            let mut leader = self.leader.lock();
            let i_lead = leader.coordinator_id.as_deref() == Some(self.config.id.as_str());
            if i_lead && msg.rank < self.rank {
                return false;
            }
            if msg.epoch < leader.epoch {
                return false;
            }
            leader.epoch = msg.epoch;
            leader.coordinator_id = Some(msg.node_id.clone());
        }
        self.learn_peer(&msg.node_id, &msg.addr);
        self.heartbeat_seen.notify_one();
        true
    }
}
