//! Snapshot replication between coordinator and followers
//!
//! The coordinator pushes a full snapshot after every state mutation;
//! followers additionally pull one every sync interval, which self-heals
//! any follower that missed a push. Both paths apply through the same
//! merge rule, so the results ledger never shrinks, and snapshots from a
//! stale coordinator epoch are discarded.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use crate::node::{CoordinatorRoute, Node};
use crate::rpc::{Request, Response};
use crate::state::QueueSnapshot;

impl Node {
    /// Push the current snapshot to every peer, fire-and-forget
    pub(crate) fn broadcast_snapshot(&self) {
        let snapshot = self.snapshot();
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let snap = snapshot.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(error) = transport.call(&peer, Request::SyncQueueState(snap)).await {
                    debug!(peer = %peer, %error, "snapshot push failed");
                }
            });
        }
    }

    /// Apply a snapshot received from the coordinator
    ///
    /// Returns false when the snapshot belongs to a stale epoch and was
    /// discarded.
    pub(crate) fn apply_remote_snapshot(&self, snapshot: QueueSnapshot) -> bool {
        {
            let leader = self.leader.lock();
            if snapshot.epoch < leader.epoch {
                debug!(
                    node = %self.config.id,
                    snapshot_epoch = snapshot.epoch,
                    current_epoch = leader.epoch,
                    "discarding snapshot from a stale epoch"
                );
                return false;
            }
        }
        self.state.lock().apply_snapshot(snapshot);
        true
    }

    /// Follower loop: pull the coordinator's state every sync interval
    pub(crate) async fn pull_sync_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(self.config.sync_interval) => {}
            }
            let addr = match self.coordinator_route() {
                CoordinatorRoute::Remote(addr) => addr,
                _ => continue,
            };
            match self.transport.call(&addr, Request::GetQueueState).await {
                Ok(Response::QueueState(snapshot)) => {
                    self.apply_remote_snapshot(snapshot);
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(node = %self.config.id, peer = %addr, %error, "state pull failed");
                }
            }
        }
    }
}
