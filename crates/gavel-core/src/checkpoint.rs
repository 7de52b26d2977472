//! Coordinated checkpointing
//!
//! Every node can persist its full state to
//! `<dir>/checkpoint_<NodeID>.json`. Files are written to a `.tmp` sibling
//! and renamed into place, so a reader only ever sees a complete previous
//! version or the complete new one.
//!
//! Global rounds are coordinator-initiated: snapshot locally, broadcast
//! TAKE_CHECKPOINT, and collect acks for a bounded window. Ack collection
//! is advisory; a partial round is simply overwritten by the next one.
//! On startup a node restores from its own file before falling back to the
//! default seed.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::item::{AuctionItem, ItemResult};
use crate::node::{now_unix, Node};
use crate::rpc::{NodeId, Request, Response, TakeCheckpointArgs, TakeCheckpointReply};
use crate::state::AuctionState;

/// Full serialisable state of one node, as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    /// Owning node
    pub node_id: NodeId,

    /// Lamport time when the snapshot was taken
    pub lamport_time: u64,

    /// Currently open item, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<AuctionItem>,

    /// Items not yet started
    pub remaining_queue: Vec<AuctionItem>,

    /// Results ledger
    pub results: Vec<ItemResult>,

    /// Highest committed bid on the current item
    pub current_highest_bid: u64,

    /// Bidder holding the highest bid
    pub current_winner: String,

    /// Deadline of the current item, unix seconds
    pub deadline_unix: i64,

    /// Whether the auction was still running
    pub active: bool,

    /// Wall-clock unix seconds of the snapshot
    pub checkpoint_time: i64,

    /// Lamport stamp recorded alongside the snapshot
    pub lamport_stamp: u64,
}

impl CheckpointData {
    /// Rebuild the in-memory state this checkpoint describes
    pub(crate) fn into_state(self) -> AuctionState {
        AuctionState {
            queue: self.remaining_queue.into(),
            current_item: self.current_item,
            current_highest_bid: self.current_highest_bid,
            current_winner: self.current_winner,
            deadline_unix: self.deadline_unix,
            active: self.active,
            results: self.results,
        }
    }
}

/// On-disk checkpoint location for one node
pub struct CheckpointStore {
    dir: PathBuf,
    node_id: NodeId,
}

impl CheckpointStore {
    /// Store rooted at `dir` for the given node
    pub fn new(dir: PathBuf, node_id: NodeId) -> Self {
        Self { dir, node_id }
    }

    /// Path of this node's checkpoint file
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("checkpoint_{}.json", self.node_id))
    }

    /// Persist a checkpoint atomically (`.tmp` then rename)
    pub fn save(&self, data: &CheckpointData) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load this node's checkpoint; `None` when no file exists yet
    pub fn load(&self) -> Result<Option<CheckpointData>> {
        match fs::read(self.path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(Error::Io(error)),
        }
    }

    /// Raw file contents, for serving over HTTP
    pub fn read_raw(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.path()) {
            Ok(body) => Ok(Some(body)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(Error::Io(error)),
        }
    }
}

impl Node {
    /// Snapshot this node's state to disk; returns the recorded stamp
    pub(crate) fn take_local_checkpoint(&self) -> Result<u64> {
        let data = {
            let state = self.state.lock();
            let lamport = self.clock.read();
            CheckpointData {
                node_id: self.config.id.clone(),
                lamport_time: lamport,
                current_item: state.current_item.clone(),
                remaining_queue: state.queue.iter().cloned().collect(),
                results: state.results.clone(),
                current_highest_bid: state.current_highest_bid,
                current_winner: state.current_winner.clone(),
                deadline_unix: state.deadline_unix,
                active: state.active,
                checkpoint_time: now_unix(),
                lamport_stamp: lamport,
            }
        };
        self.checkpoints.save(&data)?;
        info!(
            node = %self.config.id,
            lamport = data.lamport_stamp,
            results = data.results.len(),
            "checkpoint saved"
        );
        Ok(data.lamport_stamp)
    }

    /// Inbound TAKE_CHECKPOINT: snapshot locally and ack
    pub(crate) fn handle_take_checkpoint(&self, args: TakeCheckpointArgs) -> TakeCheckpointReply {
        self.clock.update(args.lamport_time);
        debug!(node = %self.config.id, initiator = %args.initiator_id, "checkpoint requested");
        match self.take_local_checkpoint() {
            Ok(stamp) => TakeCheckpointReply { ok: true, error: None, lamport_stamp: stamp },
            Err(error) => TakeCheckpointReply {
                ok: false,
                error: Some(error.to_string()),
                lamport_stamp: self.clock.read(),
            },
        }
    }

    /// Coordinator-initiated global round with advisory ack collection
    ///
    /// Never blocks progress: a NACK or a timed-out peer is logged and the
    /// round simply ends. The next round overwrites whatever this one left.
    pub(crate) async fn initiate_global_checkpoint(&self) {
        if !self.is_coordinator() {
            return;
        }
        let lamport = self.clock.tick();
        info!(node = %self.config.id, lamport, "initiating global checkpoint");

        if let Err(error) = self.take_local_checkpoint() {
            warn!(node = %self.config.id, %error, "local checkpoint failed");
        }

        let (tx, mut rx) = mpsc::channel::<(String, Result<TakeCheckpointReply>)>(
            self.config.peers.len().max(1),
        );
        let args = TakeCheckpointArgs {
            initiator_id: self.config.id.clone(),
            lamport_time: lamport,
        };
        for peer in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let tx = tx.clone();
            let args = args.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let outcome = match transport.call(&peer, Request::TakeCheckpoint(args)).await {
                    Ok(Response::Checkpoint(reply)) => Ok(reply),
                    Ok(_) => Err(Error::UnexpectedReply { peer: peer.clone(), method: "TakeCheckpoint" }),
                    Err(error) => Err(error),
                };
                let _ = tx.send((peer, outcome)).await;
            });
        }
        drop(tx);

        let mut acks = 0usize;
        let window_closes = tokio::time::Instant::now() + self.config.checkpoint_ack_timeout;
        loop {
            match tokio::time::timeout_at(window_closes, rx.recv()).await {
                Ok(Some((peer, Ok(reply)))) if reply.ok => {
                    acks += 1;
                    debug!(node = %self.config.id, peer = %peer, lamport = reply.lamport_stamp, "checkpoint ack");
                }
                Ok(Some((peer, Ok(reply)))) => {
                    warn!(
                        node = %self.config.id,
                        peer = %peer,
                        error = reply.error.as_deref().unwrap_or("unspecified"),
                        "checkpoint nack"
                    );
                }
                Ok(Some((peer, Err(error)))) => {
                    warn!(node = %self.config.id, peer = %peer, %error, "checkpoint nack");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        node = %self.config.id,
                        acks,
                        peers = self.config.peers.len(),
                        "checkpoint ack collection timed out"
                    );
                    return;
                }
            }
        }
        info!(
            node = %self.config.id,
            saved = acks + 1,
            lamport,
            "global checkpoint complete"
        );
    }

    /// Periodic global checkpoints while coordinating
    pub(crate) async fn periodic_checkpoints(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(self.config.checkpoint_interval) => {}
            }
            if self.is_coordinator() {
                self.initiate_global_checkpoint().await;
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

    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn call(&self, peer: &str, _request: Request) -> Result<Response> {
            Err(Error::Unreachable(peer.to_string()))
        }
    }

    fn node_in(dir: &tempfile::TempDir) -> Arc<Node> {
        let config = NodeConfig::new("Node1", "node1:0", vec![]).with_checkpoint_dir(dir.path());
        Node::new(config, Arc::new(DeadTransport)).unwrap()
    }

    #[test]
    fn missing_checkpoints_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf(), "Node1".into());
        assert!(store.load().unwrap().is_none());
        assert!(store.read_raw().unwrap().is_none());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf(), "Node1".into());
        let data = CheckpointData {
            node_id: "Node1".into(),
            lamport_time: 7,
            current_item: None,
            remaining_queue: vec![],
            results: vec![],
            current_highest_bid: 0,
            current_winner: String::new(),
            deadline_unix: 0,
            active: false,
            checkpoint_time: 1_700_000_000,
            lamport_stamp: 7,
        };
        store.save(&data).unwrap();

        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.lamport_time, 7);
        assert_eq!(loaded.node_id, "Node1");
    }

    #[test]
    fn corrupt_checkpoints_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf(), "Node1".into());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().is_err());
    }

    #[tokio::test]
    async fn a_restarted_node_restores_its_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        {
            let node = node_in(&dir);
            {
                let mut state = node.state.lock();
                state.deadline_unix = now_unix() + 100;
                state.commit_bid(900, "alice");
            }
            node.clock.advance_to(41);
            node.clock.tick();
            node.take_local_checkpoint().unwrap();
        }

        let restored = node_in(&dir);
        let state = restored.state.lock();
        assert_eq!(state.current_highest_bid, 900);
        assert_eq!(state.current_winner, "alice");
        assert!(state.deadline_unix > 0);
        assert_eq!(state.queue.len(), 5);
        drop(state);
        // The clock resumes at or past the persisted stamp.
        assert!(restored.clock.read() >= 42);
    }

    #[tokio::test]
    async fn checkpoint_files_round_trip_the_wire_schema() {
        let dir = tempfile::tempdir().unwrap();
        let node = node_in(&dir);
        node.take_local_checkpoint().unwrap();

        let raw = node.checkpoint_json().unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["nodeId"], "Node1");
        assert!(value["lamportTime"].is_u64());
        assert!(value["remainingQueue"].is_array());
        assert!(value["currentHighestBid"].is_u64());
        assert!(value["checkpointTime"].is_i64());
        assert_eq!(value["currentItem"]["id"], "item-1");
    }
}
