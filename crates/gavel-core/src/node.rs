//! Node composition and request dispatch
//!
//! A [`Node`] owns one copy of every subsystem: the Lamport clock, the
//! auction state behind its mutex, the distributed mutex, election state,
//! the pending-transaction table, and the checkpoint store. Cross-node
//! behaviour lives in the protocol modules, which extend `Node` with the
//! election, bid, timer, replication, and checkpoint drivers.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::clock::LamportClock;
use crate::election::LeaderState;
use crate::error::{Error, Result};
use crate::rpc::{Acceptance, NodeId, Request, Response, RpcService};
use crate::state::{AuctionState, QueueSnapshot};
use crate::transport::Transport;
use crate::twopc::PendingTxn;
use crate::mutex::RaMutex;

/// Wall-clock seconds since the unix epoch
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Derive a node's rank from its id (`Node3` → 3)
pub fn parse_rank(id: &str) -> Result<u32> {
    id.strip_prefix("Node")
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .ok_or_else(|| Error::InvalidNodeId(id.to_string()))
}

/// Identity, peers, and every protocol timing of one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id (`Node<number>`; the number is its election rank)
    pub id: NodeId,

    /// Address this node advertises to peers
    pub addr: String,

    /// Peer addresses (`host:port`), excluding this node
    pub peers: Vec<String>,

    /// Directory for checkpoint files
    pub checkpoint_dir: PathBuf,

    /// How long 2PC waits for votes
    pub vote_wait: Duration,

    /// How long an election waits for a higher-ranked OK
    pub election_window: Duration,

    /// Interval between coordinator heartbeats
    pub heartbeat_interval: Duration,

    /// Heartbeat silence after which a follower starts an election
    pub heartbeat_timeout: Duration,

    /// How often the leader re-checks its own role in the monitor loop
    pub leader_idle: Duration,

    /// Interval between follower state pulls
    pub sync_interval: Duration,

    /// Interval between periodic global checkpoints
    pub checkpoint_interval: Duration,

    /// How long a checkpoint round waits for acks
    pub checkpoint_ack_timeout: Duration,

    /// Age at which a prepared-but-undecided transaction is dropped
    pub txn_ttl: Duration,

    /// Interval of the stale-transaction sweeper
    pub sweep_interval: Duration,

    /// Seconds before the deadline within which a commit extends it
    pub anti_snipe_window: i64,
}

impl NodeConfig {
    /// Configuration with the default protocol timings
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            peers,
            checkpoint_dir: PathBuf::from("checkpoints"),
            vote_wait: Duration::from_millis(2500),
            election_window: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            leader_idle: Duration::from_secs(2),
            sync_interval: Duration::from_secs(2),
            checkpoint_interval: Duration::from_secs(30),
            checkpoint_ack_timeout: Duration::from_secs(5),
            txn_ttl: Duration::from_secs(8),
            sweep_interval: Duration::from_secs(1),
            anti_snipe_window: 15,
        }
    }

    /// Set the checkpoint directory
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }
}

/// One auction cluster member
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) rank: u32,
    pub(crate) clock: Arc<LamportClock>,
    pub(crate) state: Mutex<AuctionState>,
    pub(crate) mutex: RaMutex,
    pub(crate) leader: Mutex<LeaderState>,
    pub(crate) directory: DashMap<NodeId, String>,
    pub(crate) pending: DashMap<String, PendingTxn>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) heartbeat_seen: Notify,
    pub(crate) election_in_flight: AtomicBool,
    pub(crate) shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Build a node, restoring its checkpoint if one exists
    ///
    /// A missing checkpoint seeds the default item list; an unreadable one
    /// is logged and treated as missing.
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let rank = parse_rank(&config.id)?;
        let clock = Arc::new(LamportClock::new());
        let checkpoints = CheckpointStore::new(config.checkpoint_dir.clone(), config.id.clone());

        let state = match checkpoints.load() {
            Ok(Some(cp)) => {
                info!(
                    node = %config.id,
                    lamport = cp.lamport_time,
                    results = cp.results.len(),
                    "restoring from checkpoint"
                );
                clock.advance_to(cp.lamport_time);
                cp.into_state()
            }
            Ok(None) => AuctionState::seeded(),
            Err(error) => {
                warn!(node = %config.id, %error, "could not read checkpoint, seeding defaults");
                AuctionState::seeded()
            }
        };

        let mutex = RaMutex::new(
            config.id.clone(),
            config.addr.clone(),
            config.peers.clone(),
            Arc::clone(&clock),
            Arc::clone(&transport),
        );
        let (shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            rank,
            clock,
            state: Mutex::new(state),
            mutex,
            leader: Mutex::new(LeaderState::default()),
            directory: DashMap::new(),
            pending: DashMap::new(),
            transport,
            checkpoints,
            heartbeat_seen: Notify::new(),
            election_in_flight: AtomicBool::new(false),
            shutdown,
            config,
        }))
    }

    /// Spawn the background loops: leader monitor, stale-transaction
    /// sweeper, follower state pull, and periodic checkpointing
    pub fn start(self: Arc<Self>) {
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.monitor_leader().await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.sweep_stale_txns().await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.pull_sync_loop().await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.periodic_checkpoints().await });
        info!(
            node = %self.config.id,
            addr = %self.config.addr,
            peers = self.config.peers.len(),
            "node started"
        );
    }

    /// Signal every background loop to stop
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// This node's id
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// This node's election rank
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// The advertised address
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// The id of the coordinator this node currently follows, if known
    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.leader.lock().coordinator_id.clone()
    }

    /// Whether this node currently acts as coordinator
    ///
    /// An unknown coordinator counts as "self": before the first election
    /// finishes, a node answers for itself rather than refusing traffic.
    pub fn is_coordinator(&self) -> bool {
        let leader = self.leader.lock();
        match &leader.coordinator_id {
            None => true,
            Some(id) => *id == self.config.id,
        }
    }

    /// The highest coordinator epoch observed so far
    pub fn current_epoch(&self) -> u64 {
        self.leader.lock().epoch
    }

    /// Serialisable copy of the local auction state
    pub fn snapshot(&self) -> QueueSnapshot {
        let epoch = self.current_epoch();
        self.state.lock().snapshot(epoch)
    }

    /// Raw contents of this node's checkpoint file, if one exists
    pub fn checkpoint_json(&self) -> Result<Option<String>> {
        self.checkpoints.read_raw()
    }

    /// Where to route a coordinator-only operation
    pub(crate) fn coordinator_route(&self) -> CoordinatorRoute {
        let leader = self.leader.lock();
        match &leader.coordinator_id {
            None => CoordinatorRoute::Local,
            Some(id) if *id == self.config.id => CoordinatorRoute::Local,
            Some(id) => match self.directory.get(id) {
                Some(entry) => CoordinatorRoute::Remote(entry.value().clone()),
                None => CoordinatorRoute::Unknown,
            },
        }
    }

    /// Record a peer's advertised address
    pub(crate) fn learn_peer(&self, id: &str, addr: &str) {
        if !addr.is_empty() && id != self.config.id {
            self.directory.insert(id.to_string(), addr.to_string());
        }
    }
}

/// Resolution of "who runs this coordinator-only operation"
pub(crate) enum CoordinatorRoute {
    /// Run it here
    Local,
    /// Forward to this address
    Remote(String),
    /// A coordinator is known by id but its address is not
    Unknown,
}

#[async_trait]
impl RpcService for Node {
    async fn dispatch(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::PrepareBid(args) => Response::Prepare(self.handle_prepare(args)),
            Request::DecideBid(args) => {
                self.apply_decision(&args.txn_id, args.commit, &args.bid);
                Response::Decide(true)
            }
            Request::SubmitBidToCoordinator(bid) => {
                if !self.is_coordinator() {
                    return Response::SubmitBid(Acceptance::rejected(
                        "This node is not the coordinator",
                    ));
                }
                Response::SubmitBid(self.propose_bid(bid.amount, bid.bidder).await)
            }
            Request::SubmitItemToCoordinator(args) => {
                if !self.is_coordinator() {
                    return Response::SubmitItem(Acceptance::rejected(
                        "This node is not the coordinator",
                    ));
                }
                Response::SubmitItem(self.coordinator_add_item(args).await)
            }
            Request::SubmitControlToCoordinator(args) => {
                if !self.is_coordinator() {
                    return Response::SubmitControl(Acceptance::rejected(
                        "This node is not the coordinator",
                    ));
                }
                Response::SubmitControl(self.coordinator_control(args.action).await)
            }
            Request::GetQueueState => Response::QueueState(self.snapshot()),
            Request::SyncQueueState(snapshot) => {
                Response::Sync(self.apply_remote_snapshot(snapshot))
            }
            Request::HandleRARequest(args) => {
                self.learn_peer(&args.node_id, &args.addr);
                Response::RaRequest(self.mutex.receive_request(&args))
            }
            Request::HandleRADeferredReply(_) => {
                self.mutex.note_reply();
                Response::RaReply(true)
            }
            Request::HandleElection(msg) => Response::Election(self.handle_election(msg)),
            Request::HandleCoordinator(msg) => Response::Coordinator(self.accept_coordinator(msg)),
            Request::HandleHeartbeat(msg) => Response::Heartbeat(self.observe_heartbeat(msg)),
            Request::TakeCheckpoint(args) => Response::Checkpoint(self.handle_take_checkpoint(args)),
        }
    }
}
