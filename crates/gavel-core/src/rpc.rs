//! Peer protocol messages
//!
//! Every exchange between nodes is a unary request/response pair. Requests
//! are externally tagged by method name, replies by a matching kind, so the
//! whole protocol rides a single dispatch point regardless of which
//! transport carries it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::QueueSnapshot;

/// Node identifier (`Node1`, `Node2`, …)
pub type NodeId = String;

/// A candidate bid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidArgs {
    /// Offered amount
    pub amount: u64,
    /// Who is bidding
    pub bidder: String,
}

/// Phase 1 of the bid protocol: ask a peer to vote on a bid
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareArgs {
    /// Transaction id, unique per proposal
    pub txn_id: String,
    /// The bid being voted on
    pub bid: BidArgs,
    /// Lamport stamp of the proposal
    pub timestamp: u64,
}

/// A peer's vote on a prepared bid
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareReply {
    /// True to vote yes
    pub vote: bool,
    /// Human-readable justification
    pub reason: String,
}

/// Phase 2 of the bid protocol: the coordinator's decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionArgs {
    /// Transaction being decided
    pub txn_id: String,
    /// True to commit, false to abort
    pub commit: bool,
    /// The bid, for peers that lost their pending entry
    pub bid: BidArgs,
    /// The deciding coordinator
    pub leader: NodeId,
}

/// Outcome of an operation submitted to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    /// Whether the operation took effect
    pub accepted: bool,
    /// Outcome description shown to the caller
    pub message: String,
}

impl Acceptance {
    /// An accepted outcome
    pub fn ok(message: impl Into<String>) -> Self {
        Self { accepted: true, message: message.into() }
    }

    /// A rejected outcome
    pub fn rejected(message: impl Into<String>) -> Self {
        Self { accepted: false, message: message.into() }
    }
}

/// Mutual-exclusion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaRequestArgs {
    /// Lamport stamp of the request
    pub timestamp: u64,
    /// Requesting node
    pub node_id: NodeId,
    /// Requester's listen address, for the deferred reply
    pub addr: String,
}

/// Deferred mutual-exclusion reply, sent on release
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaReplyArgs {
    /// Replying node
    pub node_id: NodeId,
}

/// Election, coordinator announcement, and heartbeat payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BullyMessage {
    /// Sending node
    pub node_id: NodeId,
    /// Sender's rank
    pub rank: u32,
    /// Sender's listen address
    pub addr: String,
    /// Sender's coordinator epoch; zero during plain elections
    #[serde(default)]
    pub epoch: u64,
}

/// Request to take a local checkpoint, sent by the initiator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeCheckpointArgs {
    /// Coordinator that started the round
    pub initiator_id: NodeId,
    /// Lamport stamp of the round
    pub lamport_time: u64,
}

/// Acknowledgement of a checkpoint request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeCheckpointReply {
    /// Whether the local snapshot was persisted
    pub ok: bool,
    /// Failure description when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Responder's Lamport time after the snapshot
    pub lamport_stamp: u64,
}

/// A new item submitted through the boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItemArgs {
    /// Display name
    pub name: String,
    /// Short description
    pub description: String,
    /// Opening price, must be positive
    pub starting_price: u64,
    /// Open duration in seconds, must be positive
    pub duration_sec: u64,
}

/// Auction-level control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Open the current or next item and start its timer
    Start,
    /// Reset to the default seed and start over
    Restart,
}

/// Control request forwarded to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlArgs {
    /// What to do
    pub action: ControlAction,
}

/// A peer protocol request, tagged by method name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    /// 2PC phase 1: vote on a bid
    PrepareBid(PrepareArgs),
    /// 2PC phase 2: apply a decision
    DecideBid(DecisionArgs),
    /// Forward a bid from a follower to the coordinator
    SubmitBidToCoordinator(BidArgs),
    /// Forward a new item to the coordinator
    SubmitItemToCoordinator(NewItemArgs),
    /// Forward a start/restart action to the coordinator
    SubmitControlToCoordinator(ControlArgs),
    /// Pull the coordinator's state snapshot
    GetQueueState,
    /// Push a state snapshot to a follower
    SyncQueueState(QueueSnapshot),
    /// Mutual-exclusion request
    HandleRARequest(RaRequestArgs),
    /// Mutual-exclusion deferred reply
    HandleRADeferredReply(RaReplyArgs),
    /// Bully election probe
    HandleElection(BullyMessage),
    /// Coordinator announcement
    HandleCoordinator(BullyMessage),
    /// Coordinator heartbeat
    HandleHeartbeat(BullyMessage),
    /// Checkpoint round participation
    TakeCheckpoint(TakeCheckpointArgs),
}

impl Request {
    /// The method name this request dispatches to
    pub fn method(&self) -> &'static str {
        match self {
            Request::PrepareBid(_) => "PrepareBid",
            Request::DecideBid(_) => "DecideBid",
            Request::SubmitBidToCoordinator(_) => "SubmitBidToCoordinator",
            Request::SubmitItemToCoordinator(_) => "SubmitItemToCoordinator",
            Request::SubmitControlToCoordinator(_) => "SubmitControlToCoordinator",
            Request::GetQueueState => "GetQueueState",
            Request::SyncQueueState(_) => "SyncQueueState",
            Request::HandleRARequest(_) => "HandleRARequest",
            Request::HandleRADeferredReply(_) => "HandleRADeferredReply",
            Request::HandleElection(_) => "HandleElection",
            Request::HandleCoordinator(_) => "HandleCoordinator",
            Request::HandleHeartbeat(_) => "HandleHeartbeat",
            Request::TakeCheckpoint(_) => "TakeCheckpoint",
        }
    }
}

/// A peer protocol reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum Response {
    /// Vote on a prepared bid
    Prepare(PrepareReply),
    /// Decision acknowledged
    Decide(bool),
    /// Outcome of a forwarded bid
    SubmitBid(Acceptance),
    /// Outcome of a forwarded item
    SubmitItem(Acceptance),
    /// Outcome of a forwarded control action
    SubmitControl(Acceptance),
    /// Coordinator's state snapshot
    QueueState(QueueSnapshot),
    /// Snapshot applied?
    Sync(bool),
    /// Reply-now? (false means the reply was deferred)
    RaRequest(bool),
    /// Deferred reply acknowledged
    RaReply(bool),
    /// OK? (true means "I outrank you and will take over")
    Election(bool),
    /// Announcement accepted?
    Coordinator(bool),
    /// Heartbeat accepted?
    Heartbeat(bool),
    /// Checkpoint acknowledgement
    Checkpoint(TakeCheckpointReply),
}

/// Inbound side of the peer protocol
///
/// The node implements this; transports deliver decoded requests through it
/// and ship the reply back to the caller.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one request and produce its reply
    async fn dispatch(self: std::sync::Arc<Self>, request: Request) -> Response;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_method_name() {
        let req = Request::PrepareBid(PrepareArgs {
            txn_id: "Node1-7".into(),
            bid: BidArgs { amount: 500, bidder: "alice".into() },
            timestamp: 7,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "PrepareBid");
        assert_eq!(json["params"]["txnId"], "Node1-7");
        assert_eq!(json["params"]["bid"]["amount"], 500);

        let json = serde_json::to_value(Request::GetQueueState).unwrap();
        assert_eq!(json["method"], "GetQueueState");
    }

    #[test]
    fn control_actions_use_lowercase_wire_names() {
        let json = serde_json::to_value(ControlArgs { action: ControlAction::Restart }).unwrap();
        assert_eq!(json["action"], "restart");
        let parsed: ControlArgs = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.action, ControlAction::Restart);
    }

    #[test]
    fn responses_round_trip_through_the_envelope() {
        let resp = Response::Checkpoint(TakeCheckpointReply {
            ok: false,
            error: Some("disk full".into()),
            lamport_stamp: 42,
        });
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Checkpoint(reply) => {
                assert!(!reply.ok);
                assert_eq!(reply.error.as_deref(), Some("disk full"));
                assert_eq!(reply.lamport_stamp, 42);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
