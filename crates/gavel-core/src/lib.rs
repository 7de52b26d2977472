//! # gavel-core: coordination core of the gavel auction cluster
//!
//! A fixed set of peer nodes each hold a full copy of an ordered queue of
//! auction items and its current-item bidding state. Any node accepts bids;
//! the cluster elects one coordinator; bids commit only by majority quorum;
//! every node periodically checkpoints to disk so any subset can restart
//! and rejoin without losing committed results.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Node                                 │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────────┐  │
//! │  │ LamportClock │ │ AuctionState │ │ RaMutex (distributed CS) │  │
//! │  └──────────────┘ └──────────────┘ └──────────────────────────┘  │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────────┐  │
//! │  │ Bully leader │ │ 2PC bid      │ │ Item timer & anti-snipe  │  │
//! │  │ + heartbeats │ │ engine       │ │ (coordinator only)       │  │
//! │  └──────────────┘ └──────────────┘ └──────────────────────────┘  │
//! │  ┌──────────────────────────────┐ ┌──────────────────────────┐   │
//! │  │ Snapshot push / pull sync    │ │ Checkpoint engine        │   │
//! │  └──────────────────────────────┘ └──────────────────────────┘   │
//! └───────────────────────┬──────────────────────────────────────────┘
//!                         │ Transport (unary request/response)
//!                         ▼
//!                     peer nodes
//! ```
//!
//! The transport is a seam: [`transport::LocalRouter`] wires nodes together
//! in-process, and the API crate provides an HTTP-backed implementation for
//! real clusters.

#![warn(missing_docs)]

mod auction;
mod election;
mod mutex;
mod replication;
mod twopc;

pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod item;
pub mod node;
pub mod rpc;
pub mod state;
pub mod transport;

pub use checkpoint::{CheckpointData, CheckpointStore};
pub use clock::LamportClock;
pub use error::{Error, Result};
pub use item::{default_items, AuctionItem, ItemResult, NO_BIDS_WINNER};
pub use node::{parse_rank, Node, NodeConfig};
pub use rpc::{
    Acceptance, BidArgs, BullyMessage, ControlAction, ControlArgs, DecisionArgs, NewItemArgs,
    NodeId, PrepareArgs, PrepareReply, RaReplyArgs, RaRequestArgs, Request, Response, RpcService,
    TakeCheckpointArgs, TakeCheckpointReply,
};
pub use state::{AuctionState, QueueSnapshot};
pub use transport::{LocalRouter, LocalTransport, Transport};
