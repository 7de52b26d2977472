//! Coordinator-side auction flow
//!
//! Only the coordinator runs item timers. Each timer is keyed by
//! `(item id, deadline)` and revalidates both at fire time, so a timer
//! whose deadline was extended or whose item already closed returns
//! without side effects instead of needing cancellation. Deadline
//! extensions and queue advances always spawn a fresh timer bound to the
//! new key.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use crate::item::AuctionItem;
use crate::node::{now_unix, CoordinatorRoute, Node};
use crate::rpc::{Acceptance, ControlAction, NewItemArgs, Request, Response};
use crate::error::{Error, Result};

enum StartPlan {
    AlreadyRunning,
    Empty,
    Opened { item_id: String, deadline_unix: i64 },
}

impl Node {
    /// Pick up timer duty after winning an election
    ///
    /// A stored deadline is resumed as-is, even if it already passed; the
    /// timer then fires immediately and finalizes. An open item without a
    /// deadline gets a fresh one. With no open item the queue advances.
    pub(crate) async fn on_become_coordinator(self: Arc<Self>) {
        let current = {
            let state = self.state.lock();
            state
                .current_item
                .as_ref()
                .map(|item| (item.id.clone(), item.duration_sec, state.deadline_unix))
        };

        match current {
            Some((item_id, _, deadline_unix)) if deadline_unix > 0 => {
                info!(node = %self.config.id, item = %item_id, deadline = deadline_unix, "resuming item timer");
                self.spawn_item_timer(item_id, deadline_unix);
            }
            Some((item_id, duration_sec, _)) => {
                let deadline_unix = {
                    let mut state = self.state.lock();
                    state.deadline_unix = now_unix() + duration_sec as i64;
                    state.deadline_unix
                };
                info!(node = %self.config.id, item = %item_id, deadline = deadline_unix, "assigning fresh deadline");
                self.broadcast_snapshot();
                self.spawn_item_timer(item_id, deadline_unix);
            }
            None => self.start_next_item().await,
        }
    }

    /// Open the queue head, or wind the auction down when it is empty
    pub(crate) async fn start_next_item(self: Arc<Self>) {
        let (opened, deadline_unix) = {
            let mut state = self.state.lock();
            let opened = state.open_next(now_unix());
            (opened, state.deadline_unix)
        };

        match opened {
            Some(item) => {
                info!(
                    node = %self.config.id,
                    item = %item.name,
                    duration = item.duration_sec,
                    "item open for bidding"
                );
                self.broadcast_snapshot();
                let node = Arc::clone(&self);
                tokio::spawn(async move { node.initiate_global_checkpoint().await });
                self.spawn_item_timer(item.id, deadline_unix);
            }
            None => {
                info!(node = %self.config.id, "all auction items completed");
                self.broadcast_snapshot();
            }
        }
    }

    /// Arm a timer for `(item_id, deadline_unix)`
    pub(crate) fn spawn_item_timer(self: Arc<Self>, item_id: String, deadline_unix: i64) {
        tokio::spawn(async move {
            let remaining = deadline_unix - now_unix();
            if remaining > 0 {
                sleep(Duration::from_secs(remaining as u64)).await;
            }
            self.item_deadline_elapsed(item_id, deadline_unix).await;
        });
    }

    /// Timer body: finalize iff still coordinator and the key still matches
    pub(crate) async fn item_deadline_elapsed(self: Arc<Self>, item_id: String, deadline_unix: i64) {
        if !self.is_coordinator() {
            return;
        }
        let finalized = {
            let mut state = self.state.lock();
            let key_matches = state.current_item.as_ref().map(|i| i.id.as_str())
                == Some(item_id.as_str())
                && state.deadline_unix == deadline_unix;
            if key_matches {
                state.finalize_current()
            } else {
                None
            }
        };
        let Some(result) = finalized else { return };

        info!(
            node = %self.config.id,
            item = %result.item.name,
            winner = %result.winner,
            winning_bid = result.winning_bid,
            "item finalized"
        );
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.initiate_global_checkpoint().await });
        self.start_next_item().await;
    }

    /// Push the deadline out when a bid lands inside the closing window
    ///
    /// The timer armed for the old deadline will no-op at fire time, so a
    /// fresh one is bound to the new deadline here.
    pub(crate) fn maybe_extend_deadline(self: Arc<Self>) {
        let window = self.config.anti_snipe_window;
        let extended = {
            let mut state = self.state.lock();
            let open_item = state.current_item.as_ref().map(|item| item.id.clone());
            match open_item {
                Some(item_id) if state.active => {
                    let now = now_unix();
                    let remaining = state.deadline_unix - now;
                    if remaining < window {
                        state.deadline_unix = now + window;
                        Some((item_id, state.deadline_unix, remaining))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some((item_id, deadline_unix, remaining)) = extended {
            info!(
                node = %self.config.id,
                item = %item_id,
                had_left = remaining,
                "late bid extended the deadline"
            );
            self.broadcast_snapshot();
            self.spawn_item_timer(item_id, deadline_unix);
        }
    }

    /// Accept a new item on any node, forwarding to the coordinator
    pub async fn submit_item(self: Arc<Self>, args: NewItemArgs) -> Result<Acceptance> {
        match self.coordinator_route() {
            CoordinatorRoute::Local => Ok(self.coordinator_add_item(args).await),
            CoordinatorRoute::Remote(addr) => {
                match self
                    .transport
                    .call(&addr, Request::SubmitItemToCoordinator(args))
                    .await?
                {
                    Response::SubmitItem(outcome) => Ok(outcome),
                    _ => Err(Error::UnexpectedReply {
                        peer: addr,
                        method: "SubmitItemToCoordinator",
                    }),
                }
            }
            CoordinatorRoute::Unknown => Err(Error::CoordinatorUnavailable),
        }
    }

    /// Accept a start/restart action on any node, forwarding to the coordinator
    pub async fn submit_control(self: Arc<Self>, action: ControlAction) -> Result<Acceptance> {
        match self.coordinator_route() {
            CoordinatorRoute::Local => Ok(self.coordinator_control(action).await),
            CoordinatorRoute::Remote(addr) => {
                let args = crate::rpc::ControlArgs { action };
                match self
                    .transport
                    .call(&addr, Request::SubmitControlToCoordinator(args))
                    .await?
                {
                    Response::SubmitControl(outcome) => Ok(outcome),
                    _ => Err(Error::UnexpectedReply {
                        peer: addr,
                        method: "SubmitControlToCoordinator",
                    }),
                }
            }
            CoordinatorRoute::Unknown => Err(Error::CoordinatorUnavailable),
        }
    }

    /// Validate and queue a new item; coordinator only
    pub(crate) async fn coordinator_add_item(self: Arc<Self>, args: NewItemArgs) -> Acceptance {
        if args.name.is_empty()
            || args.description.is_empty()
            || args.starting_price == 0
            || args.duration_sec == 0
        {
            return Acceptance::rejected(
                "name, description, starting price, and duration are required",
            );
        }

        self.mutex.acquire().await;
        let item = {
            let mut state = self.state.lock();
            let sequence = state.results.len()
                + state.queue.len()
                + usize::from(state.current_item.is_some())
                + 1;
            let item = AuctionItem {
                id: format!("item-{sequence}"),
                name: args.name,
                description: args.description,
                emoji: String::new(),
                starting_price: args.starting_price,
                duration_sec: args.duration_sec,
            };
            state.queue.push_back(item.clone());
            item
        };
        self.mutex.release();

        info!(node = %self.config.id, item = %item.id, name = %item.name, "item queued");
        self.broadcast_snapshot();
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.initiate_global_checkpoint().await });
        Acceptance::ok("Item added to queue")
    }

    /// Run a start/restart action; coordinator only
    pub(crate) async fn coordinator_control(self: Arc<Self>, action: ControlAction) -> Acceptance {
        match action {
            ControlAction::Start => self.control_start().await,
            ControlAction::Restart => self.control_restart().await,
        }
    }

    async fn control_start(self: Arc<Self>) -> Acceptance {
        self.mutex.acquire().await;
        let plan = {
            let mut state = self.state.lock();
            let now = now_unix();
            let reopen = state
                .current_item
                .as_ref()
                .map(|item| (item.id.clone(), item.duration_sec));
            if state.active && reopen.is_some() && state.deadline_unix > now {
                StartPlan::AlreadyRunning
            } else if let Some((item_id, duration)) = reopen {
                // Re-open the interrupted item without resetting its bids.
                state.active = true;
                state.deadline_unix = now + duration as i64;
                StartPlan::Opened { item_id, deadline_unix: state.deadline_unix }
            } else {
                state.active = true;
                match state.open_next(now) {
                    Some(item) => {
                        StartPlan::Opened { item_id: item.id, deadline_unix: state.deadline_unix }
                    }
                    None => StartPlan::Empty,
                }
            }
        };
        self.mutex.release();

        match plan {
            StartPlan::AlreadyRunning => Acceptance::ok("Auction already running"),
            StartPlan::Empty => Acceptance::rejected("No items available to start"),
            StartPlan::Opened { item_id, deadline_unix } => {
                info!(node = %self.config.id, item = %item_id, "auction started");
                self.broadcast_snapshot();
                let node = Arc::clone(&self);
                tokio::spawn(async move { node.initiate_global_checkpoint().await });
                self.spawn_item_timer(item_id, deadline_unix);
                Acceptance::ok("Auction started")
            }
        }
    }

    async fn control_restart(self: Arc<Self>) -> Acceptance {
        self.mutex.acquire().await;
        let (item_id, deadline_unix) = {
            let mut state = self.state.lock();
            let first = state.reset_to_seed(now_unix());
            (first.id, state.deadline_unix)
        };
        self.mutex.release();

        info!(node = %self.config.id, "auction restarted from the default seed");
        self.broadcast_snapshot();
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.initiate_global_checkpoint().await });
        self.spawn_item_timer(item_id, deadline_unix);
        Acceptance::ok("Auction restarted")
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

    fn lone_node(dir: &tempfile::TempDir) -> Arc<Node> {
        let config = NodeConfig::new("Node1", "node1:0", vec![]).with_checkpoint_dir(dir.path());
        Node::new(config, Arc::new(DeadTransport)).unwrap()
    }

    #[tokio::test]
    async fn a_late_bid_extends_the_deadline_to_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let now = now_unix();
        node.state.lock().deadline_unix = now + 14;

        Arc::clone(&node).maybe_extend_deadline();

        let deadline = node.state.lock().deadline_unix;
        assert!(deadline > now + 14, "deadline should move out, got {deadline}");
        assert!(deadline - now <= 16, "deadline should land at the window edge");
    }

    #[tokio::test]
    async fn an_early_bid_leaves_the_deadline_alone() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let deadline = now_unix() + 16;
        node.state.lock().deadline_unix = deadline;

        Arc::clone(&node).maybe_extend_deadline();
        assert_eq!(node.state.lock().deadline_unix, deadline);
    }

    #[tokio::test]
    async fn a_timer_with_a_stale_key_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let deadline = now_unix() + 100;
        node.state.lock().deadline_unix = deadline;

        // Extended deadline: the old key no longer matches.
        Arc::clone(&node)
            .item_deadline_elapsed("item-1".into(), deadline - 50)
            .await;
        assert!(node.state.lock().results.is_empty());
        assert!(node.state.lock().current_item.is_some());

        // Wrong item id.
        Arc::clone(&node)
            .item_deadline_elapsed("item-9".into(), deadline)
            .await;
        assert!(node.state.lock().results.is_empty());
    }

    #[tokio::test]
    async fn a_matching_timer_finalizes_and_advances_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let deadline = now_unix() + 100;
        {
            let mut state = node.state.lock();
            state.deadline_unix = deadline;
            state.commit_bid(750, "alice");
        }

        Arc::clone(&node)
            .item_deadline_elapsed("item-1".into(), deadline)
            .await;

        let state = node.state.lock();
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].winner, "alice");
        assert_eq!(state.results[0].winning_bid, 750);
        assert_eq!(state.current_item.as_ref().map(|i| i.id.as_str()), Some("item-2"));
        assert!(state.deadline_unix > now_unix());
    }

    #[tokio::test]
    async fn taking_over_without_a_deadline_assigns_one() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        assert_eq!(node.state.lock().deadline_unix, 0);

        Arc::clone(&node).on_become_coordinator().await;
        let deadline = node.state.lock().deadline_unix;
        assert!(deadline >= now_unix() + 119, "expected a fresh full deadline, got {deadline}");
    }

    #[tokio::test]
    async fn added_items_get_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);

        let outcome = Arc::clone(&node)
            .coordinator_add_item(NewItemArgs {
                name: "Antique Clock".into(),
                description: "Early pendulum movement".into(),
                starting_price: 250,
                duration_sec: 60,
            })
            .await;
        assert!(outcome.accepted);

        let state = node.state.lock();
        // 0 results + 5 queued + 1 open item => the new item is item-7.
        assert_eq!(state.queue.back().map(|i| i.id.as_str()), Some("item-7"));
    }

    #[tokio::test]
    async fn invalid_items_are_rejected_at_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        let outcome = Arc::clone(&node)
            .coordinator_add_item(NewItemArgs {
                name: String::new(),
                description: "x".into(),
                starting_price: 10,
                duration_sec: 10,
            })
            .await;
        assert!(!outcome.accepted);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_an_item_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);

        let first = Arc::clone(&node).coordinator_control(ControlAction::Start).await;
        assert!(first.accepted);
        assert!(node.state.lock().deadline_unix > now_unix());

        let second = Arc::clone(&node).coordinator_control(ControlAction::Start).await;
        assert!(second.accepted);
        assert_eq!(second.message, "Auction already running");
    }

    #[tokio::test]
    async fn restart_resets_everything_to_the_seed() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(&dir);
        {
            let mut state = node.state.lock();
            state.deadline_unix = now_unix() + 100;
            state.commit_bid(900, "bob");
            state.finalize_current();
        }

        let outcome = Arc::clone(&node).coordinator_control(ControlAction::Restart).await;
        assert!(outcome.accepted);

        let state = node.state.lock();
        assert!(state.results.is_empty());
        assert_eq!(state.current_item.as_ref().map(|i| i.id.as_str()), Some("item-1"));
        assert_eq!(state.current_highest_bid, 499);
        assert!(state.active);
    }
}
